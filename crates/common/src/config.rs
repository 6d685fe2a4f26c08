use std::time::Duration;

use crate::{Timeframe, TradingMode};

/// Process-level configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
///
/// Strategy and risk parameters live in the strategy TOML file
/// (`strategy::StrategyFileConfig`), not here.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials (required in live mode only)
    pub binance_api_key: String,
    pub binance_secret: String,
    pub binance_base_url: Option<String>,

    // Trading
    pub trading_mode: TradingMode,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub lookback: usize,
    pub paper_slippage_bps: f64,
    pub paper_balance: f64,

    // Scheduling and venue call discipline
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub order_delay: Duration,
    pub fetch_concurrency: usize,

    // Persistence
    pub state_path: String,
    pub database_url: Option<String>,

    // Strategy config file path
    pub strategy_config_path: String,

    // Telegram (alerts and commands are off unless both are set)
    pub telegram_token: Option<String>,
    pub telegram_allowed_user_ids: Vec<i64>,

    // Dashboard (served only when a token is set)
    pub dashboard_token: Option<String>,
    pub dashboard_port: u16,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing or malformed required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match optional_env("TRADING_MODE")
            .unwrap_or_else(|| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => panic!("ERROR: TRADING_MODE must be 'paper' or 'live', got: '{other}'"),
        };

        let (binance_api_key, binance_secret) = match trading_mode {
            TradingMode::Live => (required_env("BINANCE_API_KEY"), required_env("BINANCE_SECRET")),
            TradingMode::Paper => (
                optional_env("BINANCE_API_KEY").unwrap_or_default(),
                optional_env("BINANCE_SECRET").unwrap_or_default(),
            ),
        };

        let symbols = parse_symbols(&optional_env("SYMBOLS").unwrap_or_else(|| "BTCUSDT".into()));
        if symbols.is_empty() {
            panic!("SYMBOLS must list at least one trading pair");
        }

        let timeframe_raw = optional_env("TIMEFRAME").unwrap_or_else(|| "15m".to_string());
        let timeframe = timeframe_raw
            .parse::<Timeframe>()
            .unwrap_or_else(|e| panic!("TIMEFRAME: {e}"));

        let telegram_allowed_user_ids = optional_env("TELEGRAM_ALLOWED_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<i64>().unwrap_or_else(|_| {
                            panic!("TELEGRAM_ALLOWED_USER_IDS contains non-numeric ID: '{s}'")
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let order_delay_default = match trading_mode {
            TradingMode::Live => 4.0_f64,
            TradingMode::Paper => 0.0,
        };

        Config {
            binance_api_key,
            binance_secret,
            binance_base_url: optional_env("BINANCE_BASE_URL"),
            trading_mode,
            symbols,
            timeframe,
            lookback: parsed_env("LOOKBACK", 200usize).max(2),
            paper_slippage_bps: parsed_env("PAPER_SLIPPAGE_BPS", 10.0),
            paper_balance: parsed_env("PAPER_BALANCE", 10_000.0),
            poll_interval: Duration::from_secs(parsed_env("POLL_INTERVAL_SECS", 300u64).max(10)),
            call_timeout: Duration::from_secs(parsed_env("CALL_TIMEOUT_SECS", 30u64).max(1)),
            max_retries: parsed_env("MAX_RETRIES", 2u32),
            order_delay: Duration::from_secs_f64(
                parsed_env("ORDER_DELAY_SECONDS", order_delay_default).max(0.0),
            ),
            fetch_concurrency: parsed_env("FETCH_CONCURRENCY", 4usize).max(1),
            state_path: optional_env("STATE_PATH")
                .unwrap_or_else(|| "data/bot_state.json".to_string()),
            database_url: optional_env("DATABASE_URL").filter(|s| !s.is_empty()),
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategy.toml".to_string()),
            telegram_token: optional_env("TELEGRAM_TOKEN").filter(|s| !s.is_empty()),
            telegram_allowed_user_ids,
            dashboard_token: optional_env("DASHBOARD_TOKEN").filter(|s| !s.is_empty()),
            dashboard_port: parsed_env("DASHBOARD_PORT", 8080u16),
        }
    }
}

/// Split a comma-separated symbol list, upper-casing and dropping blanks and duplicates.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for s in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !s.is_empty() && !symbols.contains(&s) {
            symbols.push(s);
        }
    }
    symbols
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string())
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional_env(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
