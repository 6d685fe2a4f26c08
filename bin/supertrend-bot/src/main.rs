use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use teloxide::{types::ChatId, Bot};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    config::parse_symbols, Config, EngineCommand, ExecutionVenue, MarketData, Timeframe,
    TradeEvent, TradingMode,
};
use engine::{BinanceClient, CallPolicy, Engine, Trader, TraderSettings, VenueExecutor};
use paper::{PaperFeed, PaperVenue};
use strategy::{StrategyFileConfig, SupertrendStrategy};
use telegram_ctrl::{forward_events, start_bot, BotDeps};

/// Supertrend trailing-stop bot for Binance USDⓈ-M futures.
///
/// Settings come from the environment (and `.env`); flags override them.
#[derive(Parser, Debug)]
#[command(name = "supertrend-bot", version, about, long_about = None)]
struct Args {
    /// Simulate fills locally, whatever TRADING_MODE says
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Seconds between cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Comma-separated symbols, e.g. BTCUSDT,ETHUSDT
    #[arg(long)]
    symbols: Option<String>,

    /// Candle timeframe, e.g. 15m, 1h, 1d
    #[arg(long)]
    timeframe: Option<String>,

    /// Path of the JSON state file
    #[arg(long)]
    state_file: Option<String>,

    /// Path of the strategy TOML file
    #[arg(long)]
    config: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, cfg: &mut Config) -> Result<()> {
        if self.dry_run {
            cfg.trading_mode = TradingMode::Paper;
            cfg.order_delay = Duration::ZERO;
        }
        if let Some(secs) = self.interval {
            cfg.poll_interval = Duration::from_secs(secs.max(10));
        }
        if let Some(raw) = &self.symbols {
            let symbols = parse_symbols(raw);
            anyhow::ensure!(!symbols.is_empty(), "--symbols must list at least one symbol");
            cfg.symbols = symbols;
        }
        if let Some(raw) = &self.timeframe {
            cfg.timeframe = raw.parse::<Timeframe>()?;
        }
        if let Some(path) = &self.state_file {
            cfg.state_path = path.clone();
        }
        if let Some(path) = &self.config {
            cfg.strategy_config_path = path.clone();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging ──────────────────────────────────────────────────────────────
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let mut cfg = Config::from_env();
    args.apply(&mut cfg)?;
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path)?;
    let needed = strategy_file.required_history() + 1;
    if cfg.lookback < needed {
        warn!(lookback = cfg.lookback, needed, "LOOKBACK too short for the strategy, raising it");
        cfg.lookback = needed;
    }
    info!(
        mode = %cfg.trading_mode,
        symbols = ?cfg.symbols,
        timeframe = cfg.timeframe.minutes(),
        interval = ?cfg.poll_interval,
        "Supertrend bot starting"
    );

    // ── State store ───────────────────────────────────────────────────────────
    let store = store::open(&cfg).await.context("opening state store")?;

    // ── Venue (injected based on TRADING_MODE) ────────────────────────────────
    let binance = Arc::new(BinanceClient::new(
        cfg.binance_api_key.clone(),
        cfg.binance_secret.clone(),
        cfg.binance_base_url.clone(),
    )?);
    let (market, venue): (Arc<dyn MarketData>, Arc<dyn ExecutionVenue>) = match cfg.trading_mode {
        TradingMode::Live => {
            warn!("LIVE trading mode, real orders will be sent");
            let market: Arc<dyn MarketData> = binance.clone();
            let venue: Arc<dyn ExecutionVenue> = binance;
            (market, venue)
        }
        TradingMode::Paper => {
            info!(
                balance = cfg.paper_balance,
                slippage_bps = cfg.paper_slippage_bps,
                "Paper trading mode, fills are simulated"
            );
            // Public klines need no credentials.
            let paper = Arc::new(PaperVenue::new(cfg.paper_balance, cfg.paper_slippage_bps));
            let market: Arc<dyn MarketData> = Arc::new(PaperFeed::new(binance, paper.clone()));
            let venue: Arc<dyn ExecutionVenue> = paper;
            (market, venue)
        }
    };

    // ── Trader ────────────────────────────────────────────────────────────────
    let (events, _) = broadcast::channel::<TradeEvent>(256);
    let executor = VenueExecutor::new(market, venue, CallPolicy::from_config(&cfg));
    let mut trader = Trader::new(
        TraderSettings::from_config(&cfg),
        SupertrendStrategy::new(strategy_file),
        executor,
        store,
    )
    .with_events(events.clone());

    trader.restore().await.context("restoring position book")?;
    let report = trader
        .reconcile()
        .await
        .context("startup reconciliation with the venue failed")?;
    info!(
        adopted = ?report.adopted,
        closed_on_venue = ?report.closed_on_venue,
        open = trader.book().open_count(),
        "Startup reconciliation complete"
    );

    if args.once {
        let report = trader.run_cycle().await.context("cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // ── Engine ────────────────────────────────────────────────────────────────
    let (engine, handle) = Engine::new(trader, cfg.poll_interval, events);
    let engine_task = tokio::spawn(engine.run());

    // ── Telegram ──────────────────────────────────────────────────────────────
    match &cfg.telegram_token {
        Some(token) if !cfg.telegram_allowed_user_ids.is_empty() => {
            let bot = Bot::new(token.clone());
            let chat_ids: Vec<ChatId> = cfg.telegram_allowed_user_ids.iter().map(|&id| ChatId(id)).collect();
            tokio::spawn(forward_events(bot.clone(), chat_ids, handle.subscribe_events()));
            tokio::spawn(start_bot(
                bot,
                BotDeps {
                    engine: handle.clone(),
                    trading_mode: cfg.trading_mode,
                    allowed_user_ids: Arc::new(cfg.telegram_allowed_user_ids.clone()),
                },
            ));
        }
        Some(_) => warn!("TELEGRAM_TOKEN set without TELEGRAM_ALLOWED_USER_IDS, Telegram disabled"),
        None => info!("Telegram disabled"),
    }

    // ── HTTP API ──────────────────────────────────────────────────────────────
    if let Some(token) = &cfg.dashboard_token {
        let state = api::AppState {
            engine: handle.clone(),
            trading_mode: cfg.trading_mode,
            dashboard_token: Arc::from(token.as_str()),
        };
        let port = cfg.dashboard_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                error!(error = %e, "HTTP API stopped");
            }
        });
    }

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing the current cycle");
    handle.send(EngineCommand::Stop).await;
    engine_task.await?;
    info!("Engine stopped. Exiting.");
    Ok(())
}
