use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use common::{
    Candle, CloseFill, Error, ExecutionVenue, Fill, InstrumentSpec, MarketData, OrderRequest,
    Result, Side, Timeframe, VenuePosition,
};

const BASE_URL: &str = "https://fapi.binance.com";
const QUOTE_ASSET: &str = "USDT";
/// Binance error code for an unknown symbol.
const INVALID_SYMBOL: i64 = -1121;

/// REST client for Binance USDⓈ-M futures. Serves candles and executes
/// orders with a reduce-only stop-loss / take-profit bracket.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: Client,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

/// Exchange filters needed to format orders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub lot: InstrumentSpec,
    pub tick_size: f64,
}

impl BinanceClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            http,
            filters: Mutex::new(HashMap::new()),
        })
    }

    fn sign(&self, query: &str) -> String {
        sign_query(&self.secret, query)
    }

    async fn public_get(&self, path: &str, params: &str) -> Result<String> {
        let url = format!("{}{path}?{params}", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(|e| Error::Http(e.to_string()))?;
        read_body(resp).await
    }

    async fn signed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        let ts = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("recvWindow=5000&timestamp={ts}")
        } else {
            format!("{params}&recvWindow=5000&timestamp={ts}")
        };
        let signature = self.sign(&query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        read_body(resp).await
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.lock().await.get(symbol) {
            return Ok(*f);
        }
        let body = self.public_get("/fapi/v1/exchangeInfo", "").await?;
        let all = parse_filters(&body)?;
        let mut cache = self.filters.lock().await;
        cache.extend(all);
        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::InvalidSymbol(symbol.to_string()))
    }

    async fn position_amount(&self, symbol: &str) -> Result<f64> {
        let body = self.signed(Method::GET, "/fapi/v2/positionRisk", &format!("symbol={symbol}")).await?;
        let rows: Vec<PositionRiskRow> = parse_json(&body)?;
        Ok(rows
            .iter()
            .filter(|r| r.symbol == symbol)
            .map(|r| parse_num(&r.position_amt))
            .sum())
    }

    async fn market_order(&self, symbol: &str, side: Side, quantity: f64, extra: &str) -> Result<OrderResponse> {
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={}&newOrderRespType=RESULT{extra}",
            order_side(side),
            format_decimal(quantity)
        );
        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        parse_json(&body)
    }

    async fn bracket_order(&self, symbol: &str, side: Side, kind: &str, stop_price: f64) -> Result<()> {
        let params = format!(
            "symbol={symbol}&side={}&type={kind}&stopPrice={}&closePosition=true&workingType=MARK_PRICE",
            order_side(side.opposite()),
            format_decimal(stop_price)
        );
        self.signed(Method::POST, "/fapi/v1/order", &params).await.map(|_| ())
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<Candle>> {
        let interval = interval_code(timeframe)?;
        let limit = count.clamp(1, 1500);
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        match self.public_get("/fapi/v1/klines", &params).await {
            Ok(body) => parse_klines(&body).map_err(|e| Error::MarketData {
                symbol: symbol.to_string(),
                transient: false,
                message: e.to_string(),
            }),
            Err(Error::Venue(msg)) if msg.contains(&INVALID_SYMBOL.to_string()) => {
                Err(Error::InvalidSymbol(symbol.to_string()))
            }
            Err(e) => Err(Error::MarketData {
                symbol: symbol.to_string(),
                transient: e.is_transient(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ExecutionVenue for BinanceClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<Fill> {
        let filters = self.symbol_filters(&order.symbol).await?;

        self.signed(
            Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={}&leverage={}", order.symbol, order.leverage),
        )
        .await?;

        debug!(symbol = %order.symbol, side = %order.side, "Submitting entry to Binance");
        let resp = self
            .market_order(
                &order.symbol,
                order.side,
                order.quantity,
                &format!("&newClientOrderId={}", client_order_id(&order.id)),
            )
            .await?;

        let fill_price = parse_num(&resp.avg_price);
        let quantity = parse_num(&resp.executed_qty);
        if !(fill_price > 0.0) || !(quantity > 0.0) {
            return Err(Error::Venue(format!("order {} not filled: {resp:?}", resp.order_id)));
        }

        // The entry is live from here on. Bracket failures are logged; the
        // engine still enforces the stop on every cycle.
        let sl = round_to_tick(order.stop_loss, filters.tick_size);
        let tp = round_to_tick(order.take_profit, filters.tick_size);
        if let Err(e) = self.bracket_order(&order.symbol, order.side, "STOP_MARKET", sl).await {
            error!(symbol = %order.symbol, error = %e, "Failed to place stop-loss order");
        }
        if let Err(e) = self.bracket_order(&order.symbol, order.side, "TAKE_PROFIT_MARKET", tp).await {
            error!(symbol = %order.symbol, error = %e, "Failed to place take-profit order");
        }

        Ok(Fill {
            order_id: resp.order_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            fill_price,
            quantity,
            timestamp: Utc::now(),
        })
    }

    async fn close_position(&self, symbol: &str) -> Result<CloseFill> {
        let amount = self.position_amount(symbol).await?;
        self.signed(Method::DELETE, "/fapi/v1/allOpenOrders", &format!("symbol={symbol}"))
            .await?;
        if amount == 0.0 {
            return Err(Error::Venue(format!("no open position on {symbol}")));
        }
        let side = if amount > 0.0 { Side::Short } else { Side::Long };
        let resp = self
            .market_order(symbol, side, amount.abs(), "&reduceOnly=true")
            .await?;
        info!(symbol, order_id = resp.order_id, "Position closed on Binance");
        Ok(CloseFill {
            symbol: symbol.to_string(),
            fill_price: parse_num(&resp.avg_price),
            timestamp: Utc::now(),
        })
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>> {
        let body = self.signed(Method::GET, "/fapi/v2/positionRisk", "").await?;
        parse_positions(&body)
    }

    async fn balance(&self) -> Result<f64> {
        let body = self.signed(Method::GET, "/fapi/v2/balance", "").await?;
        let rows: Vec<BalanceRow> = parse_json(&body)?;
        rows.iter()
            .find(|r| r.asset == QUOTE_ASSET)
            .map(|r| parse_num(&r.available_balance))
            .ok_or_else(|| Error::Venue(format!("no {QUOTE_ASSET} balance reported")))
    }

    async fn instrument(&self, symbol: &str) -> Result<InstrumentSpec> {
        Ok(self.symbol_filters(symbol).await?.lot)
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn read_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
    if status.is_success() {
        return Ok(body);
    }
    // Throttling and server-side failures are worth another try.
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(Error::Http(format!("HTTP {status}: {body}")));
    }
    Err(Error::Venue(format!("HTTP {status}: {body}")))
}

pub(crate) fn sign_query(secret: &str, query: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Venue(format!("unexpected response: {e}")))
}

fn parse_num(raw: &str) -> f64 {
    raw.parse().unwrap_or(0.0)
}

fn order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

/// Binance caps client order ids at 36 characters of `[.A-Z:/a-z0-9_-]`.
fn client_order_id(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').take(36).collect()
}

/// Kline interval code for `timeframe`.
pub fn interval_code(timeframe: Timeframe) -> Result<&'static str> {
    Ok(match timeframe.minutes() {
        1 => "1m",
        3 => "3m",
        5 => "5m",
        15 => "15m",
        30 => "30m",
        60 => "1h",
        120 => "2h",
        240 => "4h",
        360 => "6h",
        480 => "8h",
        720 => "12h",
        1440 => "1d",
        4320 => "3d",
        10080 => "1w",
        other => return Err(Error::Config(format!("Binance has no {other}-minute klines"))),
    })
}

fn format_decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick > 0.0 {
        (price / tick).round() * tick
    } else {
        price
    }
}

/// Parse `/fapi/v1/klines`: arrays of `[openTime, open, high, low, close, volume, ...]`.
pub fn parse_klines(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<serde_json::Value>> = parse_json(body)?;
    rows.iter()
        .map(|row| -> Result<Candle> {
            let num = |i: usize| -> Result<f64> {
                row.get(i)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Venue(format!("bad kline field {i}")))
            };
            let open_ms = row
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::Venue("kline without open time".into()))?;
            let timestamp = Utc
                .timestamp_millis_opt(open_ms)
                .single()
                .ok_or_else(|| Error::Venue(format!("bad kline open time {open_ms}")))?;
            Ok(Candle {
                timestamp,
                open: num(1)?,
                high: num(2)?,
                low: num(3)?,
                close: num(4)?,
                volume: num(5)?,
            })
        })
        .collect()
}

/// Parse `/fapi/v2/positionRisk`, keeping non-zero positions.
pub fn parse_positions(body: &str) -> Result<Vec<VenuePosition>> {
    let rows: Vec<PositionRiskRow> = parse_json(body)?;
    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let amount = parse_num(&r.position_amt);
            if amount == 0.0 {
                return None;
            }
            let mark = parse_num(&r.mark_price);
            Some(VenuePosition {
                symbol: r.symbol,
                side: if amount > 0.0 { Side::Long } else { Side::Short },
                entry_price: parse_num(&r.entry_price),
                quantity: amount.abs(),
                mark_price: (mark > 0.0).then_some(mark),
            })
        })
        .collect())
}

/// Parse `/fapi/v1/exchangeInfo` into per-symbol lot and price filters.
pub fn parse_filters(body: &str) -> Result<HashMap<String, SymbolFilters>> {
    let info: ExchangeInfo = parse_json(body)?;
    Ok(info
        .symbols
        .into_iter()
        .map(|s| {
            let mut filters = SymbolFilters { lot: InstrumentSpec::default(), tick_size: 0.0 };
            for f in &s.filters {
                match f.filter_type.as_str() {
                    "LOT_SIZE" => {
                        filters.lot = InstrumentSpec {
                            min_quantity: f.min_qty.as_deref().map(parse_num).unwrap_or(0.0),
                            quantity_step: f.step_size.as_deref().map(parse_num).unwrap_or(0.0),
                        };
                    }
                    "PRICE_FILTER" => {
                        filters.tick_size = f.tick_size.as_deref().map(parse_num).unwrap_or(0.0);
                    }
                    _ => {}
                }
            }
            (s.symbol, filters)
        })
        .collect())
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    executed_qty: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRow {
    symbol: String,
    position_amt: String,
    entry_price: String,
    #[serde(default)]
    mark_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRow {
    asset: String,
    available_balance: String,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<FilterInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterInfo {
    filter_type: String,
    min_qty: Option<String>,
    step_size: Option<String>,
    tick_size: Option<String>,
}
