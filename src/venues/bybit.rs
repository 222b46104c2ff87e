//! Bybit venue adapter
//!
//! Spot top-of-book via the v5 public tickers stream, order management via
//! the signed v5 REST API. Bybit throttles reconnect storms hard, so this
//! adapter runs the conservative stream profile (longer backoff, small
//! subscribe batches). Ticker deltas may omit the book fields; those frames
//! synthesize a quote around the last trade and are tagged accordingly.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::auth::{sign_hex, ServerTimeOffset};
use super::session::{Backoff, StreamConfig};
use super::{OrderBook, QuoteSink, TickerSummary, VenueAdapter};
use crate::config::VenueConfig;
use crate::models::{
    epoch_now, Balance, FeeSchedule, Order, OrderSide, OrderStatus, OrderType, Quote,
};

const MAINNET_REST: &str = "https://api.bybit.com";
const TESTNET_REST: &str = "https://api-testnet.bybit.com";
const MAINNET_STREAM: &str = "wss://stream.bybit.com/v5/public/spot";
const TESTNET_STREAM: &str = "wss://stream-testnet.bybit.com/v5/public/spot";

const RECV_WINDOW: &str = "5000";

pub struct BybitAdapter {
    name: String,
    config: VenueConfig,
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    stream_config: StreamConfig,
    time_offset: ServerTimeOffset,
    sink: Mutex<Option<QuoteSink>>,
    running: Arc<AtomicBool>,
    stream_handle: Mutex<Option<JoinHandle<()>>>,
    session_denied: Arc<Mutex<HashSet<String>>>,
}

impl BybitAdapter {
    pub fn new(name: String, config: VenueConfig) -> Self {
        let (base_url, ws_url) = if config.testnet {
            (TESTNET_REST.to_string(), TESTNET_STREAM.to_string())
        } else {
            (MAINNET_REST.to_string(), MAINNET_STREAM.to_string())
        };
        Self {
            name,
            config,
            http: reqwest::Client::new(),
            base_url,
            ws_url,
            stream_config: StreamConfig::conservative(),
            time_offset: ServerTimeOffset::new(),
            sink: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            stream_handle: Mutex::new(None),
            session_denied: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn public_request(&self, path: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        let body: serde_json::Value = response.json().await.context("decoding response")?;
        let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code != 0 {
            bail!("bybit API error: {}", body);
        }
        Ok(body)
    }

    async fn sync_server_time(&self) -> Result<()> {
        let body = self.public_request("/v5/market/time", &[]).await?;
        if let Some(seconds) = body
            .pointer("/result/timeSecond")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            self.time_offset.sync(seconds * 1000);
        }
        Ok(())
    }

    /// v5 signature: HMAC-SHA256 over timestamp + key + recv_window +
    /// (query string for GET, JSON body for POST). One retry after clock
    /// resync on retCode 10002.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        for attempt in 0..2 {
            let timestamp = self.time_offset.now_ms().to_string();
            let query_string = query
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join("&");
            let body_string = body.map(|b| b.to_string()).unwrap_or_default();
            let payload = if method == reqwest::Method::GET {
                format!("{}{}{}{}", timestamp, self.config.api_key, RECV_WINDOW, query_string)
            } else {
                format!("{}{}{}{}", timestamp, self.config.api_key, RECV_WINDOW, body_string)
            };
            let signature = sign_hex(&self.config.api_secret, &payload)?;

            let mut request = self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("X-BAPI-API-KEY", &self.config.api_key)
                .header("X-BAPI-TIMESTAMP", &timestamp)
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                .header("X-BAPI-SIGN", signature);
            if method == reqwest::Method::GET {
                request = request.query(query);
            } else if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("{} {}", method, path))?;
            let value: serde_json::Value = response.json().await.context("decoding response")?;
            let ret_code = value.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
            if ret_code == 0 {
                return Ok(value);
            }
            if ret_code == 10002 && attempt == 0 {
                warn!("bybit rejected request timestamp, resyncing clock");
                self.sync_server_time().await?;
                continue;
            }
            bail!("bybit API error: {}", value);
        }
        bail!("bybit signed request failed after clock resync")
    }

    fn parse_order(&self, symbol: &str, entry: &serde_json::Value) -> Order {
        let filled = json_f64(entry, "cumExecQty");
        Order {
            order_id: entry
                .get("orderId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            side: if entry.get("side").and_then(|v| v.as_str()) == Some("Sell") {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            order_type: if entry.get("orderType").and_then(|v| v.as_str()) == Some("Limit") {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity: json_f64(entry, "qty"),
            price: Some(json_f64(entry, "price")).filter(|p| *p > 0.0),
            status: map_status(entry.get("orderStatus").and_then(|v| v.as_str()).unwrap_or("")),
            filled_quantity: filled,
            average_price: Some(json_f64(entry, "avgPrice")).filter(|p| *p > 0.0),
            timestamp: epoch_now(),
        }
    }
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "New" | "Created" | "Untriggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Canceled,
        "Rejected" => OrderStatus::Rejected,
        other => {
            debug!("unmapped bybit order status '{}'", other);
            OrderStatus::New
        }
    }
}

fn json_f64(value: &serde_json::Value, key: &str) -> f64 {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

/// Pull the offending symbol out of a subscription rejection like
/// `Invalid symbol :[tickers.XYZUSDT]`.
fn extract_denied_symbol(ret_msg: &str) -> Option<String> {
    let start = ret_msg.find("tickers.")? + "tickers.".len();
    let rest = &ret_msg[start..];
    let end = rest.find(|c: char| !c.is_ascii_alphanumeric()).unwrap_or(rest.len());
    let symbol = &rest[..end];
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_string())
    }
}

/// Ticker frame to quote. Snapshot frames carry the book; delta frames may
/// only carry the last trade, which synthesizes a tagged quote at ±0.01%.
fn parse_ticker(venue: &str, text: &str, denied: &Mutex<HashSet<String>>) -> Option<Quote> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("{}: skipping malformed frame: {}", venue, e);
            return None;
        }
    };

    if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
        if op == "subscribe" && value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let ret_msg = value.get("ret_msg").and_then(|v| v.as_str()).unwrap_or("");
            warn!("{}: subscription rejected: {}", venue, ret_msg);
            if let Some(symbol) = extract_denied_symbol(ret_msg) {
                denied.lock().insert(symbol);
            }
        }
        return None;
    }

    let topic = value.get("topic").and_then(|v| v.as_str())?;
    if !topic.starts_with("tickers.") {
        return None;
    }
    let data = value.get("data")?;
    let symbol = data.get("symbol").and_then(|v| v.as_str())?;
    let timestamp = value
        .get("ts")
        .and_then(|v| v.as_i64())
        .map(|ms| ms as f64 / 1000.0)
        .unwrap_or_else(epoch_now);

    let bid = json_f64(data, "bid1Price");
    let ask = json_f64(data, "ask1Price");
    if bid > 0.0 && ask > 0.0 {
        return Some(Quote {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            bid,
            ask,
            bid_size: json_f64(data, "bid1Size"),
            ask_size: json_f64(data, "ask1Size"),
            timestamp,
            synthetic: false,
        });
    }

    let last = json_f64(data, "lastPrice");
    if last <= 0.0 {
        return None;
    }
    Some(Quote {
        venue: venue.to_string(),
        symbol: symbol.to_string(),
        bid: last * 0.9999,
        ask: last * 1.0001,
        bid_size: 0.0,
        ask_size: 0.0,
        timestamp,
        synthetic: true,
    })
}

async fn run_stream(
    venue: String,
    ws_url: String,
    topics: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    config: StreamConfig,
    denied: Arc<Mutex<HashSet<String>>>,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut retries = 0u32;

    while running.load(Ordering::SeqCst) {
        match connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => {
                info!("{} stream connected", venue);
                let (mut write, mut read) = ws.split();

                let mut subscribed = true;
                for chunk in topics.chunks(config.subscribe_batch_size) {
                    let frame = serde_json::json!({ "op": "subscribe", "args": chunk });
                    if write.send(Message::Text(frame.to_string())).await.is_err() {
                        warn!("{} subscribe write failed", venue);
                        subscribed = false;
                        break;
                    }
                    tokio::time::sleep(config.inter_batch_delay).await;
                }

                if subscribed {
                    backoff.reset();
                    retries = 0;
                    let mut ping_timer = tokio::time::interval(config.ping_interval);
                    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                    loop {
                        if !running.load(Ordering::SeqCst) {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        tokio::select! {
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(quote) = parse_ticker(&venue, &text, &denied) {
                                        if sink.send(quote).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("{} stream closed by venue", venue);
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("{} stream error: {}", venue, e);
                                    break;
                                }
                            },
                            _ = ping_timer.tick() => {
                                // Bybit expects an application-level ping op.
                                let frame = serde_json::json!({ "op": "ping" });
                                if write.send(Message::Text(frame.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("{} connect failed: {}", venue, e),
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
        retries += 1;
        if retries > config.max_retries {
            error!(
                "{} stream failed after {} reconnect attempts, giving up",
                venue, config.max_retries
            );
            return;
        }
        let delay = backoff.next_delay();
        info!(
            "{} reconnecting in {:.1}s (attempt {}/{})",
            venue,
            delay.as_secs_f64(),
            retries,
            config.max_retries
        );
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_quote_sink(&self, sink: QuoteSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn connect_stream(&self, symbols: Vec<String>) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .clone()
            .context("quote sink must be registered before connecting")?;

        let deny = self.deny_list();
        let topics: Vec<String> = symbols
            .iter()
            .filter(|s| !deny.contains(s))
            .take(self.stream_config.max_symbols_per_connection)
            .map(|s| format!("tickers.{}", self.to_wire_symbol(s)))
            .collect();
        if topics.is_empty() {
            bail!("no symbols left to subscribe after deny-list filtering");
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_stream(
            self.name.clone(),
            self.ws_url.clone(),
            topics,
            sink,
            Arc::clone(&self.running),
            self.stream_config.clone(),
            Arc::clone(&self.session_denied),
        ));
        *self.stream_handle.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect_stream(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.stream_handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(std::time::Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                debug!("{} stream task did not drain in time", self.name);
            }
        }
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote> {
        let wire = self.to_wire_symbol(symbol);
        let body = self
            .public_request(
                "/v5/market/tickers",
                &[("category", "spot".to_string()), ("symbol", wire)],
            )
            .await?;
        let entry = body
            .pointer("/result/list/0")
            .context("empty ticker response")?;
        let bid = json_f64(entry, "bid1Price");
        let ask = json_f64(entry, "ask1Price");
        if bid > 0.0 && ask > 0.0 {
            return Ok(Quote {
                venue: self.name.clone(),
                symbol: symbol.to_string(),
                bid,
                ask,
                bid_size: json_f64(entry, "bid1Size"),
                ask_size: json_f64(entry, "ask1Size"),
                timestamp: epoch_now(),
                synthetic: false,
            });
        }
        let last = json_f64(entry, "lastPrice");
        if last <= 0.0 {
            bail!("no usable price for {}", symbol);
        }
        Ok(Quote {
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            bid: last * 0.9999,
            ask: last * 1.0001,
            bid_size: 0.0,
            ask_size: 0.0,
            timestamp: epoch_now(),
            synthetic: true,
        })
    }

    async fn fetch_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let wire = self.to_wire_symbol(symbol);
        let body = self
            .public_request(
                "/v5/market/orderbook",
                &[
                    ("category", "spot".to_string()),
                    ("symbol", wire),
                    ("limit", depth.to_string()),
                ],
            )
            .await?;
        let parse_side = |key: &str| -> Vec<(f64, f64)> {
            body.pointer(&format!("/result/{}", key))
                .and_then(|v| v.as_array())
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|level| {
                            let pair = level.as_array()?;
                            let price: f64 = pair.first()?.as_str()?.parse().ok()?;
                            let size: f64 = pair.get(1)?.as_str()?.parse().ok()?;
                            Some((price, size))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_side("b"),
            asks: parse_side("a"),
            timestamp: epoch_now(),
        })
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Order> {
        let mut body = serde_json::json!({
            "category": "spot",
            "symbol": self.to_wire_symbol(symbol),
            "side": match side {
                OrderSide::Buy => "Buy",
                OrderSide::Sell => "Sell",
            },
            "orderType": match order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": format!("{:.8}", quantity),
            // Market buys default to quote-denominated qty; keep base units.
            "marketUnit": "baseCoin",
        });
        if order_type == OrderType::Limit {
            let price = price.context("limit order requires a price")?;
            body["price"] = serde_json::json!(format!("{:.8}", price));
            body["timeInForce"] = serde_json::json!("GTC");
        }
        let response = self
            .signed_request(reqwest::Method::POST, "/v5/order/create", &[], Some(&body))
            .await?;
        let order_id = response
            .pointer("/result/orderId")
            .and_then(|v| v.as_str())
            .context("order response missing orderId")?
            .to_string();

        // The create response carries no fill state; report NEW and let the
        // supervisor poll.
        Ok(Order {
            order_id,
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            price,
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            timestamp: epoch_now(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let body = serde_json::json!({
            "category": "spot",
            "symbol": self.to_wire_symbol(symbol),
            "orderId": order_id,
        });
        self.signed_request(reqwest::Method::POST, "/v5/order/cancel", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn query_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        let wire = self.to_wire_symbol(symbol);
        let query = [
            ("category", "spot".to_string()),
            ("symbol", wire),
            ("orderId", order_id.to_string()),
        ];
        let body = self
            .signed_request(reqwest::Method::GET, "/v5/order/realtime", &query, None)
            .await?;
        let entry = match body.pointer("/result/list/0") {
            Some(entry) => entry.clone(),
            None => {
                // Terminal orders fall out of the realtime view.
                self.signed_request(reqwest::Method::GET, "/v5/order/history", &query, None)
                    .await?
                    .pointer("/result/list/0")
                    .context("order not found")?
                    .clone()
            }
        };
        Ok(self.parse_order(symbol, &entry))
    }

    async fn fetch_balances(&self, asset: Option<&str>) -> Result<HashMap<String, Balance>> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                None,
            )
            .await?;
        let mut balances = HashMap::new();
        if let Some(coins) = body.pointer("/result/list/0/coin").and_then(|v| v.as_array()) {
            for coin in coins {
                let Some(name) = coin.get("coin").and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(wanted) = asset {
                    if name != wanted {
                        continue;
                    }
                }
                let total = json_f64(coin, "walletBalance");
                let locked = json_f64(coin, "locked");
                let free = (total - locked).max(0.0);
                if total > 0.0 || asset.is_some() {
                    balances.insert(name.to_string(), Balance { free, locked });
                }
            }
        }
        Ok(balances)
    }

    async fn fetch_fees(&self, symbol: &str) -> Result<FeeSchedule> {
        let wire = self.to_wire_symbol(symbol);
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/v5/account/fee-rate",
                &[("category", "spot".to_string()), ("symbol", wire)],
                None,
            )
            .await?;
        let entry = body
            .pointer("/result/list/0")
            .context("empty fee response")?;
        Ok(FeeSchedule {
            maker: json_f64(entry, "makerFeeRate"),
            taker: json_f64(entry, "takerFeeRate"),
        })
    }

    async fn list_symbols(&self) -> Result<Vec<String>> {
        let body = self
            .public_request(
                "/v5/market/instruments-info",
                &[("category", "spot".to_string()), ("limit", "1000".to_string())],
            )
            .await?;
        let symbols = body
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.get("status").and_then(|v| v.as_str()) == Some("Trading"))
                    .filter_map(|entry| entry.get("symbol").and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(symbols)
    }

    async fn list_24h_tickers(&self) -> Result<Vec<TickerSummary>> {
        let body = self
            .public_request("/v5/market/tickers", &[("category", "spot".to_string())])
            .await?;
        let tickers = body
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let symbol = entry.get("symbol").and_then(|v| v.as_str())?;
                        Some(TickerSummary {
                            symbol: symbol.to_string(),
                            last_price: json_f64(entry, "lastPrice"),
                            quote_volume_24h: json_f64(entry, "turnover24h"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tickers)
    }

    fn to_wire_symbol(&self, canonical: &str) -> String {
        canonical.to_uppercase()
    }

    fn to_canonical_symbol(&self, wire: &str) -> String {
        wire.to_uppercase()
    }

    fn deny_list(&self) -> Vec<String> {
        let mut deny: Vec<String> = self.config.deny_symbols.clone();
        deny.extend(self.session_denied.lock().iter().cloned());
        deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_frame_parses_explicit_book() {
        let denied = Mutex::new(HashSet::new());
        let text = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","ts":1673853746003,
            "data":{"symbol":"BTCUSDT","lastPrice":"60005","bid1Price":"60000.1","bid1Size":"1.5",
            "ask1Price":"60010.2","ask1Size":"0.7"}}"#;
        let quote = parse_ticker("bybit", text, &denied).unwrap();
        assert!(!quote.synthetic);
        assert!((quote.bid - 60000.1).abs() < 1e-9);
        assert!((quote.timestamp - 1673853746.003).abs() < 1e-6);
    }

    #[test]
    fn delta_without_book_synthesizes_tagged_quote() {
        let denied = Mutex::new(HashSet::new());
        let text = r#"{"topic":"tickers.BTCUSDT","type":"delta","ts":1673853746003,
            "data":{"symbol":"BTCUSDT","lastPrice":"60000"}}"#;
        let quote = parse_ticker("bybit", text, &denied).unwrap();
        assert!(quote.synthetic);
        assert!((quote.bid - 60000.0 * 0.9999).abs() < 1e-6);
        assert!((quote.ask - 60000.0 * 1.0001).abs() < 1e-6);
        assert_eq!(quote.bid_size, 0.0);
    }

    #[test]
    fn failed_subscription_feeds_the_deny_list() {
        let denied = Mutex::new(HashSet::new());
        let text = r#"{"op":"subscribe","success":false,"ret_msg":"Invalid symbol :[tickers.IOTAUSDT]"}"#;
        assert!(parse_ticker("bybit", text, &denied).is_none());
        assert!(denied.lock().contains("IOTAUSDT"));
    }

    #[test]
    fn wire_symbol_round_trips() {
        let adapter = BybitAdapter::new("bybit".to_string(), VenueConfig::default());
        let wire = adapter.to_wire_symbol("ethusdt");
        assert_eq!(wire, "ETHUSDT");
        assert_eq!(
            adapter.to_wire_symbol(&adapter.to_canonical_symbol(&wire)),
            wire
        );
    }

    #[test]
    fn denied_symbol_extraction() {
        assert_eq!(
            extract_denied_symbol("Invalid symbol :[tickers.ONTUSDT]"),
            Some("ONTUSDT".to_string())
        );
        assert_eq!(extract_denied_symbol("no topic here"), None);
    }
}
