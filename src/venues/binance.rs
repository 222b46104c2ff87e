//! Binance venue adapter
//!
//! Top-of-book via the combined bookTicker stream, order management via the
//! signed REST API. Wire symbols already match the canonical `BASEQUOTE`
//! form; stream names are lowercased.
//!
//! Hardening carried by the stream task:
//! - jittered exponential backoff on reconnect, re-subscribing every time
//! - application-level ping on an interval, pong replies to venue pings
//! - malformed frames are skipped, never fatal
//! - retry exhaustion declares the stream dead and stops publishing

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

const MAINNET_REST: &str = "https://api.binance.com";
const TESTNET_REST: &str = "https://testnet.binance.vision";
const MAINNET_STREAM: &str = "wss://stream.binance.com:9443/ws";
const TESTNET_STREAM: &str = "wss://testnet.binance.vision/ws";

pub struct BinanceAdapter {
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

impl BinanceAdapter {
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
            stream_config: StreamConfig::standard(),
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
        let status = response.status();
        let body: serde_json::Value = response.json().await.context("decoding response")?;
        if !status.is_success() {
            bail!("binance API error ({}): {}", status, body);
        }
        Ok(body)
    }

    async fn sync_server_time(&self) -> Result<()> {
        let body = self.public_request("/api/v3/time", &[]).await?;
        if let Some(server_ms) = body.get("serverTime").and_then(|v| v.as_i64()) {
            self.time_offset.sync(server_ms);
        }
        Ok(())
    }

    /// Signed request with one retry after a clock resync on timestamp
    /// rejection (code -1021).
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        for attempt in 0..2 {
            let mut query: Vec<String> = params
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            query.push("recvWindow=5000".to_string());
            query.push(format!("timestamp={}", self.time_offset.now_ms()));
            let query_string = query.join("&");
            let signature = sign_hex(&self.config.api_secret, &query_string)?;
            let url = format!(
                "{}{}?{}&signature={}",
                self.base_url, path, query_string, signature
            );

            let response = self
                .http
                .request(method.clone(), url)
                .header("X-MBX-APIKEY", &self.config.api_key)
                .send()
                .await
                .with_context(|| format!("{} {}", method, path))?;
            let status = response.status();
            let body: serde_json::Value = response.json().await.context("decoding response")?;
            if status.is_success() {
                return Ok(body);
            }

            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            if code == -1021 && attempt == 0 {
                warn!("binance rejected request timestamp, resyncing clock");
                self.sync_server_time().await?;
                continue;
            }
            bail!("binance API error ({}): {}", status, body);
        }
        bail!("binance signed request failed after clock resync")
    }

    fn parse_order(&self, symbol: &str, value: &serde_json::Value) -> Order {
        let filled = json_f64(value, "executedQty");
        let cum_quote = json_f64(value, "cummulativeQuoteQty");
        let average_price = if filled > 0.0 && cum_quote > 0.0 {
            Some(cum_quote / filled)
        } else {
            None
        };
        Order {
            order_id: value
                .get("orderId")
                .map(|v| v.to_string())
                .unwrap_or_default(),
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            side: if value.get("side").and_then(|v| v.as_str()) == Some("SELL") {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            order_type: if value.get("type").and_then(|v| v.as_str()) == Some("LIMIT") {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity: json_f64(value, "origQty"),
            price: Some(json_f64(value, "price")).filter(|p| *p > 0.0),
            status: map_status(value.get("status").and_then(|v| v.as_str()).unwrap_or("")),
            filled_quantity: filled,
            average_price,
            timestamp: epoch_now(),
        }
    }
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "PENDING_CANCEL" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        other => {
            debug!("unmapped binance order status '{}'", other);
            OrderStatus::New
        }
    }
}

/// Numeric fields arrive as JSON strings; tolerate either encoding.
fn json_f64(value: &serde_json::Value, key: &str) -> f64 {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(v) => v.as_f64().unwrap_or(0.0),
        None => 0.0,
    }
}

/// One inbound bookTicker frame to a normalized quote, or None for acks,
/// malformed payloads and empty books.
fn parse_book_ticker(venue: &str, text: &str) -> Option<Quote> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("{}: skipping malformed frame: {}", venue, e);
            return None;
        }
    };
    // Subscribe acks look like {"result":null,"id":1}.
    if value.get("id").is_some() {
        if let Some(error) = value.get("error") {
            warn!("{}: subscription error: {}", venue, error);
        }
        return None;
    }
    let data = value.get("data").unwrap_or(&value);
    let symbol = data.get("s").and_then(|v| v.as_str())?;
    let bid = json_f64(data, "b");
    let ask = json_f64(data, "a");
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    Some(Quote {
        venue: venue.to_string(),
        symbol: symbol.to_string(),
        bid,
        ask,
        bid_size: json_f64(data, "B"),
        ask_size: json_f64(data, "A"),
        timestamp: epoch_now(),
        synthetic: false,
    })
}

async fn run_stream(
    venue: String,
    ws_url: String,
    streams: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    config: StreamConfig,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut retries = 0u32;

    while running.load(Ordering::SeqCst) {
        match connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => {
                info!("{} stream connected", venue);
                let (mut write, mut read) = ws.split();

                let mut subscribed = true;
                for (batch_id, chunk) in streams.chunks(config.subscribe_batch_size).enumerate() {
                    let frame = serde_json::json!({
                        "method": "SUBSCRIBE",
                        "params": chunk,
                        "id": batch_id + 1,
                    });
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
                                    if let Some(quote) = parse_book_ticker(&venue, &text) {
                                        if sink.send(quote).await.is_err() {
                                            // Router gone; nothing left to publish to.
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
                                if write.send(Message::Ping(Vec::new())).await.is_err() {
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
impl VenueAdapter for BinanceAdapter {
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
        let streams: Vec<String> = symbols
            .iter()
            .filter(|s| !deny.contains(s))
            .take(self.stream_config.max_symbols_per_connection)
            .map(|s| format!("{}@bookTicker", self.to_wire_symbol(s).to_lowercase()))
            .collect();
        if streams.is_empty() {
            bail!("no symbols left to subscribe after deny-list filtering");
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_stream(
            self.name.clone(),
            self.ws_url.clone(),
            streams,
            sink,
            Arc::clone(&self.running),
            self.stream_config.clone(),
        ));
        *self.stream_handle.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect_stream(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.stream_handle.lock().take();
        if let Some(handle) = handle {
            // A task stuck mid-backoff is detached; it observes the flag at
            // its next suspension point and exits.
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
            .public_request("/api/v3/ticker/bookTicker", &[("symbol", wire)])
            .await?;
        let bid = json_f64(&body, "bidPrice");
        let ask = json_f64(&body, "askPrice");
        if bid > 0.0 && ask > 0.0 {
            return Ok(Quote {
                venue: self.name.clone(),
                symbol: symbol.to_string(),
                bid,
                ask,
                bid_size: json_f64(&body, "bidQty"),
                ask_size: json_f64(&body, "askQty"),
                timestamp: epoch_now(),
                synthetic: false,
            });
        }

        // Thin book: fall back to last trade, synthesized ±0.01%.
        let wire = self.to_wire_symbol(symbol);
        let last = self
            .public_request("/api/v3/ticker/price", &[("symbol", wire)])
            .await?;
        let price = json_f64(&last, "price");
        if price <= 0.0 {
            bail!("no usable price for {}", symbol);
        }
        Ok(Quote {
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            bid: price * 0.9999,
            ask: price * 1.0001,
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
                "/api/v3/depth",
                &[("symbol", wire), ("limit", depth.to_string())],
            )
            .await?;
        let parse_side = |key: &str| -> Vec<(f64, f64)> {
            body.get(key)
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
            bids: parse_side("bids"),
            asks: parse_side("asks"),
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
        let wire = self.to_wire_symbol(symbol);
        let mut params = vec![
            ("symbol", wire),
            (
                "side",
                match side {
                    OrderSide::Buy => "BUY".to_string(),
                    OrderSide::Sell => "SELL".to_string(),
                },
            ),
            (
                "type",
                match order_type {
                    OrderType::Market => "MARKET".to_string(),
                    OrderType::Limit => "LIMIT".to_string(),
                },
            ),
            ("quantity", format!("{:.8}", quantity)),
        ];
        if order_type == OrderType::Limit {
            let price = price.context("limit order requires a price")?;
            params.push(("price", format!("{:.8}", price)));
            params.push(("timeInForce", "GTC".to_string()));
        }
        let body = self
            .signed_request(reqwest::Method::POST, "/api/v3/order", &params)
            .await?;
        Ok(self.parse_order(symbol, &body))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let wire = self.to_wire_symbol(symbol);
        self.signed_request(
            reqwest::Method::DELETE,
            "/api/v3/order",
            &[("symbol", wire), ("orderId", order_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn query_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        let wire = self.to_wire_symbol(symbol);
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/api/v3/order",
                &[("symbol", wire), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(self.parse_order(symbol, &body))
    }

    async fn fetch_balances(&self, asset: Option<&str>) -> Result<HashMap<String, Balance>> {
        let body = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", &[])
            .await?;
        let mut balances = HashMap::new();
        if let Some(entries) = body.get("balances").and_then(|v| v.as_array()) {
            for entry in entries {
                let Some(name) = entry.get("asset").and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(wanted) = asset {
                    if name != wanted {
                        continue;
                    }
                }
                let free = json_f64(entry, "free");
                let locked = json_f64(entry, "locked");
                if free > 0.0 || locked > 0.0 || asset.is_some() {
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
                "/sapi/v1/asset/tradeFee",
                &[("symbol", wire)],
            )
            .await?;
        let entry = body
            .as_array()
            .and_then(|entries| entries.first())
            .context("empty fee response")?;
        Ok(FeeSchedule {
            maker: json_f64(entry, "makerCommission"),
            taker: json_f64(entry, "takerCommission"),
        })
    }

    async fn list_symbols(&self) -> Result<Vec<String>> {
        let body = self.public_request("/api/v3/exchangeInfo", &[]).await?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| {
                        entry.get("status").and_then(|v| v.as_str()) == Some("TRADING")
                    })
                    .filter_map(|entry| entry.get("symbol").and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(symbols)
    }

    async fn list_24h_tickers(&self) -> Result<Vec<TickerSummary>> {
        let body = self.public_request("/api/v3/ticker/24hr", &[]).await?;
        let tickers = body
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let symbol = entry.get("symbol").and_then(|v| v.as_str())?;
                        Some(TickerSummary {
                            symbol: symbol.to_string(),
                            last_price: json_f64(entry, "lastPrice"),
                            quote_volume_24h: json_f64(entry, "quoteVolume"),
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
    fn book_ticker_frame_parses_combined_and_raw_payloads() {
        let raw = r#"{"u":400900217,"s":"BTCUSDT","b":"60000.01","B":"1.5","a":"60000.12","A":"2.0"}"#;
        let quote = parse_book_ticker("binance", raw).unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
        assert!((quote.bid - 60000.01).abs() < 1e-9);
        assert!((quote.ask_size - 2.0).abs() < 1e-9);
        assert!(!quote.synthetic);

        let combined = format!(r#"{{"stream":"btcusdt@bookTicker","data":{}}}"#, raw);
        let quote = parse_book_ticker("binance", &combined).unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
    }

    #[test]
    fn acks_and_garbage_are_skipped() {
        assert!(parse_book_ticker("binance", r#"{"result":null,"id":1}"#).is_none());
        assert!(parse_book_ticker("binance", "not json").is_none());
        assert!(parse_book_ticker("binance", r#"{"s":"BTCUSDT","b":"0","a":"0"}"#).is_none());
    }

    #[test]
    fn wire_symbol_round_trips() {
        let adapter = BinanceAdapter::new("binance".to_string(), VenueConfig::default());
        let wire = adapter.to_wire_symbol("BTCUSDT");
        assert_eq!(
            adapter.to_wire_symbol(&adapter.to_canonical_symbol(&wire)),
            wire
        );
    }

    #[test]
    fn order_status_mapping_covers_terminal_states() {
        assert_eq!(map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_status("CANCELED"), OrderStatus::Canceled);
        assert_eq!(map_status("EXPIRED"), OrderStatus::Canceled);
        assert_eq!(map_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_status("PARTIALLY_FILLED"), OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn stream_reconnects_and_resubscribes_after_socket_loss() {
        use std::time::Duration;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        // Serve two connections; each delivers 10 quotes after the
        // subscribe frame, then drops the socket uncleanly.
        let server = tokio::spawn(async move {
            let mut subscribe_frames = 0;
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    if text.contains("SUBSCRIBE") {
                        subscribe_frames += 1;
                    }
                }
                for i in 0..10 {
                    let frame = format!(
                        r#"{{"s":"BTCUSDT","b":"{}","B":"1","a":"{}","A":"1"}}"#,
                        60000 + i,
                        60010 + i
                    );
                    ws.send(Message::Text(frame)).await.unwrap();
                }
                drop(ws);
            }
            subscribe_frames
        });

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let running = Arc::new(AtomicBool::new(true));
        let mut config = StreamConfig::standard();
        config.backoff_base = Duration::from_millis(20);
        config.backoff_cap = Duration::from_millis(50);
        config.inter_batch_delay = Duration::from_millis(1);
        let stream_task = tokio::spawn(run_stream(
            "binance".to_string(),
            url,
            vec!["btcusdt@bookTicker".to_string()],
            tx,
            Arc::clone(&running),
            config,
        ));

        let mut received = 0;
        while received < 20 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(_)) => received += 1,
                _ => break,
            }
        }
        running.store(false, Ordering::SeqCst);
        stream_task.abort();

        assert_eq!(received, 20, "quotes must flow across the reconnect");
        assert_eq!(server.await.unwrap(), 2, "subscriptions re-issued on reconnect");
    }
}
