//! Upbit venue adapter
//!
//! KRW-denominated venue. Wire symbols are region-prefixed (`KRW-BTC`);
//! canonically they map onto the USDT-quoted form (`BTCUSDT`) so the
//! detector can pair them against the other venues. All prices cross a
//! cached KRW→USD reference rate, refreshed at most every ten minutes from
//! the venue's own KRW-USDT market, with a static fallback when that fails.
//!
//! Upbit's public stream publishes trades, not a book, so every quote from
//! here is synthesized around the last trade at ±0.01% and tagged as such.

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
use uuid::Uuid;

use super::auth::sign_base64;
use super::session::{Backoff, StreamConfig};
use super::{OrderBook, QuoteSink, TickerSummary, VenueAdapter};
use crate::config::VenueConfig;
use crate::models::{
    epoch_now, split_symbol, Balance, FeeSchedule, Order, OrderSide, OrderStatus, OrderType, Quote,
};

const REST_URL: &str = "https://api.upbit.com";
const STREAM_URL: &str = "wss://api.upbit.com/websocket/v1";

/// Synthesized half-spread around the last trade.
const SYNTHETIC_OFFSET: f64 = 0.0001;

const RATE_REFRESH_SECS: f64 = 600.0;
const FALLBACK_USD_PER_KRW: f64 = 1.0 / 1300.0;

/// Cached KRW→USD conversion. Refresh is event-driven: callers ask for the
/// rate and a refresh happens at most once per interval, keeping the last
/// (or static fallback) value on failure.
struct KrwRateCache {
    usd_per_krw: Mutex<f64>,
    last_attempt: Mutex<f64>,
}

impl KrwRateCache {
    fn new() -> Self {
        Self {
            usd_per_krw: Mutex::new(FALLBACK_USD_PER_KRW),
            last_attempt: Mutex::new(0.0),
        }
    }

    fn current(&self) -> f64 {
        *self.usd_per_krw.lock()
    }

    async fn get(&self, http: &reqwest::Client) -> f64 {
        let now = epoch_now();
        {
            let mut last = self.last_attempt.lock();
            if now - *last < RATE_REFRESH_SECS {
                return self.current();
            }
            // Claim the slot before the request so a failing venue is not
            // hammered once per frame.
            *last = now;
        }

        match fetch_krw_per_usdt(http).await {
            Ok(krw_per_usdt) if krw_per_usdt > 0.0 => {
                let rate = 1.0 / krw_per_usdt;
                *self.usd_per_krw.lock() = rate;
                info!(
                    "updated KRW/USD rate: {:.8} (1 USD = {:.2} KRW)",
                    rate, krw_per_usdt
                );
            }
            Ok(_) => warn!("upbit returned a non-positive KRW-USDT price, keeping previous rate"),
            Err(e) => warn!("failed to refresh KRW/USD rate: {}, keeping previous rate", e),
        }
        self.current()
    }
}

async fn fetch_krw_per_usdt(http: &reqwest::Client) -> Result<f64> {
    let body: serde_json::Value = http
        .get(format!("{}/v1/ticker", REST_URL))
        .query(&[("markets", "KRW-USDT")])
        .send()
        .await
        .context("GET /v1/ticker")?
        .json()
        .await
        .context("decoding response")?;
    let price = body
        .pointer("/0/trade_price")
        .and_then(|v| v.as_f64())
        .context("missing trade_price")?;
    Ok(price)
}

pub struct UpbitAdapter {
    name: String,
    config: VenueConfig,
    http: reqwest::Client,
    stream_config: StreamConfig,
    rate: Arc<KrwRateCache>,
    sink: Mutex<Option<QuoteSink>>,
    running: Arc<AtomicBool>,
    stream_handle: Mutex<Option<JoinHandle<()>>>,
    session_denied: Arc<Mutex<HashSet<String>>>,
}

impl UpbitAdapter {
    pub fn new(name: String, config: VenueConfig) -> Self {
        let mut stream_config = StreamConfig::standard();
        stream_config.max_symbols_per_connection = 100;
        stream_config.subscribe_batch_size = 100;
        Self {
            name,
            config,
            http: reqwest::Client::new(),
            stream_config,
            rate: Arc::new(KrwRateCache::new()),
            sink: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            stream_handle: Mutex::new(None),
            session_denied: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Base64 HMAC over `timestamp \n method \n path \n query`.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let timestamp = (epoch_now() * 1000.0) as i64;
        let query_string = params
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");
        let canonical = format!("{}\n{}\n{}\n{}", timestamp, method, path, query_string);
        let signature = sign_base64(&self.config.api_secret, &canonical)?;

        let response = self
            .http
            .request(method.clone(), format!("{}{}", REST_URL, path))
            .query(params)
            .header(
                "Authorization",
                format!("UPBIT {}:{}", self.config.api_key, signature),
            )
            .header("Upbit-Timestamp", timestamp.to_string())
            .send()
            .await
            .with_context(|| format!("{} {}", method, path))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.context("decoding response")?;
        if !status.is_success() {
            bail!("upbit API error ({}): {}", status, body);
        }
        Ok(body)
    }

    async fn public_request(&self, path: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}{}", REST_URL, path))
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.context("decoding response")?;
        if !status.is_success() {
            bail!("upbit API error ({}): {}", status, body);
        }
        Ok(body)
    }

    fn parse_order(&self, symbol: &str, value: &serde_json::Value, usd_per_krw: f64) -> Order {
        let quantity = json_f64(value, "volume");
        let filled = json_f64(value, "executed_volume");
        // Average from the trade list, reported in USD like everything else.
        let (funds, volume) = value
            .get("trades")
            .and_then(|v| v.as_array())
            .map(|trades| {
                trades.iter().fold((0.0, 0.0), |(funds, volume), trade| {
                    (
                        funds + json_f64(trade, "funds"),
                        volume + json_f64(trade, "volume"),
                    )
                })
            })
            .unwrap_or((0.0, 0.0));
        let average_price = if volume > 0.0 {
            Some(funds / volume * usd_per_krw)
        } else {
            None
        };
        let side = if value.get("side").and_then(|v| v.as_str()) == Some("ask") {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        Order {
            order_id: value
                .get("uuid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            side,
            order_type: match value.get("ord_type").and_then(|v| v.as_str()) {
                Some("limit") => OrderType::Limit,
                _ => OrderType::Market,
            },
            quantity,
            price: Some(json_f64(value, "price") * usd_per_krw).filter(|p| *p > 0.0),
            status: map_status(value.get("state").and_then(|v| v.as_str()).unwrap_or("")),
            filled_quantity: filled,
            average_price,
            timestamp: epoch_now(),
        }
    }

    async fn krw_last_price(&self, wire: &str) -> Result<f64> {
        let body = self
            .public_request("/v1/ticker", &[("markets", wire.to_string())])
            .await?;
        let price = body
            .pointer("/0/trade_price")
            .and_then(|v| v.as_f64())
            .with_context(|| format!("no trade price for {}", wire))?;
        Ok(price)
    }
}

fn map_status(state: &str) -> OrderStatus {
    match state {
        "wait" | "watch" => OrderStatus::New,
        "done" => OrderStatus::Filled,
        "cancel" => OrderStatus::Canceled,
        other => {
            debug!("unmapped upbit order state '{}'", other);
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

/// A ticker frame to a synthesized USD quote.
fn parse_ticker_frame(venue: &str, payload: &[u8], usd_per_krw: f64) -> Option<Quote> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("{}: skipping malformed frame: {}", venue, e);
            return None;
        }
    };
    if value.get("type").and_then(|v| v.as_str()) != Some("ticker") {
        return None;
    }
    let code = value.get("code").and_then(|v| v.as_str())?;
    let base = code.strip_prefix("KRW-")?;
    let trade_price = json_f64(&value, "trade_price");
    if trade_price <= 0.0 {
        return None;
    }
    let usd_price = trade_price * usd_per_krw;
    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .map(|ms| ms as f64 / 1000.0)
        .unwrap_or_else(epoch_now);
    Some(Quote {
        venue: venue.to_string(),
        symbol: format!("{}USDT", base),
        bid: usd_price * (1.0 - SYNTHETIC_OFFSET),
        ask: usd_price * (1.0 + SYNTHETIC_OFFSET),
        bid_size: 0.0,
        ask_size: 0.0,
        timestamp,
        synthetic: true,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    venue: String,
    codes: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    config: StreamConfig,
    rate: Arc<KrwRateCache>,
    http: reqwest::Client,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut retries = 0u32;

    while running.load(Ordering::SeqCst) {
        match connect_async(STREAM_URL).await {
            Ok((ws, _)) => {
                info!("{} stream connected", venue);
                let (mut write, mut read) = ws.split();

                let frame = serde_json::json!([
                    { "ticket": Uuid::new_v4().to_string() },
                    { "type": "ticker", "codes": codes },
                ]);
                if write.send(Message::Text(frame.to_string())).await.is_err() {
                    warn!("{} subscribe write failed", venue);
                } else {
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
                                // Upbit delivers JSON as binary frames.
                                Some(Ok(Message::Binary(payload))) => {
                                    let usd_per_krw = rate.get(&http).await;
                                    if let Some(quote) = parse_ticker_frame(&venue, &payload, usd_per_krw) {
                                        if sink.send(quote).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Some(Ok(Message::Text(text))) => {
                                    let usd_per_krw = rate.get(&http).await;
                                    if let Some(quote) = parse_ticker_frame(&venue, text.as_bytes(), usd_per_krw) {
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
impl VenueAdapter for UpbitAdapter {
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
        let codes: Vec<String> = symbols
            .iter()
            .filter(|s| !deny.contains(s))
            .take(self.stream_config.max_symbols_per_connection)
            .map(|s| self.to_wire_symbol(s))
            .collect();
        if codes.is_empty() {
            bail!("no symbols left to subscribe after deny-list filtering");
        }
        if symbols.len() > self.stream_config.max_symbols_per_connection {
            warn!(
                "{}: truncating subscription from {} to {} symbols",
                self.name,
                symbols.len(),
                self.stream_config.max_symbols_per_connection
            );
        }

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_stream(
            self.name.clone(),
            codes,
            sink,
            Arc::clone(&self.running),
            self.stream_config.clone(),
            Arc::clone(&self.rate),
            self.http.clone(),
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
        let krw_price = self.krw_last_price(&wire).await?;
        let usd_per_krw = self.rate.get(&self.http).await;
        let usd_price = krw_price * usd_per_krw;
        Ok(Quote {
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            bid: usd_price * (1.0 - SYNTHETIC_OFFSET),
            ask: usd_price * (1.0 + SYNTHETIC_OFFSET),
            bid_size: 0.0,
            ask_size: 0.0,
            timestamp: epoch_now(),
            synthetic: true,
        })
    }

    async fn fetch_orderbook(&self, symbol: &str, _depth: usize) -> Result<OrderBook> {
        let wire = self.to_wire_symbol(symbol);
        let body = self
            .public_request("/v1/orderbook", &[("markets", wire)])
            .await?;
        let usd_per_krw = self.rate.get(&self.http).await;
        let units = body
            .pointer("/0/orderbook_units")
            .and_then(|v| v.as_array())
            .context("missing orderbook units")?;
        let mut bids = Vec::with_capacity(units.len());
        let mut asks = Vec::with_capacity(units.len());
        for unit in units {
            bids.push((
                json_f64(unit, "bid_price") * usd_per_krw,
                json_f64(unit, "bid_size"),
            ));
            asks.push((
                json_f64(unit, "ask_price") * usd_per_krw,
                json_f64(unit, "ask_size"),
            ));
        }
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
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
        let usd_per_krw = self.rate.get(&self.http).await;

        let mut params: Vec<(&str, String)> = vec![
            ("market", wire.clone()),
            (
                "side",
                match side {
                    OrderSide::Buy => "bid".to_string(),
                    OrderSide::Sell => "ask".to_string(),
                },
            ),
        ];
        match (order_type, side) {
            (OrderType::Limit, _) => {
                let usd_price = price.context("limit order requires a price")?;
                params.push(("ord_type", "limit".to_string()));
                params.push(("volume", format!("{:.8}", quantity)));
                params.push(("price", format!("{:.4}", usd_price / usd_per_krw)));
            }
            (OrderType::Market, OrderSide::Buy) => {
                // Market buys are notional-denominated in KRW.
                let krw_price = self.krw_last_price(&wire).await?;
                params.push(("ord_type", "price".to_string()));
                params.push(("price", format!("{:.4}", quantity * krw_price)));
            }
            (OrderType::Market, OrderSide::Sell) => {
                params.push(("ord_type", "market".to_string()));
                params.push(("volume", format!("{:.8}", quantity)));
            }
        }

        let body = self
            .signed_request(reqwest::Method::POST, "/v1/orders", &params)
            .await?;
        let mut order = self.parse_order(symbol, &body, usd_per_krw);
        if order.quantity <= 0.0 {
            order.quantity = quantity;
        }
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<()> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/v1/order",
            &[("uuid", order_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn query_order(&self, order_id: &str, symbol: &str) -> Result<Order> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/v1/order",
                &[("uuid", order_id.to_string())],
            )
            .await?;
        let usd_per_krw = self.rate.current();
        Ok(self.parse_order(symbol, &body, usd_per_krw))
    }

    async fn fetch_balances(&self, asset: Option<&str>) -> Result<HashMap<String, Balance>> {
        let body = self
            .signed_request(reqwest::Method::GET, "/v1/accounts", &[])
            .await?;
        let usd_per_krw = self.rate.get(&self.http).await;
        let mut balances = HashMap::new();
        if let Some(accounts) = body.as_array() {
            for account in accounts {
                let Some(currency) = account.get("currency").and_then(|v| v.as_str()) else {
                    continue;
                };
                let free = json_f64(account, "balance");
                let locked = json_f64(account, "locked");
                if currency == "KRW" {
                    // Report the cash balance in USD terms under USDT so
                    // sizing sees a quote balance comparable to the other
                    // venues; keep the raw KRW row as well.
                    balances.insert(
                        "USDT".to_string(),
                        Balance {
                            free: free * usd_per_krw,
                            locked: locked * usd_per_krw,
                        },
                    );
                }
                if let Some(wanted) = asset {
                    if currency != wanted {
                        continue;
                    }
                }
                if free > 0.0 || locked > 0.0 || asset.is_some() {
                    balances.insert(currency.to_string(), Balance { free, locked });
                }
            }
        }
        if let Some(wanted) = asset {
            balances.retain(|name, _| name.as_str() == wanted);
        }
        Ok(balances)
    }

    async fn fetch_fees(&self, _symbol: &str) -> Result<FeeSchedule> {
        // Flat venue-wide schedule; configured rather than queried.
        Ok(FeeSchedule {
            maker: self.config.maker_fee,
            taker: self.config.taker_fee,
        })
    }

    async fn list_symbols(&self) -> Result<Vec<String>> {
        let body = self.public_request("/v1/market/all", &[]).await?;
        let symbols = body
            .as_array()
            .map(|markets| {
                markets
                    .iter()
                    .filter_map(|market| market.get("market").and_then(|v| v.as_str()))
                    .filter(|market| market.starts_with("KRW-"))
                    .map(|market| self.to_canonical_symbol(market))
                    .collect()
            })
            .unwrap_or_default();
        Ok(symbols)
    }

    async fn list_24h_tickers(&self) -> Result<Vec<TickerSummary>> {
        let markets = {
            let body = self.public_request("/v1/market/all", &[]).await?;
            body.as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|market| market.get("market").and_then(|v| v.as_str()))
                        .filter(|market| market.starts_with("KRW-"))
                        .map(|market| market.to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        let usd_per_krw = self.rate.get(&self.http).await;

        let mut tickers = Vec::new();
        for chunk in markets.chunks(100) {
            let body = self
                .public_request("/v1/ticker", &[("markets", chunk.join(","))])
                .await?;
            if let Some(entries) = body.as_array() {
                for entry in entries {
                    let Some(market) = entry.get("market").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    tickers.push(TickerSummary {
                        symbol: self.to_canonical_symbol(market),
                        last_price: json_f64(entry, "trade_price") * usd_per_krw,
                        quote_volume_24h: json_f64(entry, "acc_trade_price_24h") * usd_per_krw,
                    });
                }
            }
        }
        Ok(tickers)
    }

    fn to_wire_symbol(&self, canonical: &str) -> String {
        let base = split_symbol(canonical)
            .map(|(base, _)| base)
            .unwrap_or(canonical);
        format!("KRW-{}", base.to_uppercase())
    }

    fn to_canonical_symbol(&self, wire: &str) -> String {
        let base = wire.strip_prefix("KRW-").unwrap_or(wire);
        format!("{}USDT", base.to_uppercase())
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
    fn wire_symbol_round_trips_through_region_prefix() {
        let adapter = UpbitAdapter::new("upbit".to_string(), VenueConfig::default());
        assert_eq!(adapter.to_wire_symbol("BTCUSDT"), "KRW-BTC");
        assert_eq!(adapter.to_canonical_symbol("KRW-BTC"), "BTCUSDT");
        let wire = adapter.to_wire_symbol("ETHUSDT");
        assert_eq!(
            adapter.to_wire_symbol(&adapter.to_canonical_symbol(&wire)),
            wire
        );
    }

    #[test]
    fn ticker_frame_synthesizes_usd_quote() {
        let rate = 1.0 / 1300.0;
        let payload = br#"{"type":"ticker","code":"KRW-BTC","trade_price":78000000.0,"timestamp":1700000000000}"#;
        let quote = parse_ticker_frame("upbit", payload, rate).unwrap();
        assert_eq!(quote.symbol, "BTCUSDT");
        assert!(quote.synthetic);
        let usd = 78000000.0 * rate;
        assert!((quote.bid - usd * 0.9999).abs() < 1e-6);
        assert!((quote.ask - usd * 1.0001).abs() < 1e-6);
        assert!((quote.timestamp - 1_700_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn non_ticker_and_non_krw_frames_are_ignored() {
        let rate = 1.0 / 1300.0;
        assert!(parse_ticker_frame("upbit", br#"{"type":"trade"}"#, rate).is_none());
        assert!(parse_ticker_frame(
            "upbit",
            br#"{"type":"ticker","code":"BTC-ETH","trade_price":1.0}"#,
            rate
        )
        .is_none());
        assert!(parse_ticker_frame("upbit", b"garbage", rate).is_none());
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(map_status("wait"), OrderStatus::New);
        assert_eq!(map_status("done"), OrderStatus::Filled);
        assert_eq!(map_status("cancel"), OrderStatus::Canceled);
    }
}
