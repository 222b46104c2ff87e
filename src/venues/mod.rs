//! Venue adapters
//!
//! One adapter per venue behind a uniform capability surface: top-of-book
//! streaming into a registered sink, signed order management, balances, fees
//! and symbol enumeration. Adapters own their connection state, deny-lists
//! and reference-rate caches; nothing else touches a venue's wire format.

pub mod auth;
pub mod binance;
pub mod bybit;
pub mod session;
pub mod upbit;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;
use crate::models::{Balance, FeeSchedule, Order, OrderSide, OrderType, Quote};

/// Channel end adapters publish normalized quotes into. Bounded; a full
/// channel back-pressures the stream reader rather than dropping quotes.
pub type QuoteSink = mpsc::Sender<Quote>;

/// Depth-limited book snapshot from a venue's REST surface.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    /// (price, size), best first.
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: f64,
}

/// 24h ticker entry used by the universe service for enumeration and volume
/// ranking. Prices/volumes are USD-denominated.
#[derive(Debug, Clone)]
pub struct TickerSummary {
    pub symbol: String,
    pub last_price: f64,
    pub quote_volume_24h: f64,
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Register the sink quotes are published into. Must be called before
    /// `connect_stream`.
    fn set_quote_sink(&self, sink: QuoteSink);

    /// Open the stream and subscribe to top-of-book for the given canonical
    /// symbols. Returns once the background stream task is running; the task
    /// reconnects on failure until shutdown or retry exhaustion.
    async fn connect_stream(&self, symbols: Vec<String>) -> Result<()>;

    /// Clean shutdown of the stream; no reconnect is attempted afterwards.
    async fn disconnect_stream(&self);

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote>;

    async fn fetch_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Order>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;

    async fn query_order(&self, order_id: &str, symbol: &str) -> Result<Order>;

    /// All non-zero balances, or just `asset` when given.
    async fn fetch_balances(&self, asset: Option<&str>) -> Result<HashMap<String, Balance>>;

    async fn fetch_fees(&self, symbol: &str) -> Result<FeeSchedule>;

    /// Tradable symbols in canonical form, unfiltered.
    async fn list_symbols(&self) -> Result<Vec<String>>;

    async fn list_24h_tickers(&self) -> Result<Vec<TickerSummary>>;

    /// Canonical (`BASEQUOTE`) to venue wire form.
    fn to_wire_symbol(&self, canonical: &str) -> String;

    /// Venue wire form back to canonical.
    fn to_canonical_symbol(&self, wire: &str) -> String;

    /// Configured deny-list plus symbols the venue rejected this session.
    fn deny_list(&self) -> Vec<String>;
}

/// Build the adapter registry from configuration. Unknown venue names are
/// skipped with a warning so a config typo cannot take the process down.
pub fn build_adapters(config: &Config) -> HashMap<String, Arc<dyn VenueAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    for (name, venue_config) in &config.venues {
        if !venue_config.enabled {
            continue;
        }
        let adapter: Arc<dyn VenueAdapter> = match name.as_str() {
            "binance" => Arc::new(binance::BinanceAdapter::new(name.clone(), venue_config.clone())),
            "bybit" => Arc::new(bybit::BybitAdapter::new(name.clone(), venue_config.clone())),
            "upbit" => Arc::new(upbit::UpbitAdapter::new(name.clone(), venue_config.clone())),
            other => {
                warn!("unknown venue '{}' in config, skipping", other);
                continue;
            }
        };
        adapters.insert(name.clone(), adapter);
    }
    adapters
}
