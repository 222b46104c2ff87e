//! Shared domain types
//!
//! Core entities crossing component boundaries: quotes, orders, balances,
//! arbitrage signals. Everything here is plain data, copied by value between
//! components; no shared mutable state.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Quote currencies recognized when splitting a canonical symbol, longest
/// suffix first so `BTCUSDT` resolves to (BTC, USDT) and not (BTCUSD, T).
pub const KNOWN_QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];

/// Seconds since Unix epoch as f64 (sub-second precision).
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Split a canonical symbol (`BASEQUOTE`, uppercase, no separator) into base
/// and quote parts by matching known quote-currency suffixes.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    for quote in KNOWN_QUOTE_CURRENCIES {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base, quote));
            }
        }
    }
    None
}

/// Top-of-book quote, normalized to canonical symbol and USD-denominated
/// prices. `synthetic` marks quotes derived from last-trade price rather than
/// an explicit best bid/ask; synthetic quotes never drive signal emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub venue: String,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    /// Venue event time, seconds since epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub synthetic: bool,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) * 0.5
    }

    pub fn is_valid(&self) -> bool {
        self.bid > 0.0
            && self.ask > 0.0
            && self.ask >= self.bid
            && self.bid_size >= 0.0
            && self.ask_size >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// No further transitions occur from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// The order moved assets, fully or partially.
    pub fn is_filled_any(&self) -> bool {
        matches!(self, Self::Filled | Self::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "partially_filled" => Some(Self::PartiallyFilled),
            "filled" => Some(Self::Filled),
            "canceled" => Some(Self::Canceled),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// An order as seen by the engine, venue-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
    pub timestamp: f64,
}

impl Order {
    /// Executed price for accounting; falls back to the requested price when
    /// the venue reported no average.
    pub fn fill_price(&self) -> f64 {
        self.average_price.or(self.price).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Maker/taker fee fractions for one (venue, symbol).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker: 0.001,
            taker: 0.001,
        }
    }
}

/// A profitable dislocation detected between two venues, net of fees and
/// slippage. Consumed by an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageSignal {
    pub symbol: String,
    pub buy_venue: String,
    pub sell_venue: String,
    /// Ask on the buy venue.
    pub buy_price: f64,
    /// Bid on the sell venue.
    pub sell_price: f64,
    /// Projected profit per unit after fees and slippage, USD.
    pub profit: f64,
    /// profit / buy_price.
    pub profit_fraction: f64,
    pub buy_size: f64,
    pub sell_size: f64,
    pub timestamp: f64,
    /// [0, 1], from displayed size and quote age.
    pub confidence: f64,
    /// Spread fraction minus the rolling pair baseline, once enough samples
    /// exist.
    pub baseline_adjusted_fraction: Option<f64>,
    pub z_score: Option<f64>,
    pub is_outlier: bool,
}

/// Aggregate lifecycle of a paired buy/sell execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    PartiallyFilled,
    Completed,
    Failed,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PartiallyFilled => "partially_filled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_symbol_matches_longest_quote_suffix() {
        assert_eq!(split_symbol("BTCUSDT"), Some(("BTC", "USDT")));
        assert_eq!(split_symbol("ETHBTC"), Some(("ETH", "BTC")));
        assert_eq!(split_symbol("SOLUSDC"), Some(("SOL", "USDC")));
        // No base left once the suffix is stripped.
        assert_eq!(split_symbol("USDT"), None);
        assert_eq!(split_symbol("XYZKRW"), None);
    }

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn order_status_round_trips_through_strings() {
        for status in [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn quote_validity() {
        let quote = Quote {
            venue: "binance".into(),
            symbol: "BTCUSDT".into(),
            bid: 60000.0,
            ask: 60010.0,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp: 1.0,
            synthetic: false,
        };
        assert!(quote.is_valid());
        assert!((quote.mid() - 60005.0).abs() < 1e-9);

        let crossed = Quote {
            bid: 60020.0,
            ..quote.clone()
        };
        assert!(!crossed.is_valid());
    }
}
