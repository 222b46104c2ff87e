//! Trading simulator
//!
//! Emulates the venue side of execution against an in-memory portfolio:
//! fill delay, adverse slippage, probabilistic rejection and partial fills,
//! taker fees charged in the quote asset. Balances move through an explicit
//! reserve → fill → release cycle so `free` and `locked` stay non-negative
//! and locked amounts always return to zero once a trade settles.
//!
//! The RNG is seeded and time is injected, so a replay with the same inputs
//! produces the same trades.

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{clamp_trade_size, refusal_reason, Executor, ExecutorStats, TRADE_TIMEOUT_SECS};
use crate::config::{Config, Tunables};
use crate::models::{
    split_symbol, ArbitrageSignal, Balance, FeeSchedule, Order, OrderSide, OrderStatus, OrderType,
    TradeStatus,
};
use crate::storage::{Storage, TradeRecord};

/// Fraction filled when a partial fill is drawn.
const PARTIAL_FILL_RATIO: f64 = 0.7;

/// Per-venue seed positions beside the stablecoin balance, valued at the
/// static oracle prices.
const SEED_ASSETS: &[&str] = &["BTC", "ETH", "BNB", "ADA", "DOT"];
const SEED_VALUE_USD: f64 = 1000.0;

/// Static price oracle for portfolio valuation.
fn oracle_price(asset: &str) -> f64 {
    match asset {
        "USDT" | "USDC" | "USD" => 1.0,
        "BTC" => 50_000.0,
        "ETH" => 3_000.0,
        _ => 1.0,
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorParams {
    pub fill_delay_seconds: f64,
    pub partial_fill_probability: f64,
    pub order_reject_probability: f64,
    pub slippage_tolerance: f64,
    pub initial_balance_usd: f64,
    pub seed: u64,
}

impl Default for SimulatorParams {
    fn default() -> Self {
        Self {
            fill_delay_seconds: 2.0,
            partial_fill_probability: 0.1,
            order_reject_probability: 0.05,
            slippage_tolerance: 0.001,
            initial_balance_usd: 10_000.0,
            seed: 42,
        }
    }
}

/// Settled-trade attribution row.
#[derive(Debug, Clone)]
pub struct TradeSummary {
    pub symbol: String,
    pub buy_venue: String,
    pub sell_venue: String,
    pub profit: f64,
    pub status: TradeStatus,
}

#[derive(Debug, Clone)]
struct SimOrder {
    order: Order,
    /// Amount locked at placement (quote asset for buys, base for sells).
    reserved: f64,
    fill_due: f64,
}

#[derive(Debug, Clone)]
struct SimTrade {
    id: u64,
    db_id: Option<i64>,
    signal: ArbitrageSignal,
    buy_order_id: String,
    sell_order_id: String,
    status: TradeStatus,
    start_time: f64,
    profit: f64,
    fees: f64,
}

pub struct Simulator {
    params: SimulatorParams,
    risk: crate::config::RiskConfig,
    tunables: Arc<Tunables>,
    max_position_size: f64,
    max_spread_age_seconds: f64,
    venue_fees: HashMap<String, FeeSchedule>,
    storage: Arc<Storage>,
    rng: StdRng,

    balances: HashMap<String, HashMap<String, Balance>>,
    orders: HashMap<String, SimOrder>,
    active_trades: HashMap<u64, SimTrade>,
    completed_trades: Vec<SimTrade>,
    trade_counter: u64,

    total_trades: u64,
    successful_trades: u64,
    failed_trades: u64,
    total_profit: f64,
    total_fees: f64,
    total_volume: f64,
    initial_portfolio_value: f64,
    max_drawdown: f64,
    current_drawdown: f64,
    halted: bool,
}

impl Simulator {
    pub fn new(
        config: &Config,
        tunables: Arc<Tunables>,
        storage: Arc<Storage>,
        params: SimulatorParams,
    ) -> Self {
        let venue_fees = config
            .venues
            .iter()
            .map(|(name, venue)| {
                (
                    name.clone(),
                    FeeSchedule {
                        maker: venue.maker_fee,
                        taker: venue.taker_fee,
                    },
                )
            })
            .collect();

        let mut balances = HashMap::new();
        for venue in config.enabled_venues() {
            let mut assets = HashMap::new();
            assets.insert(
                "USDT".to_string(),
                Balance {
                    free: params.initial_balance_usd,
                    locked: 0.0,
                },
            );
            for asset in SEED_ASSETS {
                assets.insert(
                    asset.to_string(),
                    Balance {
                        free: SEED_VALUE_USD / oracle_price(asset),
                        locked: 0.0,
                    },
                );
            }
            balances.insert(venue, assets);
        }

        let mut simulator = Self {
            rng: StdRng::seed_from_u64(params.seed),
            risk: config.risk.clone(),
            tunables,
            max_position_size: config.arbitrage.max_position_size,
            max_spread_age_seconds: config.arbitrage.max_spread_age_seconds,
            venue_fees,
            storage,
            params,
            balances,
            orders: HashMap::new(),
            active_trades: HashMap::new(),
            completed_trades: Vec::new(),
            trade_counter: 0,
            total_trades: 0,
            successful_trades: 0,
            failed_trades: 0,
            total_profit: 0.0,
            total_fees: 0.0,
            total_volume: 0.0,
            initial_portfolio_value: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            halted: false,
        };
        simulator.initial_portfolio_value = simulator.portfolio_value();
        info!(
            "simulator initialized with ${:.2} portfolio value",
            simulator.initial_portfolio_value
        );
        simulator
    }

    pub fn balance(&self, venue: &str, asset: &str) -> Balance {
        self.balances
            .get(venue)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(Balance {
                free: 0.0,
                locked: 0.0,
            })
    }

    pub fn portfolio_value(&self) -> f64 {
        self.balances
            .values()
            .flat_map(|assets| assets.iter())
            .map(|(asset, balance)| balance.total() * oracle_price(asset))
            .sum()
    }

    pub fn completed_trade_profits(&self) -> Vec<f64> {
        self.completed_trades.iter().map(|t| t.profit).collect()
    }

    /// Settled trades for per-symbol / per-pair attribution.
    pub fn completed_trade_summaries(&self) -> Vec<TradeSummary> {
        self.completed_trades
            .iter()
            .map(|t| TradeSummary {
                symbol: t.signal.symbol.clone(),
                buy_venue: t.signal.buy_venue.clone(),
                sell_venue: t.signal.sell_venue.clone(),
                profit: t.profit,
                status: t.status,
            })
            .collect()
    }

    fn taker_fee(&self, venue: &str) -> f64 {
        self.venue_fees
            .get(venue)
            .map(|f| f.taker)
            .unwrap_or_else(|| FeeSchedule::default().taker)
    }

    fn free_balance(&self, venue: &str, asset: &str) -> f64 {
        self.balance(venue, asset).free
    }

    fn balance_mut(&mut self, venue: &str, asset: &str) -> &mut Balance {
        self.balances
            .entry(venue.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_insert(Balance {
                free: 0.0,
                locked: 0.0,
            })
    }

    /// Placement with the venue's rejection model. None means rejected.
    fn try_place(
        &mut self,
        venue: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        now: f64,
    ) -> Option<String> {
        if self.rng.gen::<f64>() < self.params.order_reject_probability {
            warn!(
                venue,
                symbol,
                side = side.as_str(),
                "simulated order rejected"
            );
            return None;
        }
        let order_id = Uuid::new_v4().to_string();
        let order = Order {
            order_id: order_id.clone(),
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: Some(price),
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            timestamp: now,
        };
        self.orders.insert(
            order_id.clone(),
            SimOrder {
                order,
                reserved: 0.0,
                fill_due: now + self.params.fill_delay_seconds,
            },
        );
        Some(order_id)
    }

    fn fill_order(&mut self, order_id: &str, now: f64) {
        let Some(sim_order) = self.orders.get(order_id).cloned() else {
            return;
        };
        let order = &sim_order.order;
        let Some(price) = order.price else { return };
        let Some((base, quote)) = split_symbol(&order.symbol).map(|(b, q)| (b.to_string(), q.to_string())) else {
            return;
        };

        // Slippage always lands on the adverse side.
        let fill_price = match order.side {
            OrderSide::Buy => price * (1.0 + self.params.slippage_tolerance),
            OrderSide::Sell => price * (1.0 - self.params.slippage_tolerance),
        };
        let filled = if self.rng.gen::<f64>() < self.params.partial_fill_probability {
            order.quantity * PARTIAL_FILL_RATIO
        } else {
            order.quantity
        };
        let status = if filled < order.quantity {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };

        let taker = self.taker_fee(&order.venue);
        match order.side {
            OrderSide::Buy => {
                let cost = filled * fill_price;
                let fee = cost * taker;
                let balance = self.balance_mut(&order.venue, &quote);
                balance.locked -= sim_order.reserved;
                balance.free += sim_order.reserved - cost - fee;
                self.balance_mut(&order.venue, &base).free += filled;
                self.total_fees += fee;
            }
            OrderSide::Sell => {
                let proceeds = filled * fill_price;
                let fee = proceeds * taker;
                let balance = self.balance_mut(&order.venue, &base);
                balance.locked -= sim_order.reserved;
                balance.free += sim_order.reserved - filled;
                self.balance_mut(&order.venue, &quote).free += proceeds - fee;
                self.total_fees += fee;
            }
        }

        if let Some(entry) = self.orders.get_mut(order_id) {
            entry.order.status = status;
            entry.order.filled_quantity = filled;
            entry.order.average_price = Some(fill_price);

            if let Err(e) = self.storage.insert_order(&entry.order) {
                warn!("failed to store simulated order: {}", e);
            }
            debug!(
                venue = %entry.order.venue,
                symbol = %entry.order.symbol,
                side = entry.order.side.as_str(),
                filled,
                fill_price,
                "simulated fill"
            );
        }
    }

    fn complete_trade(&mut self, trade_id: u64, now: f64) {
        let Some(mut trade) = self.active_trades.remove(&trade_id) else {
            return;
        };
        let (Some(buy), Some(sell)) = (
            self.orders.get(&trade.buy_order_id).map(|o| o.order.clone()),
            self.orders.get(&trade.sell_order_id).map(|o| o.order.clone()),
        ) else {
            return;
        };

        let buy_cost = buy.filled_quantity * buy.fill_price();
        let sell_proceeds = sell.filled_quantity * sell.fill_price();
        let fees = buy_cost * self.taker_fee(&buy.venue) + sell_proceeds * self.taker_fee(&sell.venue);

        trade.profit = sell_proceeds - buy_cost - fees;
        trade.fees = fees;
        trade.status = TradeStatus::Completed;

        self.total_profit += trade.profit;
        self.total_volume += buy_cost;
        if trade.profit > 0.0 {
            self.successful_trades += 1;
        } else {
            self.failed_trades += 1;
        }

        if let Some(db_id) = trade.db_id {
            if let Err(e) = self.storage.update_trade_result(
                db_id,
                TradeStatus::Completed,
                trade.profit,
                Some(&trade.buy_order_id),
                Some(&trade.sell_order_id),
            ) {
                warn!("failed to update trade record: {}", e);
            }
        }
        for order in [&buy, &sell] {
            if let Some(schedule) = self.venue_fees.get(&order.venue).copied() {
                if let Err(e) =
                    self.storage
                        .upsert_fee(&order.venue, &order.symbol, &schedule, now)
                {
                    warn!("failed to store fee schedule: {}", e);
                }
            }
        }

        self.update_drawdown();
        info!(
            trade = trade.id,
            symbol = %trade.signal.symbol,
            profit = trade.profit,
            elapsed = now - trade.start_time,
            "simulated trade completed"
        );
        self.completed_trades.push(trade);
    }

    fn cancel_trade(&mut self, trade_id: u64, now: f64) {
        let Some(mut trade) = self.active_trades.remove(&trade_id) else {
            return;
        };
        for order_id in [trade.buy_order_id.clone(), trade.sell_order_id.clone()] {
            let Some(sim_order) = self.orders.get(&order_id).cloned() else {
                continue;
            };
            if sim_order.order.status != OrderStatus::New {
                continue;
            }
            let Some((base, quote)) =
                split_symbol(&sim_order.order.symbol).map(|(b, q)| (b.to_string(), q.to_string()))
            else {
                continue;
            };
            match sim_order.order.side {
                OrderSide::Buy => {
                    let balance = self.balance_mut(&sim_order.order.venue, &quote);
                    balance.locked -= sim_order.reserved;
                    balance.free += sim_order.reserved;
                }
                OrderSide::Sell => {
                    let balance = self.balance_mut(&sim_order.order.venue, &base);
                    balance.locked -= sim_order.reserved;
                    balance.free += sim_order.reserved;
                }
            }
            if let Some(entry) = self.orders.get_mut(&order_id) {
                entry.order.status = OrderStatus::Canceled;
                if let Err(e) = self.storage.insert_order(&entry.order) {
                    warn!("failed to store canceled order: {}", e);
                }
            }
        }

        trade.status = TradeStatus::Cancelled;
        self.failed_trades += 1;
        if let Some(db_id) = trade.db_id {
            if let Err(e) = self.storage.update_trade_result(
                db_id,
                TradeStatus::Cancelled,
                0.0,
                Some(&trade.buy_order_id),
                Some(&trade.sell_order_id),
            ) {
                warn!("failed to update trade record: {}", e);
            }
        }
        warn!(
            trade = trade.id,
            elapsed = now - trade.start_time,
            "simulated trade timed out, pending legs canceled"
        );
        self.completed_trades.push(trade);
    }

    fn update_drawdown(&mut self) {
        if self.initial_portfolio_value <= 0.0 {
            return;
        }
        let current = self.portfolio_value();
        self.current_drawdown = ((self.initial_portfolio_value - current)
            / self.initial_portfolio_value
            * 100.0)
            .max(0.0);
        self.max_drawdown = self.max_drawdown.max(self.current_drawdown);
        if !self.halted && self.current_drawdown >= self.risk.max_drawdown_percent {
            self.halted = true;
            warn!(
                "drawdown {:.2}% breached the {:.2}% limit, trading halted",
                self.current_drawdown, self.risk.max_drawdown_percent
            );
        }
    }
}

#[async_trait]
impl Executor for Simulator {
    async fn execute(&mut self, signal: &ArbitrageSignal, now: f64) -> bool {
        if self.halted {
            debug!("trading halted, refusing signal");
            return false;
        }
        let Some((base, quote)) =
            split_symbol(&signal.symbol).map(|(b, q)| (b.to_string(), q.to_string()))
        else {
            warn!("cannot split symbol {}", signal.symbol);
            return false;
        };

        let quote_free = self.free_balance(&signal.buy_venue, &quote);
        let base_free = self.free_balance(&signal.sell_venue, &base);
        let tunables = self.tunables.get();
        if let Some(reason) = refusal_reason(
            signal,
            now,
            self.active_trades.len(),
            &self.risk,
            &tunables,
            self.max_spread_age_seconds,
            self.current_drawdown,
            quote_free,
            base_free,
        ) {
            warn!(symbol = %signal.symbol, reason, "signal refused");
            return false;
        }

        let size = clamp_trade_size(
            signal,
            tunables.trade_amount_usd,
            self.max_position_size,
            quote_free,
            base_free,
        );
        if size <= 0.0 {
            warn!(symbol = %signal.symbol, "cannot execute trade: zero size after clamping");
            return false;
        }

        let Some(buy_order_id) = self.try_place(
            &signal.buy_venue,
            &signal.symbol,
            OrderSide::Buy,
            size,
            signal.buy_price,
            now,
        ) else {
            return false;
        };
        let Some(sell_order_id) = self.try_place(
            &signal.sell_venue,
            &signal.symbol,
            OrderSide::Sell,
            size,
            signal.sell_price,
            now,
        ) else {
            self.orders.remove(&buy_order_id);
            return false;
        };

        // Reservations: quote covers the worst-case fill (slippage + fee),
        // so the release after the fill can never drive free negative.
        let buy_taker = self.taker_fee(&signal.buy_venue);
        let reserved_quote = size
            * signal.buy_price
            * (1.0 + self.params.slippage_tolerance)
            * (1.0 + buy_taker);
        let reserved_base = size;
        if self.free_balance(&signal.buy_venue, &quote) < reserved_quote
            || self.free_balance(&signal.sell_venue, &base) < reserved_base
        {
            self.orders.remove(&buy_order_id);
            self.orders.remove(&sell_order_id);
            warn!(symbol = %signal.symbol, "failed to reserve balances");
            return false;
        }
        {
            let balance = self.balance_mut(&signal.buy_venue, &quote);
            balance.free -= reserved_quote;
            balance.locked += reserved_quote;
        }
        {
            let balance = self.balance_mut(&signal.sell_venue, &base);
            balance.free -= reserved_base;
            balance.locked += reserved_base;
        }
        if let Some(entry) = self.orders.get_mut(&buy_order_id) {
            entry.reserved = reserved_quote;
        }
        if let Some(entry) = self.orders.get_mut(&sell_order_id) {
            entry.reserved = reserved_base;
        }

        self.trade_counter += 1;
        let trade_id = self.trade_counter;
        let db_id = self
            .storage
            .insert_trade(&TradeRecord {
                id: None,
                symbol: signal.symbol.clone(),
                buy_venue: signal.buy_venue.clone(),
                sell_venue: signal.sell_venue.clone(),
                buy_price: signal.buy_price,
                sell_price: signal.sell_price,
                quantity: size,
                profit: signal.profit * size,
                profit_fraction: signal.profit_fraction,
                buy_order_id: Some(buy_order_id.clone()),
                sell_order_id: Some(sell_order_id.clone()),
                status: TradeStatus::Pending,
                timestamp: now,
            })
            .map_err(|e| warn!("failed to store trade: {}", e))
            .ok();

        self.active_trades.insert(
            trade_id,
            SimTrade {
                id: trade_id,
                db_id,
                signal: signal.clone(),
                buy_order_id,
                sell_order_id,
                status: TradeStatus::Pending,
                start_time: now,
                profit: 0.0,
                fees: 0.0,
            },
        );
        self.total_trades += 1;

        info!(
            trade = trade_id,
            symbol = %signal.symbol,
            buy = %signal.buy_venue,
            sell = %signal.sell_venue,
            size,
            "simulated trade initiated"
        );
        true
    }

    async fn poll(&mut self, now: f64) {
        let due: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| o.order.status == OrderStatus::New && o.fill_due <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for order_id in due {
            self.fill_order(&order_id, now);
        }

        let trade_ids: Vec<u64> = self.active_trades.keys().copied().collect();
        for trade_id in trade_ids {
            let Some(trade) = self.active_trades.get(&trade_id) else {
                continue;
            };
            let buy_filled = self
                .orders
                .get(&trade.buy_order_id)
                .map(|o| o.order.status.is_filled_any())
                .unwrap_or(false);
            let sell_filled = self
                .orders
                .get(&trade.sell_order_id)
                .map(|o| o.order.status.is_filled_any())
                .unwrap_or(false);

            if buy_filled && sell_filled {
                self.complete_trade(trade_id, now);
            } else if now - trade.start_time >= TRADE_TIMEOUT_SECS {
                self.cancel_trade(trade_id, now);
            }
        }
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            total_trades: self.total_trades,
            successful_trades: self.successful_trades,
            failed_trades: self.failed_trades,
            total_profit: self.total_profit,
            total_fees: self.total_fees,
            total_volume: self.total_volume,
            max_drawdown: self.max_drawdown,
            current_drawdown: self.current_drawdown,
            portfolio_value: self.portfolio_value(),
        }
    }

    fn active_trades(&self) -> usize {
        self.active_trades.len()
    }
}
