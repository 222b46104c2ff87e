//! Live executor
//!
//! Places real paired market orders through the venue adapters and
//! supervises their lifecycle: parallel placement with best-effort unwind
//! when one leg fails, periodic order-state polling, the five-minute
//! timeout, and realized-profit settlement from actual fills. Balances are
//! refreshed on an interval and drive the drawdown halt.

use async_trait::async_trait;
use futures_util::future::join;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{clamp_trade_size, refusal_reason, Executor, ExecutorStats, TRADE_TIMEOUT_SECS};
use crate::config::{Config, RiskConfig, Tunables};
use crate::models::{
    split_symbol, ArbitrageSignal, Balance, FeeSchedule, Order, OrderSide, OrderType, TradeStatus,
};
use crate::storage::{BalanceRecord, Storage, TradeRecord};
use crate::venues::VenueAdapter;

const BALANCE_REFRESH_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
struct LiveTrade {
    id: u64,
    db_id: Option<i64>,
    signal: ArbitrageSignal,
    buy_order: Order,
    sell_order: Order,
    start_time: f64,
}

pub struct LiveExecutor {
    adapters: HashMap<String, Arc<dyn VenueAdapter>>,
    storage: Arc<Storage>,
    risk: RiskConfig,
    tunables: Arc<Tunables>,
    max_position_size: f64,
    max_spread_age_seconds: f64,
    venue_fees: HashMap<String, FeeSchedule>,

    active_trades: HashMap<u64, LiveTrade>,
    trade_counter: u64,
    balances: HashMap<String, HashMap<String, Balance>>,
    initial_portfolio_value: Option<f64>,
    last_balance_refresh: f64,

    total_trades: u64,
    successful_trades: u64,
    failed_trades: u64,
    total_profit: f64,
    total_fees: f64,
    total_volume: f64,
    max_drawdown: f64,
    current_drawdown: f64,
    halted: bool,
}

impl LiveExecutor {
    pub fn new(
        config: &Config,
        adapters: HashMap<String, Arc<dyn VenueAdapter>>,
        tunables: Arc<Tunables>,
        storage: Arc<Storage>,
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
        Self {
            adapters,
            storage,
            risk: config.risk.clone(),
            tunables,
            max_position_size: config.arbitrage.max_position_size,
            max_spread_age_seconds: config.arbitrage.max_spread_age_seconds,
            venue_fees,
            active_trades: HashMap::new(),
            trade_counter: 0,
            balances: HashMap::new(),
            initial_portfolio_value: None,
            last_balance_refresh: 0.0,
            total_trades: 0,
            successful_trades: 0,
            failed_trades: 0,
            total_profit: 0.0,
            total_fees: 0.0,
            total_volume: 0.0,
            max_drawdown: 0.0,
            current_drawdown: 0.0,
            halted: false,
        }
    }

    fn taker_fee(&self, venue: &str) -> f64 {
        self.venue_fees
            .get(venue)
            .map(|f| f.taker)
            .unwrap_or_else(|| FeeSchedule::default().taker)
    }

    fn free_balance(&self, venue: &str, asset: &str) -> f64 {
        self.balances
            .get(venue)
            .and_then(|assets| assets.get(asset))
            .map(|b| b.free)
            .unwrap_or(0.0)
    }

    /// Stable-asset portfolio value; non-stable holdings are excluded from
    /// the drawdown basis.
    fn portfolio_value(&self) -> f64 {
        self.balances
            .values()
            .flat_map(|assets| assets.iter())
            .filter(|(asset, _)| matches!(asset.as_str(), "USDT" | "USDC" | "USD"))
            .map(|(_, balance)| balance.total())
            .sum()
    }

    pub async fn refresh_balances(&mut self, now: f64) {
        for (name, adapter) in &self.adapters {
            match adapter.fetch_balances(None).await {
                Ok(balances) => {
                    for (asset, balance) in &balances {
                        let usd_value = matches!(asset.as_str(), "USDT" | "USDC" | "USD")
                            .then(|| balance.total());
                        let record = BalanceRecord {
                            venue: name.clone(),
                            asset: asset.clone(),
                            free: balance.free,
                            locked: balance.locked,
                            total: balance.total(),
                            usd_value,
                            timestamp: now,
                        };
                        if let Err(e) = self.storage.insert_balance(&record) {
                            warn!("failed to store balance: {}", e);
                        }
                    }
                    self.balances.insert(name.clone(), balances);
                }
                Err(e) => warn!("balance refresh failed for {}: {}", name, e),
            }
        }
        self.last_balance_refresh = now;

        let current = self.portfolio_value();
        let initial = *self.initial_portfolio_value.get_or_insert(current);
        if initial > 0.0 {
            self.current_drawdown = ((initial - current) / initial * 100.0).max(0.0);
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

    async fn cancel_best_effort(&self, order: &Order) {
        let Some(adapter) = self.adapters.get(&order.venue) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        if let Err(e) = adapter.cancel_order(&order.order_id, &order.symbol).await {
            warn!(
                "best-effort cancel of {} on {} failed: {}",
                order.order_id, order.venue, e
            );
        }
    }

    fn store_order(&self, order: &Order) {
        if let Err(e) = self.storage.insert_order(order) {
            warn!("failed to store order: {}", e);
        }
    }

    /// Re-poll one trade's legs; returns false once the trade is finalized.
    async fn supervise(&mut self, trade: &mut LiveTrade, now: f64) -> bool {
        for order in [&mut trade.buy_order, &mut trade.sell_order] {
            if order.status.is_terminal() {
                continue;
            }
            let Some(adapter) = self.adapters.get(&order.venue) else {
                continue;
            };
            match adapter.query_order(&order.order_id, &order.symbol).await {
                Ok(updated) => {
                    *order = updated;
                    if let Err(e) = self.storage.update_order_status(order) {
                        warn!("failed to update order row: {}", e);
                    }
                }
                Err(e) => debug!(
                    "order poll failed for {} on {}: {}",
                    order.order_id, order.venue, e
                ),
            }
        }

        let buy = &trade.buy_order;
        let sell = &trade.sell_order;

        if buy.status == crate::models::OrderStatus::Rejected
            || sell.status == crate::models::OrderStatus::Rejected
        {
            let other = if buy.status == crate::models::OrderStatus::Rejected {
                sell.clone()
            } else {
                buy.clone()
            };
            self.cancel_best_effort(&other).await;
            self.finalize(trade, TradeStatus::Failed);
            return false;
        }

        let timed_out = now - trade.start_time >= TRADE_TIMEOUT_SECS;
        if timed_out {
            warn!(trade = trade.id, "trade supervision timed out");
            let pending: Vec<Order> = [buy.clone(), sell.clone()]
                .into_iter()
                .filter(|o| !o.status.is_terminal())
                .collect();
            for order in &pending {
                self.cancel_best_effort(order).await;
            }
            self.finalize(trade, TradeStatus::Cancelled);
            return false;
        }

        if buy.status.is_terminal() && sell.status.is_terminal() {
            let status = if buy.status.is_filled_any() || sell.status.is_filled_any() {
                TradeStatus::Completed
            } else {
                TradeStatus::Cancelled
            };
            self.finalize(trade, status);
            return false;
        }

        true
    }

    fn finalize(&mut self, trade: &LiveTrade, status: TradeStatus) {
        let buy = &trade.buy_order;
        let sell = &trade.sell_order;
        let buy_cost = buy.filled_quantity * buy.fill_price();
        let sell_proceeds = sell.filled_quantity * sell.fill_price();
        let fees =
            buy_cost * self.taker_fee(&buy.venue) + sell_proceeds * self.taker_fee(&sell.venue);
        let profit = sell_proceeds - buy_cost - fees;

        if status == TradeStatus::Completed && profit > 0.0 {
            self.successful_trades += 1;
        } else {
            self.failed_trades += 1;
        }
        self.total_profit += profit;
        self.total_fees += fees;
        self.total_volume += buy_cost;

        if let Some(db_id) = trade.db_id {
            if let Err(e) = self.storage.update_trade_result(
                db_id,
                status,
                profit,
                Some(&buy.order_id),
                Some(&sell.order_id),
            ) {
                warn!("failed to update trade record: {}", e);
            }
        }
        // Record the schedules the settlement was charged under.
        for order in [buy, sell] {
            if let Some(schedule) = self.venue_fees.get(&order.venue) {
                if let Err(e) =
                    self.storage
                        .upsert_fee(&order.venue, &order.symbol, schedule, order.timestamp)
                {
                    warn!("failed to store fee schedule: {}", e);
                }
            }
        }
        info!(
            trade = trade.id,
            symbol = %trade.signal.symbol,
            status = status.as_str(),
            profit,
            "trade finalized"
        );
    }
}

#[async_trait]
impl Executor for LiveExecutor {
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

        let (Some(buy_adapter), Some(sell_adapter)) = (
            self.adapters.get(&signal.buy_venue).cloned(),
            self.adapters.get(&signal.sell_venue).cloned(),
        ) else {
            warn!(
                "adapters unavailable for {} / {}",
                signal.buy_venue, signal.sell_venue
            );
            return false;
        };

        self.trade_counter += 1;
        let trade_id = self.trade_counter;
        info!(
            trade = trade_id,
            symbol = %signal.symbol,
            buy = %signal.buy_venue,
            sell = %signal.sell_venue,
            size,
            "executing arbitrage trade"
        );

        let (buy_result, sell_result) = join(
            buy_adapter.place_order(&signal.symbol, OrderSide::Buy, OrderType::Market, size, None),
            sell_adapter.place_order(
                &signal.symbol,
                OrderSide::Sell,
                OrderType::Market,
                size,
                None,
            ),
        )
        .await;

        let (buy_order, sell_order) = match (buy_result, sell_result) {
            (Ok(buy), Ok(sell)) => (buy, sell),
            (Ok(buy), Err(e)) => {
                warn!("sell leg placement failed: {}; unwinding buy leg", e);
                self.cancel_best_effort(&buy).await;
                return false;
            }
            (Err(e), Ok(sell)) => {
                warn!("buy leg placement failed: {}; unwinding sell leg", e);
                self.cancel_best_effort(&sell).await;
                return false;
            }
            (Err(buy_err), Err(sell_err)) => {
                warn!(
                    "both legs failed to place: buy: {}; sell: {}",
                    buy_err, sell_err
                );
                return false;
            }
        };

        self.store_order(&buy_order);
        self.store_order(&sell_order);

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
                buy_order_id: Some(buy_order.order_id.clone()),
                sell_order_id: Some(sell_order.order_id.clone()),
                status: TradeStatus::Pending,
                timestamp: now,
            })
            .map_err(|e| warn!("failed to store trade: {}", e))
            .ok();

        self.active_trades.insert(
            trade_id,
            LiveTrade {
                id: trade_id,
                db_id,
                signal: signal.clone(),
                buy_order,
                sell_order,
                start_time: now,
            },
        );
        self.total_trades += 1;
        true
    }

    async fn poll(&mut self, now: f64) {
        if now - self.last_balance_refresh >= BALANCE_REFRESH_SECS {
            self.refresh_balances(now).await;
        }

        let ids: Vec<u64> = self.active_trades.keys().copied().collect();
        for id in ids {
            let Some(mut trade) = self.active_trades.remove(&id) else {
                continue;
            };
            if self.supervise(&mut trade, now).await {
                self.active_trades.insert(id, trade);
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
