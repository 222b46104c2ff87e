//! Trade execution
//!
//! Two executors share one contract: the live executor places real orders
//! through venue adapters; the simulator models the venue side against an
//! in-memory portfolio. Both accept signals, refuse on the same risk gates,
//! size identically, and report the same stats surface.

pub mod live;
pub mod sim;

pub use live::LiveExecutor;
pub use sim::{Simulator, SimulatorParams};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{RiskConfig, TunableValues};
use crate::models::{epoch_now, ArbitrageSignal};

#[async_trait]
pub trait Executor: Send {
    /// Accept a signal. Returns true when a paired execution was initiated.
    async fn execute(&mut self, signal: &ArbitrageSignal, now: f64) -> bool;

    /// Drive order lifecycles: fills, monitoring, timeouts, settlement.
    async fn poll(&mut self, now: f64);

    fn stats(&self) -> ExecutorStats;

    fn active_trades(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorStats {
    pub total_trades: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub total_profit: f64,
    pub total_fees: f64,
    pub total_volume: f64,
    /// Percent of initial portfolio value.
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub portfolio_value: f64,
}

/// Supervision timeout after which pending legs are canceled.
pub const TRADE_TIMEOUT_SECS: f64 = 300.0;

/// Shared refusal gates. Returns the reason a signal must be refused, or
/// None when execution may proceed.
#[allow(clippy::too_many_arguments)]
pub fn refusal_reason(
    signal: &ArbitrageSignal,
    now: f64,
    active_trades: usize,
    risk: &RiskConfig,
    tunables: &TunableValues,
    max_spread_age_seconds: f64,
    current_drawdown_pct: f64,
    quote_free_on_buy_venue: f64,
    base_free_on_sell_venue: f64,
) -> Option<&'static str> {
    if active_trades >= risk.max_concurrent_trades {
        return Some("max concurrent trades reached");
    }
    if signal.profit_fraction < tunables.min_profit_threshold {
        return Some("profit below threshold");
    }
    if current_drawdown_pct >= risk.max_drawdown_percent {
        return Some("drawdown limit reached");
    }
    if now - signal.timestamp > max_spread_age_seconds {
        return Some("signal too old");
    }
    if quote_free_on_buy_venue < tunables.trade_amount_usd {
        return Some("insufficient quote balance on buy venue");
    }
    if signal.sell_price > 0.0
        && base_free_on_sell_venue < tunables.trade_amount_usd / signal.sell_price
    {
        return Some("insufficient base balance on sell venue");
    }
    None
}

/// Sizing clamp chain: desired notional bounded by balances, displayed
/// sizes, and the position cap.
pub fn clamp_trade_size(
    signal: &ArbitrageSignal,
    trade_amount_usd: f64,
    max_position_size: f64,
    quote_free_on_buy_venue: f64,
    base_free_on_sell_venue: f64,
) -> f64 {
    if signal.buy_price <= 0.0 {
        return 0.0;
    }
    let desired = trade_amount_usd / signal.buy_price;
    desired
        .min(quote_free_on_buy_venue / signal.buy_price)
        .min(base_free_on_sell_venue)
        .min(signal.buy_size)
        .min(signal.sell_size)
        .min(max_position_size / signal.buy_price)
        .max(0.0)
}

/// Executor task: signals in, a 1s heartbeat drives order supervision.
pub async fn run_executor(
    mut executor: Box<dyn Executor>,
    mut signal_rx: mpsc::Receiver<ArbitrageSignal>,
    shutdown: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            signal = signal_rx.recv() => match signal {
                Some(signal) => {
                    executor.execute(&signal, epoch_now()).await;
                }
                None => break,
            },
            _ = tick.tick() => executor.poll(epoch_now()).await,
        }
    }

    // In-flight orders are left to settle; canceling on shutdown would
    // abandon half-completed pairs.
    let stats = executor.stats();
    info!(
        "executor drained: {} trades, net ${:.2}, fees ${:.2}",
        stats.total_trades,
        stats.total_profit - stats.total_fees,
        stats.total_fees
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(profit_fraction: f64, timestamp: f64) -> ArbitrageSignal {
        ArbitrageSignal {
            symbol: "BTCUSDT".to_string(),
            buy_venue: "v1".to_string(),
            sell_venue: "v2".to_string(),
            buy_price: 60010.0,
            sell_price: 60100.0,
            profit: profit_fraction * 60010.0,
            profit_fraction,
            buy_size: 1.0,
            sell_size: 1.0,
            timestamp,
            confidence: 0.8,
            baseline_adjusted_fraction: None,
            z_score: None,
            is_outlier: false,
        }
    }

    fn tunables() -> TunableValues {
        TunableValues {
            min_profit_threshold: 0.0005,
            trade_amount_usd: 100.0,
        }
    }

    #[test]
    fn refusal_gates_fire_in_order() {
        let risk = RiskConfig::default();
        let sig = signal(0.001, 10.0);

        assert_eq!(
            refusal_reason(&sig, 10.0, 3, &risk, &tunables(), 5.0, 0.0, 1e6, 1e6),
            Some("max concurrent trades reached")
        );
        assert_eq!(
            refusal_reason(&signal(0.0001, 10.0), 10.0, 0, &risk, &tunables(), 5.0, 0.0, 1e6, 1e6),
            Some("profit below threshold")
        );
        assert_eq!(
            refusal_reason(&sig, 10.0, 0, &risk, &tunables(), 5.0, 6.0, 1e6, 1e6),
            Some("drawdown limit reached")
        );
        assert_eq!(
            refusal_reason(&sig, 20.0, 0, &risk, &tunables(), 5.0, 0.0, 1e6, 1e6),
            Some("signal too old")
        );
        assert_eq!(
            refusal_reason(&sig, 10.0, 0, &risk, &tunables(), 5.0, 0.0, 50.0, 1e6),
            Some("insufficient quote balance on buy venue")
        );
        assert_eq!(
            refusal_reason(&sig, 10.0, 0, &risk, &tunables(), 5.0, 0.0, 1e6, 0.0001),
            Some("insufficient base balance on sell venue")
        );
        assert_eq!(
            refusal_reason(&sig, 10.0, 0, &risk, &tunables(), 5.0, 0.0, 1e6, 1e6),
            None
        );
    }

    #[test]
    fn sizing_respects_every_clamp() {
        let mut sig = signal(0.001, 0.0);

        // Unconstrained: desired notional over buy price.
        let size = clamp_trade_size(&sig, 100.0, 1000.0, 1e9, 1e9);
        assert!((size - 100.0 / 60010.0).abs() < 1e-12);

        // Quote balance binds.
        let size = clamp_trade_size(&sig, 100.0, 1000.0, 60.0, 1e9);
        assert!((size - 60.0 / 60010.0).abs() < 1e-12);

        // Displayed size binds.
        sig.buy_size = 0.0001;
        let size = clamp_trade_size(&sig, 100.0, 1000.0, 1e9, 1e9);
        assert!((size - 0.0001).abs() < 1e-12);
        sig.buy_size = 1.0;

        // Position cap binds.
        let size = clamp_trade_size(&sig, 100_000.0, 500.0, 1e9, 1e9);
        assert!((size - 500.0 / 60010.0).abs() < 1e-12);

        // Degenerate price.
        sig.buy_price = 0.0;
        assert_eq!(clamp_trade_size(&sig, 100.0, 1000.0, 1e9, 1e9), 0.0);
    }
}
