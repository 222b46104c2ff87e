//! Arbitrage detection engine
//!
//! Maintains the freshness-bounded last-quote table and, on every update,
//! recomputes candidate venue pairs for that symbol: fee- and
//! slippage-adjusted profit, confidence, premium baseline annotation,
//! cooldowns and the trailing-hour rate cap. The detector is pure in-memory
//! state driven by a single writer (the quote router); it does no I/O and
//! never raises. Persistence records are returned to the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ArbitrageConfig, PremiumDetectionConfig, Tunables};
use crate::models::{ArbitrageSignal, FeeSchedule, Quote};
use crate::premium::PremiumTracker;
use crate::storage::OpportunityRecord;

/// Minimum spacing between signals for the same (symbol, buy, sell) triple.
pub const SIGNAL_COOLDOWN_SECS: f64 = 60.0;

/// Cleanup cadence, and the age past which table entries are evicted.
const CLEANUP_INTERVAL_SECS: f64 = 300.0;
const STALE_ENTRY_SECS: f64 = 300.0;
const COOLDOWN_RETENTION_SECS: f64 = 3600.0;

/// Ring size for the recent-signal history exposed to displays.
const RECENT_SIGNALS_CAP: usize = 100;

/// Displayed size at which the size half of confidence saturates.
const CONFIDENCE_SIZE_SCALE: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub slippage_tolerance: f64,
    pub max_spread_age_seconds: f64,
    pub max_spread_threshold: f64,
    pub max_trades_per_hour: usize,
}

impl DetectorParams {
    pub fn from_config(arbitrage: &ArbitrageConfig) -> Self {
        Self {
            slippage_tolerance: arbitrage.slippage_tolerance,
            max_spread_age_seconds: arbitrage.max_spread_age_seconds,
            max_spread_threshold: arbitrage.max_spread_threshold,
            max_trades_per_hour: arbitrage.max_trades_per_hour,
        }
    }
}

#[derive(Debug, Clone)]
struct QuoteEntry {
    quote: Quote,
    arrival_time: f64,
    fees: FeeSchedule,
}

/// One candidate pairing, before threshold/cooldown gates.
struct Candidate {
    buy_venue: String,
    sell_venue: String,
    buy_price: f64,
    sell_price: f64,
    buy_size: f64,
    sell_size: f64,
    profit: f64,
    profit_fraction: f64,
    confidence: f64,
    synthetic: bool,
}

/// What a single quote update produced: signals for the executor and rows
/// for persistence. The caller owns all I/O.
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub signals: Vec<ArbitrageSignal>,
    pub opportunities: Vec<OpportunityRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorStats {
    pub signals_generated: u64,
    pub signals_executed: u64,
    pub total_profit: f64,
    pub signals_last_hour: usize,
    pub tracked_quotes: usize,
}

pub struct Detector {
    params: DetectorParams,
    tunables: Arc<Tunables>,
    venue_fees: HashMap<String, FeeSchedule>,
    premium: PremiumTracker,
    quote_table: HashMap<(String, String), QuoteEntry>,
    cooldowns: HashMap<(String, String, String), f64>,
    recent_signals: VecDeque<ArbitrageSignal>,
    /// Emission times in the trailing hour, for the rate cap.
    signal_times: VecDeque<f64>,
    active_symbols: HashSet<String>,
    last_cleanup: f64,
    signals_generated: u64,
    signals_executed: u64,
    total_profit: f64,
}

impl Detector {
    pub fn new(
        params: DetectorParams,
        venue_fees: HashMap<String, FeeSchedule>,
        premium_config: &PremiumDetectionConfig,
        tunables: Arc<Tunables>,
    ) -> Self {
        Self {
            params,
            tunables,
            venue_fees,
            premium: PremiumTracker::new(premium_config),
            quote_table: HashMap::new(),
            cooldowns: HashMap::new(),
            recent_signals: VecDeque::with_capacity(RECENT_SIGNALS_CAP),
            signal_times: VecDeque::new(),
            active_symbols: HashSet::new(),
            last_cleanup: 0.0,
            signals_generated: 0,
            signals_executed: 0,
            total_profit: 0.0,
        }
    }

    /// Replace the monitored symbol set (published by the universe service).
    pub fn set_active_symbols<I: IntoIterator<Item = String>>(&mut self, symbols: I) {
        self.active_symbols = symbols.into_iter().collect();
        info!("detector monitoring {} symbols", self.active_symbols.len());
    }

    pub fn active_symbol_count(&self) -> usize {
        self.active_symbols.len()
    }

    /// Process one quote. `now` is the caller's clock: wall time in live and
    /// simulation modes, the replay timestamp in backtests.
    pub fn on_quote(&mut self, quote: &Quote, now: f64) -> DetectionOutcome {
        let mut outcome = DetectionOutcome::default();

        if !self.active_symbols.contains(&quote.symbol) {
            return outcome;
        }
        if !quote.is_valid() {
            debug!(
                venue = %quote.venue,
                symbol = %quote.symbol,
                "dropping invalid quote"
            );
            return outcome;
        }

        let fees = self
            .venue_fees
            .get(&quote.venue)
            .copied()
            .unwrap_or_default();
        self.quote_table.insert(
            (quote.venue.clone(), quote.symbol.clone()),
            QuoteEntry {
                quote: quote.clone(),
                arrival_time: now,
                fees,
            },
        );

        let candidates = self.candidates_for(&quote.symbol, now);
        for candidate in candidates {
            self.evaluate_candidate(&quote.symbol, candidate, now, &mut outcome);
        }

        self.maybe_cleanup(now);
        outcome
    }

    /// All profitable ordered pairings among fresh entries for a symbol.
    fn candidates_for(&self, symbol: &str, now: f64) -> Vec<Candidate> {
        let fresh: Vec<&QuoteEntry> = self
            .quote_table
            .iter()
            .filter(|((_, s), entry)| {
                s == symbol && now - entry.arrival_time <= self.params.max_spread_age_seconds
            })
            .map(|(_, entry)| entry)
            .collect();

        if fresh.len() < 2 {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for buy in &fresh {
            for sell in &fresh {
                if buy.quote.venue == sell.quote.venue {
                    continue;
                }
                if let Some(candidate) = self.compute_candidate(buy, sell, now) {
                    candidates.push(candidate);
                }
            }
        }
        // Deterministic evaluation order regardless of hash-map iteration.
        candidates.sort_by(|a, b| {
            (a.buy_venue.as_str(), a.sell_venue.as_str())
                .cmp(&(b.buy_venue.as_str(), b.sell_venue.as_str()))
        });
        candidates
    }

    fn compute_candidate(&self, buy: &QuoteEntry, sell: &QuoteEntry, now: f64) -> Option<Candidate> {
        let buy_price = buy.quote.ask;
        let sell_price = sell.quote.bid;
        if buy_price <= 0.0 {
            return None;
        }

        let gross = sell_price - buy_price;
        let fee_cost = buy_price * buy.fees.taker + sell_price * sell.fees.taker;
        let slippage_cost = buy_price * self.params.slippage_tolerance;
        let profit = gross - fee_cost - slippage_cost;
        let profit_fraction = profit / buy_price;
        if profit_fraction <= 0.0 {
            return None;
        }

        let size_confidence =
            (buy.quote.ask_size.min(sell.quote.bid_size) / CONFIDENCE_SIZE_SCALE).clamp(0.0, 1.0);
        let age = now - buy.arrival_time.max(sell.arrival_time);
        let age_confidence = (1.0 - age / self.params.max_spread_age_seconds).max(0.0);
        let confidence = 0.5 * size_confidence + 0.5 * age_confidence;

        Some(Candidate {
            buy_venue: buy.quote.venue.clone(),
            sell_venue: sell.quote.venue.clone(),
            buy_price,
            sell_price,
            buy_size: buy.quote.ask_size,
            sell_size: sell.quote.bid_size,
            profit,
            profit_fraction,
            confidence,
            synthetic: buy.quote.synthetic || sell.quote.synthetic,
        })
    }

    fn evaluate_candidate(
        &mut self,
        symbol: &str,
        candidate: Candidate,
        now: f64,
        outcome: &mut DetectionOutcome,
    ) {
        // The baseline tracks every profitable pairing, gated or not.
        let annotation = self.premium.observe(
            &candidate.buy_venue,
            &candidate.sell_venue,
            symbol,
            candidate.profit_fraction,
        );

        let min_profit = self.tunables.get().min_profit_threshold;
        if candidate.profit_fraction < min_profit {
            return;
        }
        if candidate.profit_fraction > self.params.max_spread_threshold {
            warn!(
                symbol,
                buy = %candidate.buy_venue,
                sell = %candidate.sell_venue,
                spread_pct = candidate.profit_fraction * 100.0,
                "abnormal spread filtered out"
            );
            return;
        }

        // Synthetic books are display-only; never trade against them.
        if candidate.synthetic {
            debug!(
                symbol,
                buy = %candidate.buy_venue,
                sell = %candidate.sell_venue,
                "skipping signal from synthesized quote"
            );
            return;
        }

        let cooldown_key = (
            symbol.to_string(),
            candidate.buy_venue.clone(),
            candidate.sell_venue.clone(),
        );
        if let Some(last) = self.cooldowns.get(&cooldown_key) {
            if now - last < SIGNAL_COOLDOWN_SECS {
                return;
            }
        }

        while let Some(front) = self.signal_times.front() {
            if now - front >= 3600.0 {
                self.signal_times.pop_front();
            } else {
                break;
            }
        }
        if self.signal_times.len() >= self.params.max_trades_per_hour {
            warn!("max trades per hour reached, skipping opportunity");
            return;
        }

        outcome.opportunities.push(OpportunityRecord {
            symbol: symbol.to_string(),
            buy_venue: candidate.buy_venue.clone(),
            sell_venue: candidate.sell_venue.clone(),
            buy_price: candidate.buy_price,
            sell_price: candidate.sell_price,
            profit: candidate.profit,
            profit_fraction: candidate.profit_fraction,
            executed: false,
            timestamp: now,
        });

        let signal = ArbitrageSignal {
            symbol: symbol.to_string(),
            buy_venue: candidate.buy_venue.clone(),
            sell_venue: candidate.sell_venue.clone(),
            buy_price: candidate.buy_price,
            sell_price: candidate.sell_price,
            profit: candidate.profit,
            profit_fraction: candidate.profit_fraction,
            buy_size: candidate.buy_size,
            sell_size: candidate.sell_size,
            timestamp: now,
            confidence: candidate.confidence,
            baseline_adjusted_fraction: annotation.map(|a| a.adjusted_fraction),
            z_score: annotation.map(|a| a.z_score),
            is_outlier: annotation.map(|a| a.is_outlier).unwrap_or(false),
        };

        info!(
            symbol,
            buy = %signal.buy_venue,
            sell = %signal.sell_venue,
            buy_price = signal.buy_price,
            sell_price = signal.sell_price,
            profit_pct = signal.profit_fraction * 100.0,
            "arbitrage opportunity detected"
        );

        self.cooldowns.insert(cooldown_key, now);
        self.signal_times.push_back(now);
        self.signals_generated += 1;
        if self.recent_signals.len() >= RECENT_SIGNALS_CAP {
            self.recent_signals.pop_front();
        }
        self.recent_signals.push_back(signal.clone());
        outcome.signals.push(signal);
    }

    /// Periodic eviction of stale table entries and expired cooldowns.
    fn maybe_cleanup(&mut self, now: f64) {
        if now - self.last_cleanup < CLEANUP_INTERVAL_SECS {
            return;
        }
        self.last_cleanup = now;
        let before = self.quote_table.len();
        self.quote_table
            .retain(|_, entry| now - entry.arrival_time <= STALE_ENTRY_SECS);
        self.cooldowns
            .retain(|_, set_at| now - *set_at <= COOLDOWN_RETENTION_SECS);
        let evicted = before - self.quote_table.len();
        if evicted > 0 {
            debug!("evicted {} stale quote entries", evicted);
        }
    }

    /// Executor feedback for stats (used by the backtester).
    pub fn mark_signal_executed(&mut self, profit: f64) {
        self.signals_executed += 1;
        self.total_profit += profit;
    }

    pub fn recent_signals(&self, limit: usize) -> Vec<ArbitrageSignal> {
        self.recent_signals
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self, now: f64) -> DetectorStats {
        DetectorStats {
            signals_generated: self.signals_generated,
            signals_executed: self.signals_executed,
            total_profit: self.total_profit,
            signals_last_hour: self
                .signal_times
                .iter()
                .filter(|t| now - **t < 3600.0)
                .count(),
            tracked_quotes: self.quote_table.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(venue: &str, symbol: &str, bid: f64, ask: f64, size: f64, ts: f64) -> Quote {
        Quote {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            bid,
            ask,
            bid_size: size,
            ask_size: size,
            timestamp: ts,
            synthetic: false,
        }
    }

    fn detector(min_profit: f64, taker: f64) -> Detector {
        let params = DetectorParams {
            slippage_tolerance: 0.0005,
            max_spread_age_seconds: 5.0,
            max_spread_threshold: 2.0,
            max_trades_per_hour: 50,
        };
        let mut fees = HashMap::new();
        for venue in ["v1", "v2"] {
            fees.insert(
                venue.to_string(),
                FeeSchedule {
                    maker: taker,
                    taker,
                },
            );
        }
        let arbitrage = ArbitrageConfig {
            min_profit_threshold: min_profit,
            ..Default::default()
        };
        let premium = PremiumDetectionConfig {
            enabled: true,
            lookback_periods: 100,
            min_samples: 50,
            outlier_threshold: 2.0,
        };
        let mut detector = Detector::new(
            params,
            fees,
            &premium,
            Arc::new(Tunables::new(&arbitrage)),
        );
        detector.set_active_symbols(["BTCUSDT".to_string()]);
        detector
    }

    #[test]
    fn single_fresh_quote_emits_nothing() {
        let mut detector = detector(0.0001, 0.0003);
        let outcome = detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        assert!(outcome.signals.is_empty());
        assert!(outcome.opportunities.is_empty());
    }

    #[test]
    fn profitable_pair_emits_with_expected_fraction() {
        let mut detector = detector(0.0001, 0.0003);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 0.1), 0.1);

        assert_eq!(outcome.signals.len(), 1);
        let signal = &outcome.signals[0];
        assert_eq!(signal.buy_venue, "v1");
        assert_eq!(signal.sell_venue, "v2");
        assert_eq!(signal.buy_price, 60010.0);
        assert_eq!(signal.sell_price, 60100.0);

        let expected = (60100.0 - 60010.0
            - (60010.0 * 0.0003 + 60100.0 * 0.0003)
            - 60010.0 * 0.0005)
            / 60010.0;
        assert!((signal.profit_fraction - expected).abs() < 1e-12);
        assert!(signal.confidence >= 0.0 && signal.confidence <= 1.0);
        assert_eq!(outcome.opportunities.len(), 1);
    }

    #[test]
    fn below_min_profit_is_dropped() {
        // Same book as above but the threshold sits above the net fraction.
        let mut detector = detector(0.0005, 0.0003);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 0.1), 0.1);
        assert!(outcome.signals.is_empty());
        assert!(outcome.opportunities.is_empty());
    }

    #[test]
    fn identical_books_never_emit() {
        let mut detector = detector(0.0001, 0.001);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.1), 0.1);
        assert!(outcome.signals.is_empty());
    }

    #[test]
    fn anomalous_spread_is_filtered_without_opportunity_row() {
        let mut detector = detector(0.0001, 0.001);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        // Feed glitch: bid more than triple the other venue's ask.
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 200000.0, 200010.0, 1.0, 0.1), 0.1);
        assert!(outcome.signals.is_empty());
        assert!(outcome.opportunities.is_empty());
    }

    #[test]
    fn cooldown_blocks_then_releases() {
        let mut detector = detector(0.0001, 0.0003);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        let first = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 0.1), 0.1);
        assert_eq!(first.signals.len(), 1);

        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 30.0), 30.0);
        let during = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 30.0), 30.0);
        assert!(during.signals.is_empty());

        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 65.0), 65.0);
        let after = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 65.0), 65.0);
        assert_eq!(after.signals.len(), 1);
    }

    #[test]
    fn stale_quote_is_excluded_from_pairing() {
        let mut detector = detector(0.0001, 0.0003);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        // v1's entry is now 10s old with a 5s freshness window.
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 10.0), 10.0);
        assert!(outcome.signals.is_empty());
    }

    #[test]
    fn hourly_rate_cap_applies_to_trailing_window() {
        let mut detector = detector(0.0001, 0.0003);
        detector.params.max_trades_per_hour = 2;
        detector.set_active_symbols(
            ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
                .iter()
                .map(|s| s.to_string()),
        );

        let mut emitted = 0;
        // Distinct symbols avoid the per-pair cooldown; the cap is global.
        for (i, symbol) in ["BTCUSDT", "ETHUSDT", "SOLUSDT"].iter().enumerate() {
            let t = i as f64;
            detector.on_quote(&quote("v1", symbol, 60000.0, 60010.0, 1.0, t), t);
            emitted += detector
                .on_quote(&quote("v2", symbol, 60100.0, 60110.0, 1.0, t), t)
                .signals
                .len();
        }
        assert_eq!(emitted, 2);
    }

    #[test]
    fn inactive_symbols_are_dropped() {
        let mut detector = detector(0.0001, 0.0003);
        detector.on_quote(&quote("v1", "DOGEUSDT", 0.1, 0.1001, 1.0, 0.0), 0.0);
        let outcome = detector.on_quote(&quote("v2", "DOGEUSDT", 0.11, 0.1101, 1.0, 0.1), 0.1);
        assert!(outcome.signals.is_empty());
        assert_eq!(detector.stats(0.1).tracked_quotes, 0);
    }

    #[test]
    fn synthetic_quotes_never_emit_signals() {
        let mut detector = detector(0.0001, 0.0003);
        let mut synthetic = quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0);
        synthetic.synthetic = true;
        detector.on_quote(&synthetic, 0.0);
        let outcome = detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 0.1), 0.1);
        assert!(outcome.signals.is_empty());
        // The quote still refreshes the table for display purposes.
        assert_eq!(detector.stats(0.1).tracked_quotes, 2);
    }

    #[test]
    fn cleanup_evicts_stale_entries_and_cooldowns() {
        let mut detector = detector(0.0001, 0.0003);
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 0.0), 0.0);
        detector.on_quote(&quote("v2", "BTCUSDT", 60100.0, 60110.0, 1.0, 0.1), 0.1);
        assert_eq!(detector.stats(0.1).tracked_quotes, 2);

        // Next update is far in the future; the periodic sweep drops both
        // old entries while inserting the new one.
        detector.on_quote(&quote("v1", "BTCUSDT", 60000.0, 60010.0, 1.0, 1000.0), 1000.0);
        assert_eq!(detector.stats(1000.0).tracked_quotes, 1);
        // The cooldown from t=0.1 is still inside its retention window.
        assert_eq!(detector.cooldowns.len(), 1);
    }
}
