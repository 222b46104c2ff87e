//! Premium baseline tracker
//!
//! Some venue pairs trade at a persistent structural premium (regional
//! pricing, on/off-ramp friction). This module keeps a rolling window of
//! observed spread fractions per (buy venue, sell venue, symbol) triple and
//! annotates new observations with a baseline-adjusted spread and z-score.
//! It never filters signals; downstream consumers use the annotation for
//! prioritization and display.

use statrs::statistics::Statistics;
use std::collections::{HashMap, VecDeque};

use crate::config::PremiumDetectionConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PremiumAnnotation {
    /// Raw spread fraction minus the rolling mean for this pair.
    pub adjusted_fraction: f64,
    /// Rolling mean of the pair's spread fraction.
    pub baseline: f64,
    /// |adjusted| / stdev; 0 when the window has no variance.
    pub z_score: f64,
    pub is_outlier: bool,
}

pub struct PremiumTracker {
    enabled: bool,
    lookback_periods: usize,
    min_samples: usize,
    outlier_threshold: f64,
    history: HashMap<(String, String, String), VecDeque<f64>>,
}

impl PremiumTracker {
    pub fn new(config: &PremiumDetectionConfig) -> Self {
        Self {
            enabled: config.enabled,
            lookback_periods: config.lookback_periods.max(1),
            min_samples: config.min_samples.max(2),
            outlier_threshold: config.outlier_threshold,
            history: HashMap::new(),
        }
    }

    /// Record a spread observation and, once enough samples exist, return the
    /// baseline annotation for it.
    pub fn observe(
        &mut self,
        buy_venue: &str,
        sell_venue: &str,
        symbol: &str,
        spread_fraction: f64,
    ) -> Option<PremiumAnnotation> {
        if !self.enabled {
            return None;
        }

        let key = (
            buy_venue.to_string(),
            sell_venue.to_string(),
            symbol.to_string(),
        );
        let window = self.history.entry(key).or_default();
        window.push_back(spread_fraction);
        while window.len() > self.lookback_periods {
            window.pop_front();
        }

        if window.len() < self.min_samples {
            return None;
        }

        let baseline = window.iter().mean();
        let stdev = window.iter().std_dev();
        let adjusted_fraction = spread_fraction - baseline;
        let z_score = if stdev > 0.0 {
            adjusted_fraction.abs() / stdev
        } else {
            0.0
        };

        Some(PremiumAnnotation {
            adjusted_fraction,
            baseline,
            z_score,
            is_outlier: stdev > 0.0 && z_score > self.outlier_threshold,
        })
    }

    pub fn tracked_pairs(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(lookback: usize, min_samples: usize, threshold: f64) -> PremiumTracker {
        PremiumTracker::new(&PremiumDetectionConfig {
            enabled: true,
            lookback_periods: lookback,
            min_samples,
            outlier_threshold: threshold,
        })
    }

    #[test]
    fn silent_until_min_samples() {
        let mut tracker = tracker(100, 5, 2.0);
        for _ in 0..4 {
            assert!(tracker.observe("a", "b", "BTCUSDT", 0.001).is_none());
        }
        assert!(tracker.observe("a", "b", "BTCUSDT", 0.001).is_some());
    }

    #[test]
    fn constant_history_is_never_an_outlier() {
        let mut tracker = tracker(100, 3, 2.0);
        let mut last = None;
        for _ in 0..10 {
            last = tracker.observe("a", "b", "BTCUSDT", 0.002);
        }
        let annotation = last.unwrap();
        assert_eq!(annotation.z_score, 0.0);
        assert!(!annotation.is_outlier);
        assert!(annotation.adjusted_fraction.abs() < 1e-12);
    }

    #[test]
    fn spike_above_noisy_baseline_is_flagged() {
        let mut tracker = tracker(100, 10, 2.0);
        // Alternating small spreads establish a baseline with variance.
        for i in 0..20 {
            let value = if i % 2 == 0 { 0.0010 } else { 0.0012 };
            tracker.observe("a", "b", "BTCUSDT", value);
        }
        let annotation = tracker.observe("a", "b", "BTCUSDT", 0.01).unwrap();
        assert!(annotation.is_outlier, "z = {}", annotation.z_score);
        assert!(annotation.adjusted_fraction > 0.008);
    }

    #[test]
    fn window_is_bounded_by_lookback() {
        let mut tracker = tracker(5, 2, 2.0);
        for i in 0..50 {
            tracker.observe("a", "b", "ETHUSDT", i as f64);
        }
        let window = tracker
            .history
            .get(&("a".to_string(), "b".to_string(), "ETHUSDT".to_string()))
            .unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(*window.front().unwrap(), 45.0);
    }

    #[test]
    fn pairs_are_tracked_per_direction() {
        let mut tracker = tracker(10, 2, 2.0);
        tracker.observe("a", "b", "BTCUSDT", 0.001);
        tracker.observe("b", "a", "BTCUSDT", 0.001);
        assert_eq!(tracker.tracked_pairs(), 2);
    }
}
