//! Symbol universe service
//!
//! Decides which symbols the engine watches: each enabled venue's tradable
//! set, filtered to the enabled quote currencies and the venue deny-lists,
//! intersected across venues, deterministically sorted and truncated. The
//! result is published to the detector (via the router's symbol channel) and
//! pushed to each adapter as its subscription set.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ArbitrageConfig;
use crate::models::split_symbol;
use crate::venues::VenueAdapter;

/// Symbols kept when a venue cannot enumerate its markets.
pub const FALLBACK_MAJORS: &[&str] = &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT"];

const REFRESH_INTERVAL_SECS: u64 = 3600;

/// Observed per-connection subscription ceilings.
pub fn venue_symbol_limit(venue: &str) -> usize {
    match venue {
        "binance" => 200,
        "bybit" => 50,
        "upbit" => 100,
        _ => 100,
    }
}

/// Core set computation, separated from I/O for testability.
pub fn intersect_universe(
    per_venue: &[(String, HashSet<String>)],
    max_symbols: usize,
) -> Vec<String> {
    if per_venue.is_empty() {
        return Vec::new();
    }

    let mut common: Option<HashSet<String>> = None;
    for (_, symbols) in per_venue {
        common = Some(match common {
            None => symbols.clone(),
            Some(acc) => acc.intersection(symbols).cloned().collect(),
        });
    }
    let common = common.unwrap_or_default();

    let limit = per_venue
        .iter()
        .map(|(venue, _)| venue_symbol_limit(venue))
        .min()
        .unwrap_or(max_symbols)
        .min(max_symbols);

    // BTreeSet gives the lexicographic order the truncation depends on.
    common
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(limit)
        .collect()
}

pub struct UniverseService {
    adapters: HashMap<String, Arc<dyn VenueAdapter>>,
    enabled_quote_currencies: Vec<String>,
    max_symbols: usize,
}

impl UniverseService {
    pub fn new(
        adapters: HashMap<String, Arc<dyn VenueAdapter>>,
        arbitrage: &ArbitrageConfig,
    ) -> Self {
        Self {
            adapters,
            enabled_quote_currencies: arbitrage.enabled_quote_currencies.clone(),
            max_symbols: arbitrage.max_symbols,
        }
    }

    fn quote_enabled(&self, symbol: &str) -> bool {
        split_symbol(symbol)
            .map(|(_, quote)| self.enabled_quote_currencies.iter().any(|q| q == quote))
            .unwrap_or(false)
    }

    /// One enumeration pass over every venue.
    pub async fn compute(&self) -> Vec<String> {
        let mut per_venue: Vec<(String, HashSet<String>)> = Vec::new();

        for (name, adapter) in &self.adapters {
            let symbols = match adapter.list_symbols().await {
                Ok(symbols) => symbols,
                Err(e) => {
                    warn!(
                        "{} failed to enumerate symbols: {}; using fallback majors",
                        name, e
                    );
                    FALLBACK_MAJORS.iter().map(|s| s.to_string()).collect()
                }
            };
            let deny: HashSet<String> = adapter.deny_list().into_iter().collect();
            let filtered: HashSet<String> = symbols
                .into_iter()
                .map(|s| s.to_uppercase())
                .filter(|s| self.quote_enabled(s))
                .filter(|s| !deny.contains(s))
                .collect();
            info!("{}: {} tradable symbols after filtering", name, filtered.len());
            per_venue.push((name.clone(), filtered));
        }

        per_venue.sort_by(|a, b| a.0.cmp(&b.0));
        let universe = intersect_universe(&per_venue, self.max_symbols);
        info!("symbol universe: {} symbols", universe.len());
        universe
    }

    /// Startup + periodic refresh. Publishes the set to the detector and,
    /// when it changes, re-subscribes every adapter.
    pub async fn run(
        self,
        symbols_tx: mpsc::Sender<Vec<String>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut current: Vec<String> = Vec::new();
        // Poll every second so shutdown is observed promptly; the actual
        // refresh runs on the hourly cadence.
        let mut poll = tokio::time::interval(std::time::Duration::from_secs(1));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut since_refresh = REFRESH_INTERVAL_SECS;

        loop {
            poll.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            since_refresh += 1;
            if since_refresh <= REFRESH_INTERVAL_SECS {
                continue;
            }
            since_refresh = 0;

            let universe = self.compute().await;
            if universe.is_empty() {
                warn!("empty symbol universe, keeping previous set");
                continue;
            }
            if universe == current {
                continue;
            }

            if symbols_tx.send(universe.clone()).await.is_err() {
                break;
            }
            for (name, adapter) in &self.adapters {
                if !current.is_empty() {
                    adapter.disconnect_stream().await;
                }
                if let Err(e) = adapter.connect_stream(universe.clone()).await {
                    warn!("{} failed to subscribe: {}", name, e);
                }
            }
            current = universe;
        }
        info!("universe service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn intersection_across_two_venues() {
        let per_venue = vec![
            ("binance".to_string(), set(&["BTCUSDT", "ETHUSDT", "XRPUSDT"])),
            ("bybit".to_string(), set(&["ETHUSDT", "BTCUSDT", "SOLUSDT"])),
        ];
        let universe = intersect_universe(&per_venue, 200);
        assert_eq!(universe, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[test]
    fn single_venue_passes_through_sorted() {
        let per_venue = vec![("binance".to_string(), set(&["ETHUSDT", "BTCUSDT"]))];
        let universe = intersect_universe(&per_venue, 200);
        assert_eq!(universe, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[test]
    fn truncation_respects_venue_limit_and_ordering() {
        let symbols: Vec<String> = (0..300).map(|i| format!("AA{:03}USDT", i)).collect();
        let per_venue = vec![
            (
                "binance".to_string(),
                symbols.iter().cloned().collect::<HashSet<_>>(),
            ),
            (
                "bybit".to_string(),
                symbols.iter().cloned().collect::<HashSet<_>>(),
            ),
        ];
        // bybit's 50-per-connection limit binds before max_symbols.
        let universe = intersect_universe(&per_venue, 200);
        assert_eq!(universe.len(), 50);
        assert_eq!(universe[0], "AA000USDT");
        assert!(universe.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn max_symbols_binds_when_smaller() {
        let per_venue = vec![(
            "binance".to_string(),
            (0..100)
                .map(|i| format!("AA{:03}USDT", i))
                .collect::<HashSet<_>>(),
        )];
        let universe = intersect_universe(&per_venue, 10);
        assert_eq!(universe.len(), 10);
    }

    #[test]
    fn quote_currency_filter_applies() {
        let service = UniverseService {
            adapters: HashMap::new(),
            enabled_quote_currencies: vec!["USDT".to_string()],
            max_symbols: 200,
        };
        assert!(service.quote_enabled("BTCUSDT"));
        assert!(!service.quote_enabled("ETHBTC"));
        assert!(!service.quote_enabled("SOLUSDC"));
        assert!(!service.quote_enabled("GARBAGE"));
    }

    #[test]
    fn disjoint_sets_intersect_to_nothing() {
        let per_venue = vec![
            ("binance".to_string(), set(&["BTCUSDT"])),
            ("bybit".to_string(), set(&["ETHUSDT"])),
        ];
        assert!(intersect_universe(&per_venue, 200).is_empty());
    }
}
