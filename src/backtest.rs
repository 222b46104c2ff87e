//! Backtester
//!
//! Replays persisted quote history (or CSV capture) through a fresh detector
//! and simulator in strict timestamp order. Time is the replayed timestamps
//! themselves; no wall clocks and no sleeps, so two runs over the same data
//! produce identical trade sequences. The backtester opens its own storage
//! handles for the run's duration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BacktestDataSource, Config, Tunables};
use crate::detector::{Detector, DetectorParams};
use crate::executor::{Executor, Simulator, SimulatorParams, TRADE_TIMEOUT_SECS};
use crate::models::{FeeSchedule, Quote, TradeStatus};
use crate::storage::Storage;

/// Trading days used to annualize the Sharpe ratio.
const ANNUALIZATION_PERIODS: f64 = 252.0;

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub start_ts: f64,
    pub end_ts: f64,
    pub quotes_replayed: usize,
    pub signals_emitted: u64,
    pub total_trades: u64,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub gross_profit: f64,
    pub total_fees: f64,
    pub net_profit: f64,
    /// Percent of initial portfolio value.
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub profit_factor: f64,
    /// Percent of completed trades with positive profit.
    pub win_rate: f64,
    pub per_symbol_pnl: BTreeMap<String, f64>,
    /// Keyed `buy_venue->sell_venue`.
    pub per_pair_pnl: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct SweepParam {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub best_params: Vec<(String, f64)>,
    pub best_result: BacktestResult,
    pub best_score: f64,
}

#[derive(Debug, Deserialize)]
struct CsvQuoteRow {
    timestamp: f64,
    bid: f64,
    ask: f64,
    bid_size: f64,
    ask_size: f64,
}

pub struct Backtester {
    config: Config,
    storage: Arc<Storage>,
}

impl Backtester {
    pub fn new(config: Config, storage: Arc<Storage>) -> Self {
        Self { config, storage }
    }

    fn date_range(&self) -> Result<(f64, f64)> {
        let parse = |label: &str, date: &str| -> Result<f64> {
            let day = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .with_context(|| format!("{} is not a valid YYYY-MM-DD date", label))?;
            let midnight = day
                .and_hms_opt(0, 0, 0)
                .with_context(|| format!("invalid time for {}", label))?;
            Ok(midnight.and_utc().timestamp() as f64)
        };
        let start = parse("backtest.start_date", &self.config.backtest.start_date)?;
        // End date is inclusive.
        let end = parse("backtest.end_date", &self.config.backtest.end_date)? + 86_400.0;
        if end <= start {
            bail!("backtest end date precedes start date");
        }
        Ok((start, end))
    }

    /// Load the replay set, sorted by (timestamp, venue, symbol).
    pub fn load_quotes(&self, venues: &[String], symbols: &[String]) -> Result<Vec<Quote>> {
        let (start, end) = self.date_range()?;
        let mut quotes = match self.config.backtest.data_source {
            BacktestDataSource::Database => {
                self.storage.quotes_in_range(venues, symbols, start, end)?
            }
            BacktestDataSource::Csv => {
                let dir = self
                    .config
                    .backtest
                    .csv_path
                    .clone()
                    .context("backtest.csv_path required for CSV replay")?;
                load_csv_quotes(Path::new(&dir), venues, symbols, start, end)?
            }
        };
        quotes.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.venue.cmp(&b.venue))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        info!(
            "loaded {} quotes for replay ({} -> {})",
            quotes.len(),
            self.config.backtest.start_date,
            self.config.backtest.end_date
        );
        Ok(quotes)
    }

    pub async fn run(&self, venues: &[String], symbols: &[String]) -> Result<BacktestResult> {
        let quotes = self.load_quotes(venues, symbols)?;
        if quotes.is_empty() {
            bail!("no historical quotes in the requested range");
        }
        self.replay(&quotes).await
    }

    /// Replay pre-loaded quotes through fresh detection and simulation
    /// state. Public so sweeps (and tests) can reuse one loaded set.
    pub async fn replay(&self, quotes: &[Quote]) -> Result<BacktestResult> {
        self.replay_with(&self.config, quotes).await
    }

    async fn replay_with(&self, config: &Config, quotes: &[Quote]) -> Result<BacktestResult> {
        if quotes.is_empty() {
            bail!("nothing to replay");
        }
        let tunables = Arc::new(Tunables::new(&config.arbitrage));
        let scratch = Arc::new(Storage::open_in_memory()?);

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
        let mut detector = Detector::new(
            DetectorParams::from_config(&config.arbitrage),
            venue_fees,
            &config.premium_detection,
            Arc::clone(&tunables),
        );
        let replay_symbols: BTreeSet<String> = quotes.iter().map(|q| q.symbol.clone()).collect();
        detector.set_active_symbols(replay_symbols);

        let sim_params = SimulatorParams {
            slippage_tolerance: config.arbitrage.slippage_tolerance,
            initial_balance_usd: config.backtest.initial_balance,
            seed: config.backtest.seed,
            ..Default::default()
        };
        let mut simulator = Simulator::new(config, tunables, scratch, sim_params);

        let mut signals_emitted: u64 = 0;
        let mut samples: Vec<f64> = vec![simulator.portfolio_value()];
        let mut last_day = (quotes[0].timestamp / 86_400.0).floor() as i64;

        for quote in quotes {
            let now = quote.timestamp;
            let outcome = detector.on_quote(quote, now);
            for signal in outcome.signals {
                signals_emitted += 1;
                let profit = signal.profit;
                if simulator.execute(&signal, now).await {
                    detector.mark_signal_executed(profit);
                }
            }
            simulator.poll(now).await;

            let day = (now / 86_400.0).floor() as i64;
            if day != last_day {
                samples.push(simulator.portfolio_value());
                last_day = day;
            }
        }

        // Let in-flight orders fill or time out on the synthetic clock.
        let end_ts = quotes.last().map(|q| q.timestamp).unwrap_or(0.0);
        simulator.poll(end_ts + TRADE_TIMEOUT_SECS + 1.0).await;
        samples.push(simulator.portfolio_value());

        let stats = simulator.stats();
        let daily_returns: Vec<f64> = samples
            .windows(2)
            .filter(|pair| pair[0] > 0.0)
            .map(|pair| (pair[1] - pair[0]) / pair[0])
            .collect();
        let sharpe_ratio = if daily_returns.len() > 1 {
            let mean = daily_returns.iter().mean();
            let stdev = daily_returns.iter().std_dev();
            if stdev > 0.0 {
                mean / stdev * ANNUALIZATION_PERIODS.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        let profits = simulator.completed_trade_profits();
        let wins: f64 = profits.iter().filter(|p| **p > 0.0).sum();
        let losses: f64 = profits.iter().filter(|p| **p <= 0.0).map(|p| p.abs()).sum();
        let profit_factor = if losses > 0.0 {
            wins / losses
        } else if wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let mut per_symbol_pnl: BTreeMap<String, f64> = BTreeMap::new();
        let mut per_pair_pnl: BTreeMap<String, f64> = BTreeMap::new();
        let mut completed = 0u64;
        let mut won = 0u64;
        for summary in simulator.completed_trade_summaries() {
            if summary.status != TradeStatus::Completed {
                continue;
            }
            completed += 1;
            if summary.profit > 0.0 {
                won += 1;
            }
            *per_symbol_pnl.entry(summary.symbol).or_insert(0.0) += summary.profit;
            let pair = format!("{}->{}", summary.buy_venue, summary.sell_venue);
            *per_pair_pnl.entry(pair).or_insert(0.0) += summary.profit;
        }
        let win_rate = if completed > 0 {
            won as f64 / completed as f64 * 100.0
        } else {
            0.0
        };

        Ok(BacktestResult {
            start_ts: quotes.first().map(|q| q.timestamp).unwrap_or(0.0),
            end_ts,
            quotes_replayed: quotes.len(),
            signals_emitted,
            total_trades: stats.total_trades,
            successful_trades: stats.successful_trades,
            failed_trades: stats.failed_trades,
            gross_profit: stats.total_profit + stats.total_fees,
            total_fees: stats.total_fees,
            net_profit: stats.total_profit,
            max_drawdown: stats.max_drawdown,
            sharpe_ratio,
            profit_factor,
            win_rate,
            per_symbol_pnl,
            per_pair_pnl,
        })
    }

    /// Grid search maximizing `sharpe · net_profit`. Each combination runs
    /// against a cloned configuration, so the base parameters are untouched
    /// afterwards.
    pub async fn parameter_sweep(
        &self,
        venues: &[String],
        symbols: &[String],
        grid: &[SweepParam],
    ) -> Result<SweepOutcome> {
        let quotes = self.load_quotes(venues, symbols)?;
        if quotes.is_empty() {
            bail!("no historical quotes in the requested range");
        }

        let mut combos: Vec<Vec<(String, f64)>> = vec![Vec::new()];
        for param in grid {
            let mut next = Vec::new();
            for combo in &combos {
                for value in &param.values {
                    let mut extended = combo.clone();
                    extended.push((param.name.clone(), *value));
                    next.push(extended);
                }
            }
            combos = next;
        }
        info!("parameter sweep over {} combinations", combos.len());

        let mut best: Option<SweepOutcome> = None;
        for (index, combo) in combos.iter().enumerate() {
            let mut config = self.config.clone();
            for (name, value) in combo {
                if !apply_param(&mut config, name, *value) {
                    warn!("unknown sweep parameter '{}', skipping", name);
                }
            }
            let result = self.replay_with(&config, &quotes).await?;
            let score = result.sharpe_ratio * result.net_profit;
            info!(
                "combination {}/{}: net ${:.2}, sharpe {:.2}, score {:.4}",
                index + 1,
                combos.len(),
                result.net_profit,
                result.sharpe_ratio,
                score
            );
            let better = best.as_ref().map_or(true, |b| score > b.best_score);
            if better {
                best = Some(SweepOutcome {
                    best_params: combo.clone(),
                    best_result: result,
                    best_score: score,
                });
            }
        }
        best.context("parameter sweep produced no results")
    }
}

fn apply_param(config: &mut Config, name: &str, value: f64) -> bool {
    match name {
        "min_profit_threshold" => config.arbitrage.min_profit_threshold = value,
        "slippage_tolerance" => config.arbitrage.slippage_tolerance = value,
        "max_spread_threshold" => config.arbitrage.max_spread_threshold = value,
        "trade_amount_usd" => config.arbitrage.trade_amount_usd = value,
        "max_spread_age_seconds" => config.arbitrage.max_spread_age_seconds = value,
        _ => return false,
    }
    true
}

/// One file per `venue_symbol`, format `timestamp,bid,ask,bid_size,ask_size`.
fn load_csv_quotes(
    dir: &Path,
    venues: &[String],
    symbols: &[String],
    start: f64,
    end: f64,
) -> Result<Vec<Quote>> {
    let mut quotes = Vec::new();
    for venue in venues {
        for symbol in symbols {
            let path = dir.join(format!("{}_{}.csv", venue, symbol));
            if !path.exists() {
                warn!("CSV file not found: {:?}", path);
                continue;
            }
            let mut reader =
                csv::Reader::from_path(&path).with_context(|| format!("opening {:?}", path))?;
            for row in reader.deserialize::<CsvQuoteRow>() {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("skipping malformed CSV row in {:?}: {}", path, e);
                        continue;
                    }
                };
                if row.timestamp < start || row.timestamp > end {
                    continue;
                }
                quotes.push(Quote {
                    venue: venue.clone(),
                    symbol: symbol.clone(),
                    bid: row.bid,
                    ask: row.ask,
                    bid_size: row.bid_size,
                    ask_size: row.ask_size,
                    timestamp: row.timestamp,
                    synthetic: false,
                });
            }
        }
    }
    Ok(quotes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueConfig;
    use std::io::Write;

    fn test_config() -> Config {
        let mut config = Config::default();
        for venue in ["v1", "v2"] {
            let venue_config = VenueConfig {
                maker_fee: 0.0003,
                taker_fee: 0.0003,
                ..Default::default()
            };
            config.venues.insert(venue.to_string(), venue_config);
        }
        config.arbitrage.min_profit_threshold = 0.0001;
        config.arbitrage.slippage_tolerance = 0.0005;
        config.backtest.start_date = "1970-01-01".to_string();
        config.backtest.end_date = "1970-01-02".to_string();
        config
    }

    fn spread_quotes(count: usize) -> Vec<Quote> {
        // Alternating venue updates with a persistent profitable spread.
        let mut quotes = Vec::new();
        for i in 0..count {
            let ts = i as f64;
            quotes.push(Quote {
                venue: "v1".to_string(),
                symbol: "BTCUSDT".to_string(),
                bid: 60000.0,
                ask: 60010.0,
                bid_size: 1.0,
                ask_size: 1.0,
                timestamp: ts,
                synthetic: false,
            });
            quotes.push(Quote {
                venue: "v2".to_string(),
                symbol: "BTCUSDT".to_string(),
                bid: 60200.0,
                ask: 60210.0,
                bid_size: 1.0,
                ask_size: 1.0,
                timestamp: ts + 0.1,
                synthetic: false,
            });
        }
        quotes
    }

    #[tokio::test]
    async fn replay_emits_and_settles_trades() {
        let config = test_config();
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let backtester = Backtester::new(config, storage);

        let result = backtester.replay(&spread_quotes(200)).await.unwrap();
        assert!(result.signals_emitted > 0);
        assert!(result.total_trades > 0);
        assert_eq!(result.quotes_replayed, 400);
        assert!(!result.per_symbol_pnl.is_empty());
    }

    #[tokio::test]
    async fn identical_replays_are_identical() {
        let config = test_config();
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let backtester = Backtester::new(config, storage);
        let quotes = spread_quotes(150);

        let first = backtester.replay(&quotes).await.unwrap();
        let second = backtester.replay(&quotes).await.unwrap();
        assert_eq!(first.signals_emitted, second.signals_emitted);
        assert_eq!(first.total_trades, second.total_trades);
        assert!((first.net_profit - second.net_profit).abs() < 1e-12);
        assert!((first.sharpe_ratio - second.sharpe_ratio).abs() < 1e-12);
    }

    #[tokio::test]
    async fn higher_slippage_never_increases_net_profit() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let quotes = spread_quotes(150);

        let mut low = test_config();
        low.arbitrage.slippage_tolerance = 0.0005;
        let low_result = Backtester::new(low, Arc::clone(&storage))
            .replay(&quotes)
            .await
            .unwrap();

        let mut high = test_config();
        high.arbitrage.slippage_tolerance = 0.002;
        let high_result = Backtester::new(high, storage).replay(&quotes).await.unwrap();

        assert!(high_result.net_profit <= low_result.net_profit);
    }

    #[tokio::test]
    async fn csv_loading_filters_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        for venue in ["v1", "v2"] {
            let path = dir.path().join(format!("{}_BTCUSDT.csv", venue));
            let mut file = std::fs::File::create(path).unwrap();
            writeln!(file, "timestamp,bid,ask,bid_size,ask_size").unwrap();
            let (bid, ask) = if venue == "v1" {
                (60000.0, 60010.0)
            } else {
                (60100.0, 60110.0)
            };
            for i in 0..50 {
                writeln!(file, "{},{},{},1.0,1.0", i as f64 + 0.1, bid, ask).unwrap();
            }
            // Out-of-range row is filtered by the date window.
            writeln!(file, "999999999,{},{},1.0,1.0", bid, ask).unwrap();
        }

        let mut config = test_config();
        config.backtest.data_source = BacktestDataSource::Csv;
        config.backtest.csv_path = Some(dir.path().to_string_lossy().to_string());
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let backtester = Backtester::new(config, storage);

        let venues = vec!["v1".to_string(), "v2".to_string()];
        let symbols = vec!["BTCUSDT".to_string()];
        let quotes = backtester.load_quotes(&venues, &symbols).unwrap();
        assert_eq!(quotes.len(), 100);
        assert!(quotes.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let result = backtester.replay(&quotes).await.unwrap();
        assert!(result.signals_emitted > 0);
    }

    #[tokio::test]
    async fn sweep_selects_best_scoring_combination() {
        let config = test_config();
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        // Seed the database source with a profitable history.
        storage.insert_quotes_batch(&spread_quotes(120)).unwrap();
        let backtester = Backtester::new(config.clone(), storage);

        let venues = vec!["v1".to_string(), "v2".to_string()];
        let symbols = vec!["BTCUSDT".to_string()];
        let outcome = backtester
            .parameter_sweep(
                &venues,
                &symbols,
                &[SweepParam {
                    name: "slippage_tolerance".to_string(),
                    values: vec![0.0005, 0.1],
                }],
            )
            .await
            .unwrap();

        // The extreme slippage value kills every opportunity; the sweep
        // must pick the workable one.
        assert_eq!(outcome.best_params[0].1, 0.0005);
        // The caller's configuration is untouched by the sweep.
        assert_eq!(config.arbitrage.slippage_tolerance, 0.0005);
    }
}
