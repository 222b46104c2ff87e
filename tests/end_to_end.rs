//! End-to-end scenarios: quotes through the router into detection, signals
//! into the simulator, settled trades and opportunities in the database,
//! and deterministic CSV-driven backtests.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use arbx::backtest::Backtester;
use arbx::config::{BacktestDataSource, Config, Tunables, VenueConfig};
use arbx::detector::{Detector, DetectorParams};
use arbx::executor::{Executor, Simulator, SimulatorParams};
use arbx::models::{epoch_now, FeeSchedule, Quote, TradeStatus};
use arbx::router::QuoteRouter;
use arbx::storage::Storage;

fn two_venue_config(taker: f64) -> Config {
    let mut config = Config::default();
    for venue in ["v1", "v2"] {
        config.venues.insert(
            venue.to_string(),
            VenueConfig {
                maker_fee: taker,
                taker_fee: taker,
                ..Default::default()
            },
        );
    }
    config.arbitrage.min_profit_threshold = 0.0001;
    config.arbitrage.slippage_tolerance = 0.0005;
    config
}

fn detector_for(config: &Config, tunables: Arc<Tunables>) -> Detector {
    let fees: HashMap<String, FeeSchedule> = config
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
        fees,
        &config.premium_detection,
        tunables,
    );
    detector.set_active_symbols(["BTCUSDT".to_string()]);
    detector
}

fn quote(venue: &str, bid: f64, ask: f64, ts: f64) -> Quote {
    Quote {
        venue: venue.to_string(),
        symbol: "BTCUSDT".to_string(),
        bid,
        ask,
        bid_size: 1.0,
        ask_size: 1.0,
        timestamp: ts,
        synthetic: false,
    }
}

#[tokio::test]
async fn profitable_pair_settles_into_the_database() {
    let config = two_venue_config(0.0003);
    let tunables = Arc::new(Tunables::new(&config.arbitrage));
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let (signal_tx, mut signal_rx) = mpsc::channel(16);

    let mut router = QuoteRouter::new(
        detector_for(&config, Arc::clone(&tunables)),
        Arc::clone(&storage),
        signal_tx,
        &config.persistence,
    );

    // Live-shaped wall-clock timestamps so the executor's freshness gate
    // sees a young signal.
    let now = epoch_now();
    router.on_quote(quote("v1", 60000.0, 60010.0, now), now);
    router.on_quote(quote("v2", 60100.0, 60110.0, now + 0.1), now + 0.1);

    let signal = signal_rx.try_recv().expect("signal emitted");
    assert_eq!(signal.buy_venue, "v1");
    assert_eq!(signal.sell_venue, "v2");
    assert_eq!(storage.count_opportunities().unwrap(), 1);

    let mut simulator = Simulator::new(
        &config,
        tunables,
        Arc::clone(&storage),
        SimulatorParams {
            partial_fill_probability: 0.0,
            order_reject_probability: 0.0,
            slippage_tolerance: 0.0005,
            ..Default::default()
        },
    );
    assert!(simulator.execute(&signal, signal.timestamp).await);
    simulator.poll(signal.timestamp + 3.0).await;

    let trades = storage.trades().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Completed);
    assert_eq!(trades[0].symbol, "BTCUSDT");
}

#[tokio::test]
async fn recorded_trade_profit_matches_leg_fills_minus_fees() {
    let taker = 0.001;
    let config = two_venue_config(0.0003);
    let tunables = Arc::new(Tunables::new(&config.arbitrage));
    let storage = Arc::new(Storage::open_in_memory().unwrap());

    let mut config_fees = config.clone();
    for venue in config_fees.venues.values_mut() {
        venue.taker_fee = taker;
    }
    let mut simulator = Simulator::new(
        &config_fees,
        tunables,
        Arc::clone(&storage),
        SimulatorParams {
            partial_fill_probability: 1.0,
            order_reject_probability: 0.0,
            slippage_tolerance: 0.0005,
            ..Default::default()
        },
    );

    let signal = arbx::models::ArbitrageSignal {
        symbol: "BTCUSDT".to_string(),
        buy_venue: "v1".to_string(),
        sell_venue: "v2".to_string(),
        buy_price: 60010.0,
        sell_price: 60100.0,
        profit: 30.0,
        profit_fraction: 0.0005,
        buy_size: 1.0,
        sell_size: 1.0,
        timestamp: 0.0,
        confidence: 0.9,
        baseline_adjusted_fraction: None,
        z_score: None,
        is_outlier: false,
    };
    assert!(simulator.execute(&signal, 0.0).await);
    simulator.poll(3.0).await;

    let trades = storage.trades().unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.status, TradeStatus::Completed);

    // Invariant: recorded profit equals leg fills x avg price minus fees.
    let orders = storage.orders().unwrap();
    assert_eq!(orders.len(), 2);
    let buy = orders
        .iter()
        .find(|o| o.side == arbx::models::OrderSide::Buy)
        .unwrap();
    let sell = orders
        .iter()
        .find(|o| o.side == arbx::models::OrderSide::Sell)
        .unwrap();
    let buy_cost = buy.filled_quantity * buy.average_price.unwrap();
    let sell_proceeds = sell.filled_quantity * sell.average_price.unwrap();
    let fees = buy_cost * taker + sell_proceeds * taker;
    let expected = sell_proceeds - buy_cost - fees;
    assert!(
        (trade.profit - expected).abs() < 1e-6,
        "recorded {} vs derived {}",
        trade.profit,
        expected
    );

    // Both legs filled 70%.
    assert!((buy.filled_quantity - buy.quantity * 0.7).abs() < 1e-12);
    assert!((sell.filled_quantity - sell.quantity * 0.7).abs() < 1e-12);
}

#[tokio::test]
async fn cooldown_suppresses_repeat_signals_through_the_router() {
    let config = two_venue_config(0.0003);
    let tunables = Arc::new(Tunables::new(&config.arbitrage));
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let (signal_tx, mut signal_rx) = mpsc::channel(16);
    let mut router = QuoteRouter::new(
        detector_for(&config, tunables),
        storage,
        signal_tx,
        &config.persistence,
    );

    router.on_quote(quote("v1", 60000.0, 60010.0, 0.0), 0.0);
    router.on_quote(quote("v2", 60100.0, 60110.0, 0.1), 0.1);
    assert!(signal_rx.try_recv().is_ok());

    // Same dislocation 30s later: still inside the 60s cooldown.
    router.on_quote(quote("v1", 60000.0, 60010.0, 30.0), 30.0);
    router.on_quote(quote("v2", 60100.0, 60110.0, 30.1), 30.1);
    assert!(signal_rx.try_recv().is_err());

    // Past the cooldown it fires again.
    router.on_quote(quote("v1", 60000.0, 60010.0, 65.0), 65.0);
    router.on_quote(quote("v2", 60100.0, 60110.0, 65.1), 65.1);
    assert!(signal_rx.try_recv().is_ok());
}

#[tokio::test]
async fn file_backed_persistence_round_trips_quotes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbx.db");
    let storage = Storage::open(path.to_str().unwrap()).unwrap();

    let original = vec![
        quote("v1", 60000.0, 60010.0, 100.0),
        quote("v2", 60100.0, 60110.0, 100.5),
    ];
    storage.insert_quotes_batch(&original).unwrap();
    drop(storage);

    let reopened = Storage::open(path.to_str().unwrap()).unwrap();
    let loaded = reopened.quotes_in_range(&[], &[], 0.0, 200.0).unwrap();
    assert_eq!(loaded, original);
}

/// Scenario: a one-hour CSV capture replays identically twice, and a larger
/// slippage assumption can only reduce net profit.
#[tokio::test]
async fn csv_backtest_is_deterministic_and_slippage_monotone() {
    let dir = tempfile::tempdir().unwrap();
    for venue in ["v1", "v2"] {
        let path = dir.path().join(format!("{}_BTCUSDT.csv", venue));
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "timestamp,bid,ask,bid_size,ask_size").unwrap();
        let (bid, ask) = if venue == "v1" {
            (60000.0, 60010.0)
        } else {
            // Wide enough that fills stay profitable after double-sided
            // slippage at the tighter tolerance.
            (60200.0, 60210.0)
        };
        // 1000 quotes across one hour, 3.6s apart.
        for i in 0..1000 {
            let ts = i as f64 * 3.6 + if venue == "v2" { 0.1 } else { 0.0 };
            writeln!(file, "{},{},{},1.0,1.0", ts, bid, ask).unwrap();
        }
    }

    let make_config = |slippage: f64| {
        let mut config = two_venue_config(0.0003);
        config.arbitrage.slippage_tolerance = slippage;
        config.backtest.start_date = "1970-01-01".to_string();
        config.backtest.end_date = "1970-01-02".to_string();
        config.backtest.data_source = BacktestDataSource::Csv;
        config.backtest.csv_path = Some(dir.path().to_string_lossy().to_string());
        config
    };
    let venues = vec!["v1".to_string(), "v2".to_string()];
    let symbols = vec!["BTCUSDT".to_string()];

    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let backtester = Backtester::new(make_config(0.0005), Arc::clone(&storage));
    let first = backtester.run(&venues, &symbols).await.unwrap();
    let second = backtester.run(&venues, &symbols).await.unwrap();

    assert!(first.signals_emitted > 0);
    assert_eq!(first.signals_emitted, second.signals_emitted);
    assert_eq!(first.total_trades, second.total_trades);
    assert!((first.net_profit - second.net_profit).abs() < 1e-12);

    let wider = Backtester::new(make_config(0.002), storage);
    let degraded = wider.run(&venues, &symbols).await.unwrap();
    assert!(degraded.net_profit <= first.net_profit);
}
