//! arbx - cross-venue spot arbitrage engine
//!
//! Wires the components together per trading mode: venue adapters feed the
//! quote router, the router drives detection, signals flow to the executor
//! (live or simulated), and the backtest subcommand replays history instead.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbx::backtest::Backtester;
use arbx::config::{Config, TradingMode, Tunables};
use arbx::detector::{Detector, DetectorParams};
use arbx::executor::{self, Executor, LiveExecutor, Simulator, SimulatorParams};
use arbx::models::{epoch_now, FeeSchedule};
use arbx::router::QuoteRouter;
use arbx::storage::Storage;
use arbx::universe::UniverseService;
use arbx::venues::build_adapters;

#[derive(Parser)]
#[command(name = "arbx", about = "Cross-venue spot arbitrage engine")]
struct Cli {
    /// Configuration file; <stem>.local.toml is overlaid when present.
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Trade with real orders on the configured venues.
    Live,
    /// Paper-trade live market data through the simulator.
    Simulate,
    /// Replay persisted history through detection and the simulator.
    Backtest {
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
        /// Comma-separated canonical symbols; all persisted when omitted.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Comma-separated venue names; configured venues when omitted.
        #[arg(long, value_delimiter = ',')]
        venues: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // The subcommand overrides the configured trading mode.
    let mut backtest_args: Option<(Vec<String>, Vec<String>)> = None;
    match &cli.command {
        Some(Command::Live) => config.trading_mode = TradingMode::Live,
        Some(Command::Simulate) => config.trading_mode = TradingMode::Simulation,
        Some(Command::Backtest {
            start_date,
            end_date,
            symbols,
            venues,
        }) => {
            config.trading_mode = TradingMode::Backtest;
            if let Some(start) = start_date {
                config.backtest.start_date = start.clone();
            }
            if let Some(end) = end_date {
                config.backtest.end_date = end.clone();
            }
            backtest_args = Some((venues.clone(), symbols.clone()));
        }
        None => {}
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            error!("configuration: {}", error);
        }
        std::process::exit(1);
    }

    let outcome = match config.trading_mode {
        TradingMode::Backtest => {
            let (venues, symbols) = backtest_args.unwrap_or_default();
            run_backtest(config, venues, symbols).await
        }
        mode => run_engine(config, mode).await,
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_backtest(config: Config, venues: Vec<String>, symbols: Vec<String>) -> Result<()> {
    let storage = Arc::new(Storage::open(&config.persistence.path)?);
    let venues = if venues.is_empty() {
        config.arbitrage_venues()
    } else {
        venues
    };

    let backtester = Backtester::new(config, storage);
    let result = backtester.run(&venues, &symbols).await?;

    info!("backtest complete");
    info!(
        "  trades: {} total, {} successful, {} failed",
        result.total_trades, result.successful_trades, result.failed_trades
    );
    info!(
        "  P&L: gross ${:.2}, fees ${:.2}, net ${:.2}",
        result.gross_profit, result.total_fees, result.net_profit
    );
    info!(
        "  risk: max drawdown {:.2}%, sharpe {:.2}, profit factor {:.2}, win rate {:.1}%",
        result.max_drawdown, result.sharpe_ratio, result.profit_factor, result.win_rate
    );
    for (symbol, pnl) in &result.per_symbol_pnl {
        info!("  {}: ${:.2}", symbol, pnl);
    }
    for (pair, pnl) in &result.per_pair_pnl {
        info!("  {}: ${:.2}", pair, pnl);
    }
    Ok(())
}

async fn run_engine(config: Config, mode: TradingMode) -> Result<()> {
    let mode_name = if mode == TradingMode::Live {
        "live"
    } else {
        "simulation"
    };
    info!("starting arbx in {} mode", mode_name);

    let storage = Arc::new(Storage::open(&config.persistence.path)?);
    let tunables = Arc::new(Tunables::new(&config.arbitrage));
    let shutdown = Arc::new(AtomicBool::new(false));

    let adapters = build_adapters(&config);
    if adapters.len() < 2 {
        anyhow::bail!("at least 2 venue adapters are required, got {}", adapters.len());
    }

    let (quote_tx, quote_rx) = mpsc::channel(1024);
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let (symbols_tx, symbols_rx) = mpsc::channel(4);

    for adapter in adapters.values() {
        adapter.set_quote_sink(quote_tx.clone());
    }
    drop(quote_tx);

    let venue_fees: std::collections::HashMap<String, FeeSchedule> = config
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
    let detector = Detector::new(
        DetectorParams::from_config(&config.arbitrage),
        venue_fees,
        &config.premium_detection,
        Arc::clone(&tunables),
    );
    let router = QuoteRouter::new(
        detector,
        Arc::clone(&storage),
        signal_tx,
        &config.persistence,
    );

    let executor: Box<dyn Executor> = match mode {
        TradingMode::Live => Box::new(LiveExecutor::new(
            &config,
            adapters.clone(),
            Arc::clone(&tunables),
            Arc::clone(&storage),
        )),
        _ => Box::new(Simulator::new(
            &config,
            Arc::clone(&tunables),
            Arc::clone(&storage),
            SimulatorParams {
                slippage_tolerance: config.arbitrage.slippage_tolerance,
                ..Default::default()
            },
        )),
    };

    let universe = UniverseService::new(adapters.clone(), &config.arbitrage);

    let router_task = tokio::spawn(router.run(quote_rx, symbols_rx, Arc::clone(&shutdown)));
    let executor_task = tokio::spawn(executor::run_executor(
        executor,
        signal_rx,
        Arc::clone(&shutdown),
    ));
    let universe_task = tokio::spawn(universe.run(symbols_tx, Arc::clone(&shutdown)));
    let maintenance_task = tokio::spawn(maintenance(
        Arc::clone(&storage),
        config.persistence.clone(),
        Arc::clone(&shutdown),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown requested, draining");
    shutdown.store(true, Ordering::SeqCst);

    // Streams close first so the router's quote channel drains to empty.
    for adapter in adapters.values() {
        adapter.disconnect_stream().await;
    }

    for (name, task) in [
        ("router", router_task),
        ("executor", executor_task),
        ("universe", universe_task),
        ("maintenance", maintenance_task),
    ] {
        if tokio::time::timeout(std::time::Duration::from_secs(10), task)
            .await
            .is_err()
        {
            warn!("{} task did not drain in time", name);
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Hourly retention cleanup plus periodic file-copy backups.
async fn maintenance(
    storage: Arc<Storage>,
    persistence: arbx::config::PersistenceConfig,
    shutdown: Arc<AtomicBool>,
) {
    // One-second poll so shutdown is observed promptly; the work itself
    // runs on an hourly cadence.
    let mut poll = tokio::time::interval(std::time::Duration::from_secs(1));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seconds: u64 = 0;
    let mut hours: u64 = 0;

    loop {
        poll.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        seconds += 1;
        if seconds % 3600 != 0 {
            continue;
        }
        if let Err(e) = storage.cleanup(persistence.max_history_days, epoch_now()) {
            warn!("storage cleanup failed: {}", e);
        }
        hours += 1;
        if persistence.backup_interval_hours > 0 && hours % persistence.backup_interval_hours == 0 {
            let backup_dir = Path::new(&persistence.path)
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups");
            if let Err(e) = storage.backup_to(&backup_dir) {
                warn!("backup failed: {}", e);
            }
        }
    }
}
