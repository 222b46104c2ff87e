//! Quote router
//!
//! Single consumer of every adapter's quote stream. Each quote is handed to
//! the detector synchronously (pure in-memory work), detection output is
//! forwarded — signals to the executor channel without blocking, opportunity
//! rows to storage — and the quote itself goes into the batched persistence
//! buffer behind a per-(venue, symbol) minimum-interval gate.
//!
//! Back-pressure: the persistence buffer drops oldest when full; the
//! detection path never drops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::detector::Detector;
use crate::models::{epoch_now, ArbitrageSignal, Quote};
use crate::storage::Storage;

pub struct QuoteRouter {
    detector: Detector,
    storage: Arc<Storage>,
    signal_tx: mpsc::Sender<ArbitrageSignal>,
    buffer: VecDeque<Quote>,
    buffer_cap: usize,
    /// Last buffered write per (venue, symbol).
    last_write: HashMap<(String, String), f64>,
    last_flush: f64,
    batch_size: usize,
    batch_interval: f64,
    dropped_quotes: u64,
}

impl QuoteRouter {
    pub fn new(
        detector: Detector,
        storage: Arc<Storage>,
        signal_tx: mpsc::Sender<ArbitrageSignal>,
        persistence: &PersistenceConfig,
    ) -> Self {
        let batch_size = persistence.batch_size.max(1);
        Self {
            detector,
            storage,
            signal_tx,
            buffer: VecDeque::with_capacity(batch_size),
            buffer_cap: batch_size * 2,
            last_write: HashMap::new(),
            last_flush: 0.0,
            batch_size,
            batch_interval: persistence.batch_interval_seconds.max(0.1),
            dropped_quotes: 0,
        }
    }

    pub fn detector_mut(&mut self) -> &mut Detector {
        &mut self.detector
    }

    pub fn on_quote(&mut self, quote: Quote, now: f64) {
        let outcome = self.detector.on_quote(&quote, now);

        for opportunity in &outcome.opportunities {
            if let Err(e) = self.storage.insert_opportunity(opportunity) {
                warn!("failed to store opportunity: {}", e);
            }
        }

        for signal in outcome.signals {
            match self.signal_tx.try_send(signal) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(signal)) => {
                    warn!(
                        symbol = %signal.symbol,
                        "executor busy, dropping signal"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("executor channel closed");
                }
            }
        }

        let key = (quote.venue.clone(), quote.symbol.clone());
        let due = self
            .last_write
            .get(&key)
            .map_or(true, |last| now - last >= self.batch_interval);
        if due {
            self.last_write.insert(key, now);
            if self.buffer.len() >= self.buffer_cap {
                self.buffer.pop_front();
                self.dropped_quotes += 1;
            }
            self.buffer.push_back(quote);
        }

        if self.buffer.len() >= self.batch_size || now - self.last_flush >= self.batch_interval {
            self.flush(now);
        }
    }

    /// Bulk insert of the buffered quotes. A failed write drops the batch;
    /// persistence is not critical to the hot loop.
    pub fn flush(&mut self, now: f64) {
        self.last_flush = now;
        if self.buffer.is_empty() {
            return;
        }
        let batch: Vec<Quote> = self.buffer.drain(..).collect();
        if let Err(e) = self.storage.insert_quotes_batch(&batch) {
            warn!("quote batch of {} dropped: {}", batch.len(), e);
        }
    }

    /// Main loop: quotes in, periodic flush, symbol-universe updates.
    pub async fn run(
        mut self,
        mut quote_rx: mpsc::Receiver<Quote>,
        mut symbols_rx: mpsc::Receiver<Vec<String>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let flush_period = std::time::Duration::from_secs_f64(self.batch_interval);
        let mut flush_timer = tokio::time::interval(flush_period);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                quote = quote_rx.recv() => match quote {
                    Some(quote) => self.on_quote(quote, epoch_now()),
                    None => break,
                },
                symbols = symbols_rx.recv() => {
                    if let Some(symbols) = symbols {
                        self.detector.set_active_symbols(symbols);
                    }
                }
                _ = flush_timer.tick() => self.flush(epoch_now()),
            }
        }

        self.flush(epoch_now());
        if self.dropped_quotes > 0 {
            info!(
                "router drained; {} quotes dropped from the persistence buffer",
                self.dropped_quotes
            );
        } else {
            info!("router drained");
        }
    }
}
