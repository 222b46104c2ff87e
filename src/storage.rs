//! Persistence layer
//!
//! Embedded SQLite store for quotes, orders, trades, opportunities, balances
//! and fees. The hot path writes quotes through a single batched transaction;
//! everything else is single-row. WAL mode keeps readers (backtest loads,
//! stats queries) off the writers' backs.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::{FeeSchedule, Order, Quote, TradeStatus};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS quotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    bid REAL NOT NULL,
    ask REAL NOT NULL,
    bid_size REAL NOT NULL,
    ask_size REAL NOT NULL,
    timestamp REAL NOT NULL,
    synthetic INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venue TEXT NOT NULL,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL,
    status TEXT NOT NULL,
    filled_quantity REAL NOT NULL DEFAULT 0,
    average_price REAL,
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    buy_venue TEXT NOT NULL,
    sell_venue TEXT NOT NULL,
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    quantity REAL NOT NULL,
    profit REAL NOT NULL,
    profit_fraction REAL NOT NULL,
    buy_order_id TEXT,
    sell_order_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    buy_venue TEXT NOT NULL,
    sell_venue TEXT NOT NULL,
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    profit REAL NOT NULL,
    profit_fraction REAL NOT NULL,
    executed INTEGER NOT NULL DEFAULT 0,
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS balances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venue TEXT NOT NULL,
    asset TEXT NOT NULL,
    free REAL NOT NULL,
    locked REAL NOT NULL,
    total REAL NOT NULL,
    usd_value REAL,
    timestamp REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS fees (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    maker_fee REAL NOT NULL,
    taker_fee REAL NOT NULL,
    timestamp REAL NOT NULL,
    UNIQUE(venue, symbol)
);

CREATE INDEX IF NOT EXISTS idx_quotes_venue_symbol ON quotes(venue, symbol);
CREATE INDEX IF NOT EXISTS idx_quotes_timestamp ON quotes(timestamp);
CREATE INDEX IF NOT EXISTS idx_orders_venue_order_id ON orders(venue, order_id);
CREATE INDEX IF NOT EXISTS idx_orders_timestamp ON orders(timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
CREATE INDEX IF NOT EXISTS idx_opportunities_symbol ON opportunities(symbol);
CREATE INDEX IF NOT EXISTS idx_opportunities_timestamp ON opportunities(timestamp);
CREATE INDEX IF NOT EXISTS idx_balances_venue_asset ON balances(venue, asset);
CREATE INDEX IF NOT EXISTS idx_balances_timestamp ON balances(timestamp);
"#;

/// Immutable record of a detected opportunity, persisted whether or not it
/// was executed.
#[derive(Debug, Clone)]
pub struct OpportunityRecord {
    pub symbol: String,
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub profit: f64,
    pub profit_fraction: f64,
    pub executed: bool,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    pub profit: f64,
    pub profit_fraction: f64,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub status: TradeStatus,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct BalanceRecord {
    pub venue: String,
    pub asset: String,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
    pub usd_value: Option<f64>,
    pub timestamp: f64,
}

fn parse_trade_status(status: &str) -> TradeStatus {
    match status {
        "partially_filled" => TradeStatus::PartiallyFilled,
        "completed" => TradeStatus::Completed,
        "failed" => TradeStatus::Failed,
        "cancelled" => TradeStatus::Cancelled,
        _ => TradeStatus::Pending,
    }
}

/// Shared database handle. Writers serialize on the connection mutex; all
/// operations are short enough that holding it across a call is fine.
pub struct Storage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Storage {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
            }
        }
        let conn = Connection::open(path).with_context(|| format!("opening database {}", path))?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        info!("database ready at {}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(PathBuf::from(path)),
        })
    }

    /// Ephemeral store for tests and backtest scratch runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("applying schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Bulk insert inside one transaction. Returns the number of rows written.
    pub fn insert_quotes_batch(&self, quotes: &[Quote]) -> Result<usize> {
        if quotes.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO quotes (venue, symbol, bid, ask, bid_size, ask_size, timestamp, synthetic)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for quote in quotes {
                stmt.execute(params![
                    quote.venue,
                    quote.symbol,
                    quote.bid,
                    quote.ask,
                    quote.bid_size,
                    quote.ask_size,
                    quote.timestamp,
                    quote.synthetic as i64,
                ])?;
            }
        }
        tx.commit()?;
        debug!("flushed {} quotes", quotes.len());
        Ok(quotes.len())
    }

    pub fn insert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (venue, order_id, symbol, side, order_type, quantity, price,
                                 status, filled_quantity, average_price, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                order.venue,
                order.order_id,
                order.symbol,
                order.side.as_str(),
                order.order_type.as_str(),
                order.quantity,
                order.price,
                order.status.as_str(),
                order.filled_quantity,
                order.average_price,
                order.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn update_order_status(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?1, filled_quantity = ?2, average_price = ?3
             WHERE venue = ?4 AND order_id = ?5",
            params![
                order.status.as_str(),
                order.filled_quantity,
                order.average_price,
                order.venue,
                order.order_id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (symbol, buy_venue, sell_venue, buy_price, sell_price, quantity,
                                 profit, profit_fraction, buy_order_id, sell_order_id, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                trade.symbol,
                trade.buy_venue,
                trade.sell_venue,
                trade.buy_price,
                trade.sell_price,
                trade.quantity,
                trade.profit,
                trade.profit_fraction,
                trade.buy_order_id,
                trade.sell_order_id,
                trade.status.as_str(),
                trade.timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_trade_result(
        &self,
        trade_id: i64,
        status: TradeStatus,
        profit: f64,
        buy_order_id: Option<&str>,
        sell_order_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET status = ?1, profit = ?2, buy_order_id = ?3, sell_order_id = ?4
             WHERE id = ?5",
            params![status.as_str(), profit, buy_order_id, sell_order_id, trade_id],
        )?;
        Ok(())
    }

    pub fn insert_opportunity(&self, opportunity: &OpportunityRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO opportunities (symbol, buy_venue, sell_venue, buy_price, sell_price,
                                        profit, profit_fraction, executed, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                opportunity.symbol,
                opportunity.buy_venue,
                opportunity.sell_venue,
                opportunity.buy_price,
                opportunity.sell_price,
                opportunity.profit,
                opportunity.profit_fraction,
                opportunity.executed as i64,
                opportunity.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn insert_balance(&self, balance: &BalanceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO balances (venue, asset, free, locked, total, usd_value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                balance.venue,
                balance.asset,
                balance.free,
                balance.locked,
                balance.total,
                balance.usd_value,
                balance.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_fee(
        &self,
        venue: &str,
        symbol: &str,
        fees: &FeeSchedule,
        timestamp: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO fees (venue, symbol, maker_fee, taker_fee, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![venue, symbol, fees.maker, fees.taker, timestamp],
        )?;
        Ok(())
    }

    pub fn fee_for(&self, venue: &str, symbol: &str) -> Result<Option<FeeSchedule>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT maker_fee, taker_fee FROM fees WHERE venue = ?1 AND symbol = ?2")?;
        let mut rows = stmt.query_map(params![venue, symbol], |row| {
            Ok(FeeSchedule {
                maker: row.get(0)?,
                taker: row.get(1)?,
            })
        })?;
        match rows.next() {
            Some(fee) => Ok(Some(fee?)),
            None => Ok(None),
        }
    }

    /// Replay query for the backtester. Ordering is total (timestamp, venue,
    /// symbol) so two loads of the same range are identical.
    pub fn quotes_in_range(
        &self,
        venues: &[String],
        symbols: &[String],
        start: f64,
        end: f64,
    ) -> Result<Vec<Quote>> {
        let mut sql = String::from(
            "SELECT venue, symbol, bid, ask, bid_size, ask_size, timestamp, synthetic
             FROM quotes WHERE timestamp >= ? AND timestamp <= ?",
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(start), Box::new(end)];
        if !venues.is_empty() {
            sql.push_str(&format!(
                " AND venue IN ({})",
                vec!["?"; venues.len()].join(",")
            ));
            for venue in venues {
                values.push(Box::new(venue.clone()));
            }
        }
        if !symbols.is_empty() {
            sql.push_str(&format!(
                " AND symbol IN ({})",
                vec!["?"; symbols.len()].join(",")
            ));
            for symbol in symbols {
                values.push(Box::new(symbol.clone()));
            }
        }
        sql.push_str(" ORDER BY timestamp ASC, venue ASC, symbol ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], |row| {
            Ok(Quote {
                venue: row.get(0)?,
                symbol: row.get(1)?,
                bid: row.get(2)?,
                ask: row.get(3)?,
                bid_size: row.get(4)?,
                ask_size: row.get(5)?,
                timestamp: row.get(6)?,
                synthetic: row.get::<_, i64>(7)? != 0,
            })
        })?;
        let mut quotes = Vec::new();
        for row in rows {
            quotes.push(row?);
        }
        Ok(quotes)
    }

    pub fn trades(&self) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, buy_venue, sell_venue, buy_price, sell_price, quantity,
                    profit, profit_fraction, buy_order_id, sell_order_id, status, timestamp
             FROM trades ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(11)?;
            Ok(TradeRecord {
                id: Some(row.get(0)?),
                symbol: row.get(1)?,
                buy_venue: row.get(2)?,
                sell_venue: row.get(3)?,
                buy_price: row.get(4)?,
                sell_price: row.get(5)?,
                quantity: row.get(6)?,
                profit: row.get(7)?,
                profit_fraction: row.get(8)?,
                buy_order_id: row.get(9)?,
                sell_order_id: row.get(10)?,
                status: parse_trade_status(&status),
                timestamp: row.get(12)?,
            })
        })?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row?);
        }
        Ok(trades)
    }

    pub fn orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT venue, order_id, symbol, side, order_type, quantity, price, status,
                    filled_quantity, average_price, timestamp
             FROM orders ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let side: String = row.get(3)?;
            let order_type: String = row.get(4)?;
            let status: String = row.get(7)?;
            Ok(Order {
                venue: row.get(0)?,
                order_id: row.get(1)?,
                symbol: row.get(2)?,
                side: if side == "sell" {
                    crate::models::OrderSide::Sell
                } else {
                    crate::models::OrderSide::Buy
                },
                order_type: if order_type == "limit" {
                    crate::models::OrderType::Limit
                } else {
                    crate::models::OrderType::Market
                },
                quantity: row.get(5)?,
                price: row.get(6)?,
                status: crate::models::OrderStatus::parse(&status)
                    .unwrap_or(crate::models::OrderStatus::New),
                filled_quantity: row.get(8)?,
                average_price: row.get(9)?,
                timestamp: row.get(10)?,
            })
        })?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(row?);
        }
        Ok(orders)
    }

    pub fn count_quotes(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM quotes", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_opportunities(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM opportunities", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Drop quotes beyond the retention window and balance rows superseded by
    /// a newer row for the same (venue, asset).
    pub fn cleanup(&self, max_history_days: i64, now: f64) -> Result<()> {
        let cutoff = now - (max_history_days as f64) * 86_400.0;
        let conn = self.conn.lock();
        let removed_quotes = conn.execute("DELETE FROM quotes WHERE timestamp < ?1", params![cutoff])?;
        let removed_balances = conn.execute(
            "DELETE FROM balances
             WHERE id NOT IN (SELECT MAX(id) FROM balances GROUP BY venue, asset)
               AND timestamp < ?1",
            params![cutoff],
        )?;
        if removed_quotes > 0 || removed_balances > 0 {
            info!(
                "cleanup removed {} quotes, {} superseded balances",
                removed_quotes, removed_balances
            );
        }
        Ok(())
    }

    /// Periodic backup: checkpoint the WAL, then copy the database file.
    pub fn backup_to(&self, dest: &Path) -> Result<PathBuf> {
        let Some(path) = &self.path else {
            bail!("cannot back up an in-memory database");
        };
        {
            let conn = self.conn.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        std::fs::create_dir_all(dest).with_context(|| format!("creating backup dir {:?}", dest))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "arbx.db".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let target = dest.join(format!("{}.{}", file_name, stamp));
        std::fs::copy(path, &target).with_context(|| format!("copying backup to {:?}", target))?;
        info!("database backed up to {:?}", target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderType};

    fn quote(venue: &str, symbol: &str, ts: f64) -> Quote {
        Quote {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            bid: 100.0,
            ask: 100.1,
            bid_size: 2.0,
            ask_size: 3.0,
            timestamp: ts,
            synthetic: false,
        }
    }

    #[test]
    fn quote_batch_round_trips() {
        let storage = Storage::open_in_memory().unwrap();
        let quotes = vec![
            quote("binance", "BTCUSDT", 100.0),
            quote("bybit", "BTCUSDT", 100.5),
        ];
        assert_eq!(storage.insert_quotes_batch(&quotes).unwrap(), 2);

        let loaded = storage
            .quotes_in_range(&[], &["BTCUSDT".to_string()], 0.0, 200.0)
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], quotes[0]);
        assert_eq!(loaded[1], quotes[1]);
    }

    #[test]
    fn replay_query_filters_and_orders() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_quotes_batch(&[
                quote("bybit", "ETHUSDT", 3.0),
                quote("binance", "BTCUSDT", 2.0),
                quote("binance", "BTCUSDT", 1.0),
            ])
            .unwrap();

        let loaded = storage
            .quotes_in_range(&["binance".to_string()], &[], 0.0, 10.0)
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].timestamp < loaded[1].timestamp);
    }

    #[test]
    fn trade_lifecycle_updates() {
        let storage = Storage::open_in_memory().unwrap();
        let id = storage
            .insert_trade(&TradeRecord {
                id: None,
                symbol: "BTCUSDT".to_string(),
                buy_venue: "binance".to_string(),
                sell_venue: "bybit".to_string(),
                buy_price: 60010.0,
                sell_price: 60100.0,
                quantity: 0.001,
                profit: 0.0,
                profit_fraction: 0.0005,
                buy_order_id: None,
                sell_order_id: None,
                status: TradeStatus::Pending,
                timestamp: 1.0,
            })
            .unwrap();
        storage
            .update_trade_result(id, TradeStatus::Completed, 0.05, Some("b-1"), Some("s-1"))
            .unwrap();

        let conn = storage.conn.lock();
        let (status, profit): (String, f64) = conn
            .query_row(
                "SELECT status, profit FROM trades WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "completed");
        assert!((profit - 0.05).abs() < 1e-9);
    }

    #[test]
    fn order_insert_and_update() {
        let storage = Storage::open_in_memory().unwrap();
        let mut order = Order {
            order_id: "abc".to_string(),
            venue: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 0.5,
            price: Some(60000.0),
            status: crate::models::OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            timestamp: 1.0,
        };
        storage.insert_order(&order).unwrap();

        order.status = crate::models::OrderStatus::Filled;
        order.filled_quantity = 0.5;
        order.average_price = Some(60005.0);
        storage.update_order_status(&order).unwrap();

        let conn = storage.conn.lock();
        let (status, filled): (String, f64) = conn
            .query_row(
                "SELECT status, filled_quantity FROM orders WHERE venue = 'binance' AND order_id = 'abc'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "filled");
        assert!((filled - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fee_upsert_replaces_previous_row() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_fee(
                "binance",
                "BTCUSDT",
                &FeeSchedule {
                    maker: 0.001,
                    taker: 0.001,
                },
                1.0,
            )
            .unwrap();
        storage
            .upsert_fee(
                "binance",
                "BTCUSDT",
                &FeeSchedule {
                    maker: 0.0008,
                    taker: 0.0012,
                },
                2.0,
            )
            .unwrap();
        let fee = storage.fee_for("binance", "BTCUSDT").unwrap().unwrap();
        assert!((fee.taker - 0.0012).abs() < 1e-12);
    }

    #[test]
    fn cleanup_prunes_old_quotes_and_superseded_balances() {
        let storage = Storage::open_in_memory().unwrap();
        let now = 40.0 * 86_400.0;
        storage
            .insert_quotes_batch(&[quote("binance", "BTCUSDT", 1.0), quote("binance", "BTCUSDT", now)])
            .unwrap();
        for ts in [1.0, now] {
            storage
                .insert_balance(&BalanceRecord {
                    venue: "binance".to_string(),
                    asset: "USDT".to_string(),
                    free: 100.0,
                    locked: 0.0,
                    total: 100.0,
                    usd_value: Some(100.0),
                    timestamp: ts,
                })
                .unwrap();
        }

        storage.cleanup(30, now).unwrap();
        assert_eq!(storage.count_quotes().unwrap(), 1);

        let conn = storage.conn.lock();
        let balances: i64 = conn
            .query_row("SELECT COUNT(*) FROM balances", [], |row| row.get(0))
            .unwrap();
        assert_eq!(balances, 1);
    }
}
