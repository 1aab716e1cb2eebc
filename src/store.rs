//! SQLite durable store
//!
//! Three namespaces (positions, trades, pair_positions) plus a derived
//! daily_pnl view, all in WAL mode behind a single connection. Multi-row
//! updates that represent one logical event (a close, a partial close, a
//! confirmed entry) run in one transaction: on failure the store keeps its
//! prior state and the error propagates so in-memory state never advances.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::types::{
    PairDirection, PairPosition, PairStatus, Position, PositionStatus, Side, Symbol, TradeRecord,
};

pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    /// None for in-memory stores, which are never refreshed
    path: Option<PathBuf>,
}

/// Field set for partial position updates
#[derive(Debug, Default, Clone)]
pub struct PositionUpdate {
    pub status: Option<PositionStatus>,
    pub entry_price: Option<f64>,
    pub entry_amount: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_amount: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl PositionUpdate {
    pub fn status(status: PositionStatus) -> Self {
        PositionUpdate {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Exit fields written when a pair closes
#[derive(Debug, Clone)]
pub struct PairExit {
    pub exit_price1: f64,
    pub exit_price2: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: String,
    pub realized_pnl: f64,
}

/// One row of the daily_pnl view
#[derive(Debug, Clone)]
pub struct DailyPnl {
    pub day: String,
    pub pnl: f64,
    pub trades: i64,
}

/// Aggregate trade statistics for reporting
#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub total_pnl: f64,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Transient(e.to_string()))?;
        }
        let conn = Self::connect(path)?;
        let store = SqliteStore {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
        };
        store.create_tables()?;
        info!("durable store ready: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests; connection refresh becomes a no-op
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = SqliteStore {
            conn: Mutex::new(Some(conn)),
            path: None,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn connect(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            let path = self
                .path
                .as_ref()
                .ok_or_else(|| StorageError::Transient("in-memory store closed".into()))?;
            *guard = Some(Self::connect(path)?);
            debug!("reopened store connection");
        }
        f(guard.as_mut().unwrap())
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS positions (
                    position_id TEXT PRIMARY KEY,
                    symbol TEXT NOT NULL,
                    side TEXT NOT NULL,
                    entry_price REAL NOT NULL,
                    entry_amount REAL NOT NULL,
                    entry_time INTEGER NOT NULL,
                    stop_loss REAL,
                    take_profit REAL,
                    exit_price REAL,
                    exit_amount REAL,
                    exit_time INTEGER,
                    realized_pnl REAL,
                    is_leveraged INTEGER NOT NULL DEFAULT 0,
                    leverage REAL NOT NULL DEFAULT 1,
                    status TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
                CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol);

                CREATE TABLE IF NOT EXISTS trades (
                    trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    position_id TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    side TEXT NOT NULL,
                    price REAL NOT NULL,
                    amount REAL NOT NULL,
                    cost REAL NOT NULL,
                    fee REAL NOT NULL DEFAULT 0,
                    fee_currency TEXT NOT NULL,
                    order_type TEXT NOT NULL DEFAULT 'market',
                    profit_loss REAL NOT NULL DEFAULT 0,
                    timestamp INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
                CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);

                CREATE TABLE IF NOT EXISTS pair_positions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pair_id TEXT NOT NULL,
                    symbol1 TEXT NOT NULL,
                    symbol2 TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    hedge_ratio REAL NOT NULL,
                    entry_spread REAL NOT NULL DEFAULT 0,
                    entry_z_score REAL NOT NULL DEFAULT 0,
                    entry_time INTEGER NOT NULL,
                    size1 REAL NOT NULL,
                    size2 REAL NOT NULL,
                    entry_price1 REAL NOT NULL,
                    entry_price2 REAL NOT NULL,
                    entry_capital REAL NOT NULL DEFAULT 0,
                    unrealized_pnl REAL NOT NULL DEFAULT 0,
                    max_pnl REAL NOT NULL DEFAULT 0,
                    exit_price1 REAL,
                    exit_price2 REAL,
                    exit_time INTEGER,
                    exit_reason TEXT,
                    realized_pnl REAL,
                    status TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pair_positions_status ON pair_positions(status);

                CREATE VIEW IF NOT EXISTS daily_pnl AS
                    SELECT date(timestamp, 'unixepoch') AS day,
                           SUM(profit_loss) AS pnl,
                           COUNT(*) AS trades
                    FROM trades
                    GROUP BY day;",
            )?;
            Ok(())
        })
    }

    // ==================== positions ====================

    pub fn create_position(&self, p: &Position) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO positions
                 (position_id, symbol, side, entry_price, entry_amount, entry_time,
                  stop_loss, take_profit, is_leveraged, leverage, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    p.position_id,
                    p.symbol.as_str(),
                    p.side.as_str(),
                    p.entry_price,
                    p.quantity,
                    p.entry_time.timestamp(),
                    p.stop_loss,
                    p.take_profit,
                    p.is_leveraged as i64,
                    p.leverage,
                    p.status.as_str(),
                ],
            )?;
            debug!(
                "position row created: {} {} [{}]",
                p.position_id,
                p.symbol,
                p.status.as_str()
            );
            Ok(())
        })
    }

    pub fn update_position(&self, id: &str, update: &PositionUpdate) -> Result<(), StorageError> {
        self.with_conn(|conn| Self::update_position_on(conn, id, update))
    }

    fn update_position_on(
        conn: &Connection,
        id: &str,
        update: &PositionUpdate,
    ) -> Result<(), StorageError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(v) = update.entry_price {
            sets.push("entry_price = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.entry_amount {
            sets.push("entry_amount = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.exit_price {
            sets.push("exit_price = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.exit_amount {
            sets.push("exit_amount = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.exit_time {
            sets.push("exit_time = ?");
            values.push(Box::new(v.timestamp()));
        }
        if let Some(v) = update.realized_pnl {
            sets.push("realized_pnl = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.stop_loss {
            sets.push("stop_loss = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.take_profit {
            sets.push("take_profit = ?");
            values.push(Box::new(v));
        }
        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE positions SET {} WHERE position_id = ?", sets.join(", "));
        values.push(Box::new(id.to_string()));
        let changed = conn.execute(&sql, params_from_iter(values.iter().map(|v| v.as_ref())))?;
        if changed == 0 {
            return Err(StorageError::Integrity(format!("no position row for id {}", id)));
        }
        Ok(())
    }

    /// Atomic composite: apply a position update and record the fill that
    /// caused it in one transaction
    pub fn update_position_with_trade(
        &self,
        id: &str,
        update: &PositionUpdate,
        trade: &TradeRecord,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            Self::update_position_on(&tx, id, update)?;
            Self::insert_trade_on(&tx, trade)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Atomic composite for partial closes: trade row + decremented amount
    pub fn record_partial_close(
        &self,
        position_id: &str,
        trade: &TradeRecord,
        new_amount: f64,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            Self::insert_trade_on(&tx, trade)?;
            let changed = tx.execute(
                "UPDATE positions SET entry_amount = ?1 WHERE position_id = ?2",
                params![new_amount, position_id],
            )?;
            if changed == 0 {
                return Err(StorageError::Integrity(format!(
                    "no position row for id {}",
                    position_id
                )));
            }
            tx.commit()?;
            debug!("partial close recorded atomically: {}", position_id);
            Ok(())
        })
    }

    pub fn get_position(&self, id: &str) -> Result<Option<Position>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT position_id, symbol, side, entry_price, entry_amount, entry_time,
                        stop_loss, take_profit, exit_price, exit_time, realized_pnl,
                        is_leveraged, leverage, status
                 FROM positions WHERE position_id = ?1",
            )?;
            let result = stmt.query_row(params![id], row_to_position);
            match result {
                Ok(p) => Ok(Some(p)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// All rows that are not terminal-closed, for startup reconciliation
    pub fn get_open_positions(&self) -> Result<Vec<Position>, StorageError> {
        self.get_positions_where("status != 'closed'")
    }

    pub fn get_positions_by_status(
        &self,
        status: PositionStatus,
    ) -> Result<Vec<Position>, StorageError> {
        self.get_positions_where(&format!("status = '{}'", status.as_str()))
    }

    fn get_positions_where(&self, predicate: &str) -> Result<Vec<Position>, StorageError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT position_id, symbol, side, entry_price, entry_amount, entry_time,
                        stop_loss, take_profit, exit_price, exit_time, realized_pnl,
                        is_leveraged, leverage, status
                 FROM positions WHERE {} ORDER BY entry_time",
                predicate
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_position)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ==================== trades ====================

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<(), StorageError> {
        self.with_conn(|conn| Self::insert_trade_on(conn, trade))
    }

    fn insert_trade_on(conn: &Connection, trade: &TradeRecord) -> Result<(), StorageError> {
        conn.execute(
            "INSERT INTO trades
             (position_id, symbol, side, price, amount, cost, fee, fee_currency,
              order_type, profit_loss, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.position_id,
                trade.symbol.as_str(),
                trade.side.as_str(),
                trade.price,
                trade.amount,
                trade.cost,
                trade.fee,
                trade.fee_currency,
                trade.order_type,
                trade.profit_loss,
                trade.timestamp.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn trade_count(&self) -> Result<i64, StorageError> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?;
            Ok(count)
        })
    }

    pub fn trade_stats(&self) -> Result<TradeStats, StorageError> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN profit_loss > 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(profit_loss), 0)
                 FROM trades",
                [],
                |r| {
                    Ok(TradeStats {
                        total_trades: r.get(0)?,
                        winning_trades: r.get(1)?,
                        total_pnl: r.get(2)?,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    pub fn daily_pnl(&self, days: u32) -> Result<Vec<DailyPnl>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT day, pnl, trades FROM daily_pnl ORDER BY day DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![days], |r| {
                    Ok(DailyPnl {
                        day: r.get(0)?,
                        pnl: r.get(1)?,
                        trades: r.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ==================== pair positions ====================

    pub fn create_pair_position(&self, p: &PairPosition) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pair_positions
                 (pair_id, symbol1, symbol2, direction, hedge_ratio, entry_spread,
                  entry_z_score, entry_time, size1, size2, entry_price1, entry_price2,
                  entry_capital, unrealized_pnl, max_pnl, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    p.pair_id,
                    p.symbol1.as_str(),
                    p.symbol2.as_str(),
                    p.direction.as_str(),
                    p.hedge_ratio,
                    p.entry_spread,
                    p.entry_z_score,
                    p.entry_time.timestamp(),
                    p.size1,
                    p.size2,
                    p.entry_price1,
                    p.entry_price2,
                    p.entry_capital,
                    p.unrealized_pnl,
                    p.max_pnl,
                    p.status.as_str(),
                ],
            )?;
            debug!("pair row created: {} [{}]", p.pair_id, p.status.as_str());
            Ok(())
        })
    }

    /// Update the live (not-closed) row for a pair id
    pub fn update_pair_status(
        &self,
        pair_id: &str,
        status: PairStatus,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pair_positions SET status = ?1
                 WHERE pair_id = ?2 AND status != 'closed'",
                params![status.as_str(), pair_id],
            )?;
            if changed == 0 {
                return Err(StorageError::Integrity(format!(
                    "no live pair row for id {}",
                    pair_id
                )));
            }
            Ok(())
        })
    }

    pub fn update_pair_pnl(
        &self,
        pair_id: &str,
        unrealized_pnl: f64,
        max_pnl: f64,
    ) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pair_positions SET unrealized_pnl = ?1, max_pnl = ?2
                 WHERE pair_id = ?3 AND status = 'open'",
                params![unrealized_pnl, max_pnl, pair_id],
            )?;
            Ok(())
        })
    }

    pub fn close_pair_position(&self, pair_id: &str, exit: &PairExit) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pair_positions
                 SET exit_price1 = ?1, exit_price2 = ?2, exit_time = ?3,
                     exit_reason = ?4, realized_pnl = ?5, status = 'closed'
                 WHERE pair_id = ?6 AND status != 'closed'",
                params![
                    exit.exit_price1,
                    exit.exit_price2,
                    exit.exit_time.timestamp(),
                    exit.exit_reason,
                    exit.realized_pnl,
                    pair_id,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::Integrity(format!(
                    "no live pair row for id {}",
                    pair_id
                )));
            }
            Ok(())
        })
    }

    pub fn get_open_pair_positions(&self) -> Result<Vec<PairPosition>, StorageError> {
        self.get_pairs_where("status = 'open'")
    }

    /// Pair rows stuck mid-protocol: reservations that never resolved.
    /// Presence of any such row blocks startup in live mode.
    pub fn recover_incomplete_pairs(&self) -> Result<Vec<PairPosition>, StorageError> {
        self.get_pairs_where("status = 'pending_execution'")
    }

    fn get_pairs_where(&self, predicate: &str) -> Result<Vec<PairPosition>, StorageError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT pair_id, symbol1, symbol2, direction, hedge_ratio, entry_spread,
                        entry_z_score, entry_time, size1, size2, entry_price1, entry_price2,
                        entry_capital, unrealized_pnl, max_pnl, exit_price1, exit_price2,
                        exit_time, exit_reason, realized_pnl, status
                 FROM pair_positions WHERE {} ORDER BY entry_time",
                predicate
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_pair)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ==================== maintenance ====================

    /// Bound WAL growth; called by the trade loop on a fixed cadence
    pub fn checkpoint_wal(&self) -> Result<(), StorageError> {
        if self.path.is_none() {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            debug!("WAL checkpoint complete");
            Ok(())
        })
    }

    /// Drop the long-lived handle; the next access reopens it
    pub fn close_all_connections(&self) {
        if self.path.is_none() {
            return;
        }
        let mut guard = self.conn.lock().unwrap();
        *guard = None;
        debug!("store connection released for refresh");
    }

    pub fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

fn parse_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    let side: String = row.get(2)?;
    let status: String = row.get(13)?;
    let exit_time: Option<i64> = row.get(9)?;
    Ok(Position {
        position_id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        side: Side::parse(&side).unwrap_or(Side::Long),
        entry_price: row.get(3)?,
        quantity: row.get(4)?,
        entry_time: parse_time(row.get(5)?),
        stop_loss: row.get(6)?,
        take_profit: row.get(7)?,
        exit_price: row.get(8)?,
        exit_time: exit_time.map(parse_time),
        realized_pnl: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
        is_leveraged: row.get::<_, i64>(11)? != 0,
        leverage: row.get(12)?,
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::ExecutionFailed),
    })
}

fn row_to_pair(row: &Row<'_>) -> rusqlite::Result<PairPosition> {
    let direction: String = row.get(3)?;
    let status: String = row.get(20)?;
    let exit_time: Option<i64> = row.get(17)?;
    Ok(PairPosition {
        pair_id: row.get(0)?,
        symbol1: Symbol::new(row.get::<_, String>(1)?),
        symbol2: Symbol::new(row.get::<_, String>(2)?),
        direction: PairDirection::parse(&direction).unwrap_or(PairDirection::LongSpread),
        hedge_ratio: row.get(4)?,
        entry_spread: row.get(5)?,
        entry_z_score: row.get(6)?,
        entry_time: parse_time(row.get(7)?),
        size1: row.get(8)?,
        size2: row.get(9)?,
        entry_price1: row.get(10)?,
        entry_price2: row.get(11)?,
        entry_capital: row.get(12)?,
        unrealized_pnl: row.get(13)?,
        max_pnl: row.get(14)?,
        exit_price1: row.get(15)?,
        exit_price2: row.get(16)?,
        exit_time: exit_time.map(parse_time),
        exit_reason: row.get(18)?,
        realized_pnl: row.get::<_, Option<f64>>(19)?.unwrap_or(0.0),
        status: PairStatus::parse(&status).unwrap_or(PairStatus::ExecutionFailed),
    })
}
