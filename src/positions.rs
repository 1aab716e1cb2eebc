//! In-memory position book
//!
//! Live positions keyed by symbol, pair positions keyed by pair id, behind a
//! single short-held lock. The disk copy is authoritative: every mutation
//! here is preceded (or accompanied, in one transaction) by a successful
//! durable write, and a failed write leaves memory exactly as it was.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::exchange::min_order_amount;
use crate::store::{PositionUpdate, SqliteStore};
use crate::types::{PairPosition, Position, PositionStatus, Side, Symbol, TradeRecord};

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("{0} already has a live position")]
    AlreadyExists(Symbol),

    #[error("short positions are not available on spot market {0}")]
    SpotShort(Symbol),

    #[error("quantity {quantity} below minimum lot {min} for {symbol}")]
    BelowMinLot {
        symbol: Symbol,
        quantity: f64,
        min: f64,
    },

    #[error("no open position for {0}")]
    NotFound(Symbol),

    #[error("close ratio must be in (0, 1], got {0}")]
    BadRatio(f64),

    #[error("position {0} is not pending")]
    NotPending(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a partial close
#[derive(Debug, Clone)]
pub struct PartialClose {
    pub symbol: Symbol,
    pub side: Side,
    pub partial_quantity: f64,
    pub remaining_quantity: f64,
    pub close_ratio: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_price: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
}

#[derive(Default)]
struct BookInner {
    open: HashMap<Symbol, Position>,
    /// Symbols with a pending_execution row reserved but not yet confirmed
    pending: HashSet<Symbol>,
    closed: Vec<Position>,
    pairs: HashMap<String, PairPosition>,
}

pub struct PositionBook {
    inner: Mutex<BookInner>,
    store: Arc<SqliteStore>,
    commission_rate: f64,
}

impl PositionBook {
    pub fn new(store: Arc<SqliteStore>, commission_rate: f64) -> Self {
        PositionBook {
            inner: Mutex::new(BookInner::default()),
            store,
            commission_rate,
        }
    }

    // ==================== pending lifecycle ====================

    /// Reserve a position id in the durable store before any order is sent.
    /// All entry paths funnel through here, so the at-most-one-per-symbol and
    /// no-spot-short rules hold everywhere.
    pub fn create_pending_position(
        &self,
        symbol: &Symbol,
        side: Side,
        entry_price: f64,
        quantity: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, PositionError> {
        if side == Side::Short && !symbol.is_leverage_capable() {
            return Err(PositionError::SpotShort(symbol.clone()));
        }
        let min = min_order_amount(symbol);
        if quantity < min {
            return Err(PositionError::BelowMinLot {
                symbol: symbol.clone(),
                quantity,
                min,
            });
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.open.contains_key(symbol) || inner.pending.contains(symbol) {
                return Err(PositionError::AlreadyExists(symbol.clone()));
            }
            inner.pending.insert(symbol.clone());
        }

        let position = Position::new(symbol.clone(), side, entry_price, quantity, now);
        if let Err(e) = self.store.create_position(&position) {
            self.inner.lock().unwrap().pending.remove(symbol);
            return Err(e.into());
        }

        info!(
            "pending position reserved: {} {} {:.8} @ {:.0} ({})",
            symbol, side, quantity, entry_price, position.position_id
        );
        Ok(position)
    }

    /// Promote a pending position to open with its actual fill values.
    /// The durable row and the entry fill record are written in one
    /// transaction before the position becomes visible in memory.
    pub fn confirm_pending_position(
        &self,
        position: &mut Position,
        actual_price: f64,
        now: DateTime<Utc>,
    ) -> Result<(), PositionError> {
        if position.status != PositionStatus::PendingExecution {
            return Err(PositionError::NotPending(position.position_id.clone()));
        }

        let update = PositionUpdate {
            status: Some(PositionStatus::Open),
            entry_price: Some(actual_price),
            entry_amount: Some(position.quantity),
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            ..Default::default()
        };
        let entry_fee = actual_price * position.quantity * self.commission_rate;
        let trade = TradeRecord::fill(
            &position.position_id,
            &position.symbol,
            position.side,
            actual_price,
            position.quantity,
            entry_fee,
            0.0,
            now,
        );
        self.store
            .update_position_with_trade(&position.position_id, &update, &trade)?;

        position.status = PositionStatus::Open;
        position.entry_price = actual_price;

        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&position.symbol);
        inner.open.insert(position.symbol.clone(), position.clone());
        info!(
            "position confirmed: {} {} {:.8} @ {:.0} ({})",
            position.symbol, position.side, position.quantity, actual_price, position.position_id
        );
        Ok(())
    }

    /// Mark a pending position as failed and release the symbol reservation
    pub fn cancel_pending_position(
        &self,
        position: &mut Position,
        reason: &str,
    ) -> Result<(), PositionError> {
        if position.status != PositionStatus::PendingExecution {
            warn!("cancel of non-pending position {}", position.position_id);
        }
        position.status = PositionStatus::ExecutionFailed;
        self.inner.lock().unwrap().pending.remove(&position.symbol);
        self.store.update_position(
            &position.position_id,
            &PositionUpdate::status(PositionStatus::ExecutionFailed),
        )?;
        warn!(
            "pending position cancelled: {} - {} ({})",
            position.symbol, reason, position.position_id
        );
        Ok(())
    }

    /// A timed-out order whose fate is unknown; the periodic reconciler
    /// resolves it later
    pub fn mark_pending_unknown(&self, position: &mut Position) -> Result<(), PositionError> {
        position.status = PositionStatus::ExecutionUnknown;
        self.inner.lock().unwrap().pending.remove(&position.symbol);
        self.store.update_position(
            &position.position_id,
            &PositionUpdate::status(PositionStatus::ExecutionUnknown),
        )?;
        warn!(
            "position marked execution_unknown: {} ({})",
            position.symbol, position.position_id
        );
        Ok(())
    }

    // ==================== close paths ====================

    /// Close a position. Order of operations is strict: snapshot and compute
    /// under the lock, write durably, and only then drop the position from
    /// the open map. On a failed write the exit fields are reverted and the
    /// position stays open everywhere.
    pub fn close_position(
        &self,
        symbol: &Symbol,
        exit_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, PositionError> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .open
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.clone()))?;

        position.close(exit_price, now, self.commission_rate);

        let update = PositionUpdate {
            status: Some(PositionStatus::Closed),
            exit_price: Some(exit_price),
            exit_amount: Some(position.quantity),
            exit_time: Some(now),
            realized_pnl: Some(position.realized_pnl),
            ..Default::default()
        };
        let entry_fee = position.entry_price * position.quantity * self.commission_rate;
        let exit_fee = exit_price * position.quantity * self.commission_rate;
        let trade = TradeRecord::fill(
            &position.position_id,
            symbol,
            position.side,
            exit_price,
            position.quantity,
            entry_fee + exit_fee,
            position.realized_pnl,
            now,
        );

        match self
            .store
            .update_position_with_trade(&position.position_id, &update, &trade)
        {
            Ok(()) => {
                let closed = inner.open.remove(symbol).expect("present under lock");
                info!(
                    "position closed: {} {} pnl={:+.0} ({})",
                    symbol, closed.side, closed.realized_pnl, closed.position_id
                );
                inner.closed.push(closed.clone());
                Ok(closed)
            }
            Err(e) => {
                position.reopen();
                warn!("close write failed, position kept open: {} - {}", symbol, e);
                Err(e.into())
            }
        }
    }

    /// Partially close a position. The trade record and the decremented
    /// amount commit in one transaction; in-memory quantity only moves after
    /// the commit.
    pub fn partial_close_position(
        &self,
        symbol: &Symbol,
        exit_price: f64,
        close_ratio: f64,
        now: DateTime<Utc>,
    ) -> Result<PartialClose, PositionError> {
        if !(0.0..=1.0).contains(&close_ratio) || close_ratio == 0.0 {
            return Err(PositionError::BadRatio(close_ratio));
        }

        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .open
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.clone()))?;

        let partial_quantity = position.quantity * close_ratio;
        let remaining_quantity = position.quantity * (1.0 - close_ratio);

        let gross = match position.side {
            Side::Long => (exit_price - position.entry_price) * partial_quantity,
            Side::Short => (position.entry_price - exit_price) * partial_quantity,
        };
        let entry_fee = position.entry_price * partial_quantity * self.commission_rate;
        let exit_fee = exit_price * partial_quantity * self.commission_rate;
        let pnl = gross - entry_fee - exit_fee;
        let cost_basis = position.entry_price * partial_quantity;
        let pnl_pct = if cost_basis > f64::EPSILON {
            pnl / cost_basis * 100.0
        } else {
            0.0
        };

        let trade = TradeRecord::fill(
            &position.position_id,
            symbol,
            position.side,
            exit_price,
            partial_quantity,
            entry_fee + exit_fee,
            pnl,
            now,
        );
        self.store
            .record_partial_close(&position.position_id, &trade, remaining_quantity)?;

        position.quantity = remaining_quantity;
        info!(
            "partial close: {} {:.0}% ({:.8} / {:.8} remaining) pnl={:+.0}",
            symbol,
            close_ratio * 100.0,
            partial_quantity,
            remaining_quantity,
            pnl
        );

        Ok(PartialClose {
            symbol: symbol.clone(),
            side: position.side,
            partial_quantity,
            remaining_quantity,
            close_ratio,
            pnl,
            pnl_pct,
            exit_price,
            entry_fee,
            exit_fee,
        })
    }

    // ==================== accessors ====================

    pub fn get(&self, symbol: &Symbol) -> Option<Position> {
        self.inner.lock().unwrap().open.get(symbol).cloned()
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.open.contains_key(symbol) || inner.pending.contains(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    pub fn all_open(&self) -> Vec<Position> {
        self.inner.lock().unwrap().open.values().cloned().collect()
    }

    /// Realized plus marked-to-market unrealized P&L
    pub fn total_pnl(&self, prices: &HashMap<Symbol, f64>) -> f64 {
        let inner = self.inner.lock().unwrap();
        let realized: f64 = inner.closed.iter().map(|p| p.realized_pnl).sum();
        let unrealized: f64 = inner
            .open
            .iter()
            .filter_map(|(symbol, p)| {
                prices
                    .get(symbol)
                    .map(|price| p.unrealized_pnl(*price, self.commission_rate))
            })
            .sum();
        realized + unrealized
    }

    /// Used by the startup reconciler; memory only, no durable write
    pub fn restore_open_position(&self, position: Position) {
        debug!(
            "restored position: {} {} {:.8} @ {:.0}",
            position.symbol, position.side, position.quantity, position.entry_price
        );
        self.inner
            .lock()
            .unwrap()
            .open
            .insert(position.symbol.clone(), position);
    }

    // ==================== pair positions ====================

    pub fn insert_pair(&self, pair: PairPosition) {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .insert(pair.pair_id.clone(), pair);
    }

    pub fn remove_pair(&self, pair_id: &str) -> Option<PairPosition> {
        self.inner.lock().unwrap().pairs.remove(pair_id)
    }

    pub fn get_pair(&self, pair_id: &str) -> Option<PairPosition> {
        self.inner.lock().unwrap().pairs.get(pair_id).cloned()
    }

    pub fn has_pair(&self, pair_id: &str) -> bool {
        self.inner.lock().unwrap().pairs.contains_key(pair_id)
    }

    pub fn pair_count(&self) -> usize {
        self.inner.lock().unwrap().pairs.len()
    }

    pub fn open_pairs(&self) -> Vec<PairPosition> {
        self.inner.lock().unwrap().pairs.values().cloned().collect()
    }

    /// Refresh unrealized P&L and running maximum for every pair with both
    /// legs priced; persisted best-effort (the mark is derived data)
    pub fn update_pair_marks(&self, prices: &HashMap<Symbol, f64>) {
        let updates: Vec<(String, f64, f64)> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .pairs
                .values_mut()
                .filter_map(|pair| {
                    let p1 = prices.get(&pair.symbol1)?;
                    let p2 = prices.get(&pair.symbol2)?;
                    pair.update_pnl(*p1, *p2);
                    Some((pair.pair_id.clone(), pair.unrealized_pnl, pair.max_pnl))
                })
                .collect()
        };
        for (pair_id, pnl, max_pnl) in updates {
            if let Err(e) = self.store.update_pair_pnl(&pair_id, pnl, max_pnl) {
                warn!("pair mark persist failed for {}: {}", pair_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionStatus;
    use approx::assert_relative_eq;

    fn book() -> PositionBook {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        PositionBook::new(store, 0.0015)
    }

    #[test]
    fn test_pending_confirm_flow() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let mut position = book
            .create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now())
            .unwrap();
        assert!(!book.get(&symbol).is_some());
        assert!(book.has_position(&symbol));

        book.confirm_pending_position(&mut position, 12_010_000.0, Utc::now())
            .unwrap();
        let open = book.get(&symbol).unwrap();
        assert_eq!(open.status, PositionStatus::Open);
        assert_relative_eq!(open.entry_price, 12_010_000.0);
        // entry fill audited
        assert_eq!(book.store.trade_count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        book.create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now())
            .unwrap();
        let second =
            book.create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now());
        assert!(matches!(second, Err(PositionError::AlreadyExists(_))));
    }

    #[test]
    fn test_spot_short_rejected() {
        let book = book();
        let spot = Symbol::new("ETH/JPY");
        let result =
            book.create_pending_position(&spot, Side::Short, 500_000.0, 0.1, Utc::now());
        assert!(matches!(result, Err(PositionError::SpotShort(_))));

        // leveraged products allow shorts
        let fx = Symbol::new("FX_BTC_JPY");
        assert!(book
            .create_pending_position(&fx, Side::Short, 12_000_000.0, 0.01, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_below_min_lot_rejected() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let result =
            book.create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.0001, Utc::now());
        assert!(matches!(result, Err(PositionError::BelowMinLot { .. })));
    }

    #[test]
    fn test_cancel_releases_reservation() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let mut position = book
            .create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now())
            .unwrap();
        book.cancel_pending_position(&mut position, "api failure")
            .unwrap();
        assert!(!book.has_position(&symbol));
        // symbol is free again
        assert!(book
            .create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_close_moves_to_closed_and_audits() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let mut position = book
            .create_pending_position(&symbol, Side::Long, 12_000_000.0, 0.01, Utc::now())
            .unwrap();
        book.confirm_pending_position(&mut position, 12_000_000.0, Utc::now())
            .unwrap();

        let closed = book.close_position(&symbol, 13_000_000.0, Utc::now()).unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.realized_pnl > 0.0);
        assert!(book.get(&symbol).is_none());
        // entry fill + exit fill
        assert_eq!(book.store.trade_count().unwrap(), 2);

        let durable = book.store.get_position(&closed.position_id).unwrap().unwrap();
        assert_eq!(durable.status, PositionStatus::Closed);
    }

    #[test]
    fn test_partial_close_reduces_quantity_atomically() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let mut position = book
            .create_pending_position(&symbol, Side::Long, 10_000_000.0, 0.01, Utc::now())
            .unwrap();
        book.confirm_pending_position(&mut position, 10_000_000.0, Utc::now())
            .unwrap();

        let info = book
            .partial_close_position(&symbol, 11_500_000.0, 0.5, Utc::now())
            .unwrap();
        assert_relative_eq!(info.partial_quantity, 0.005);
        assert_relative_eq!(info.remaining_quantity, 0.005);
        assert!(info.pnl > 0.0);

        let open = book.get(&symbol).unwrap();
        assert_relative_eq!(open.quantity, 0.005);
        let durable = book.store.get_position(&open.position_id).unwrap().unwrap();
        assert_relative_eq!(durable.quantity, 0.005);
    }

    #[test]
    fn test_partial_close_bad_ratio() {
        let book = book();
        let symbol = Symbol::new("BTC/JPY");
        let result = book.partial_close_position(&symbol, 1.0, 1.5, Utc::now());
        assert!(matches!(result, Err(PositionError::BadRatio(_))));
    }

    #[test]
    fn test_pair_mark_updates() {
        let book = book();
        let pair = PairPosition {
            pair_id: "BTC/JPY_ETH/JPY".to_string(),
            symbol1: Symbol::new("BTC/JPY"),
            symbol2: Symbol::new("ETH/JPY"),
            direction: crate::types::PairDirection::LongSpread,
            hedge_ratio: 1.0,
            entry_spread: 0.0,
            entry_z_score: -2.0,
            entry_time: Utc::now(),
            size1: 0.01,
            size2: 0.15,
            entry_price1: 12_000_000.0,
            entry_price2: 500_000.0,
            entry_capital: 120_000.0,
            unrealized_pnl: 0.0,
            max_pnl: 0.0,
            exit_price1: None,
            exit_price2: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: 0.0,
            status: crate::types::PairStatus::Open,
        };
        book.store.create_pair_position(&pair).unwrap();
        book.insert_pair(pair);

        let mut prices = HashMap::new();
        prices.insert(Symbol::new("BTC/JPY"), 12_100_000.0);
        prices.insert(Symbol::new("ETH/JPY"), 500_000.0);
        book.update_pair_marks(&prices);

        let pair = book.get_pair("BTC/JPY_ETH/JPY").unwrap();
        assert_relative_eq!(pair.unrealized_pnl, 1_000.0);
        assert_relative_eq!(pair.max_pnl, 1_000.0);
    }
}
