//! Core data types used across the trading engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Trading pair symbol, e.g. "BTC/JPY" or "FX_BTC_JPY"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency ("BTC" for "BTC/JPY"). Leveraged product codes such as
    /// FX_BTC_JPY have no slash; the middle segment is the base.
    pub fn base_currency(&self) -> &str {
        if let Some(idx) = self.0.find('/') {
            &self.0[..idx]
        } else if let Some(rest) = self.0.strip_prefix("FX_") {
            rest.split('_').next().unwrap_or(rest)
        } else {
            &self.0
        }
    }

    /// Quote currency ("JPY" for "BTC/JPY"); falls back to JPY.
    pub fn quote_currency(&self) -> &str {
        if let Some(idx) = self.0.find('/') {
            &self.0[idx + 1..]
        } else {
            self.0.rsplit('_').next().unwrap_or("JPY")
        }
    }

    /// Only FX_ products support shorts and leverage; spot markets do not.
    pub fn is_leverage_capable(&self) -> bool {
        self.0.starts_with("FX_")
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction
    pub fn exit_order(&self) -> OrderSide {
        self.entry_order().opposite()
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-position lifecycle. `PendingExecution` rows reserve the position id
/// before the order is sent so a crash mid-order cannot lose the intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    PendingExecution,
    Open,
    Closed,
    ExecutionFailed,
    ExecutionUnknown,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::PendingExecution => "pending_execution",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::ExecutionFailed => "execution_failed",
            PositionStatus::ExecutionUnknown => "execution_unknown",
        }
    }

    pub fn parse(s: &str) -> Option<PositionStatus> {
        match s {
            "pending_execution" => Some(PositionStatus::PendingExecution),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "execution_failed" => Some(PositionStatus::ExecutionFailed),
            "execution_unknown" => Some(PositionStatus::ExecutionUnknown),
            _ => None,
        }
    }
}

static POSITION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique position id
pub fn next_position_id(now: DateTime<Utc>) -> String {
    let n = POSITION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("P{}-{:04}", now.timestamp_millis(), n)
}

/// A single directional exposure on one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub is_leveraged: bool,
    pub leverage: f64,
    pub status: PositionStatus,
}

impl Position {
    pub fn new(
        symbol: Symbol,
        side: Side,
        entry_price: f64,
        quantity: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let is_leveraged = symbol.is_leverage_capable();
        Position {
            position_id: next_position_id(entry_time),
            symbol,
            side,
            entry_price,
            quantity,
            entry_time,
            stop_loss: None,
            take_profit: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
            is_leveraged,
            leverage: if is_leveraged { 2.0 } else { 1.0 },
            status: PositionStatus::PendingExecution,
        }
    }

    /// Directional P&L before fees
    pub fn gross_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            Side::Long => (current_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - current_price) * self.quantity,
        }
    }

    /// Unrealized P&L net of entry fee (already paid) and the exit fee an
    /// immediate close would incur
    pub fn unrealized_pnl(&self, current_price: f64, commission_rate: f64) -> f64 {
        let entry_fee = self.entry_price * self.quantity * commission_rate;
        let exit_fee = current_price * self.quantity * commission_rate;
        self.gross_pnl(current_price) - entry_fee - exit_fee
    }

    /// Gross P&L as a percentage of invested capital. Risk thresholds
    /// (stop-loss, staged take-profit) are defined against this number;
    /// quantity cancels, so it reduces to the price move.
    pub fn unrealized_pnl_pct(&self, current_price: f64) -> f64 {
        if self.entry_price <= f64::EPSILON {
            return 0.0;
        }
        let move_pct = (current_price - self.entry_price) / self.entry_price * 100.0;
        match self.side {
            Side::Long => move_pct,
            Side::Short => -move_pct,
        }
    }

    /// Margin maintenance ratio for leveraged positions:
    /// (initial margin + gross pnl) / initial margin. Spot returns 1.0.
    pub fn margin_ratio(&self, current_price: f64) -> f64 {
        if !self.is_leveraged || self.leverage <= 0.0 {
            return 1.0;
        }
        let initial_margin = self.entry_price * self.quantity / self.leverage;
        if initial_margin <= f64::EPSILON {
            return 1.0;
        }
        (initial_margin + self.gross_pnl(current_price)) / initial_margin
    }

    /// Price at which the margin ratio hits `threshold`
    pub fn liquidation_price(&self, threshold: f64) -> f64 {
        if !self.is_leveraged || self.leverage <= 0.0 {
            return 0.0;
        }
        let loss_fraction = (1.0 - threshold) / self.leverage;
        match self.side {
            Side::Long => self.entry_price * (1.0 - loss_fraction),
            Side::Short => self.entry_price * (1.0 + loss_fraction),
        }
    }

    /// Fill in exit fields; realized P&L is net of both fees
    pub fn close(&mut self, exit_price: f64, exit_time: DateTime<Utc>, commission_rate: f64) {
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.realized_pnl = self.unrealized_pnl(exit_price, commission_rate);
        self.status = PositionStatus::Closed;
    }

    /// Undo `close` after a failed durable write
    pub fn reopen(&mut self) {
        self.exit_price = None;
        self.exit_time = None;
        self.realized_pnl = 0.0;
        self.status = PositionStatus::Open;
    }
}

/// Pair direction: LongSpread buys leg 1 and sells leg 2; ShortSpread the reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairDirection {
    LongSpread,
    ShortSpread,
}

impl PairDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairDirection::LongSpread => "long_spread",
            PairDirection::ShortSpread => "short_spread",
        }
    }

    pub fn parse(s: &str) -> Option<PairDirection> {
        match s {
            "long_spread" => Some(PairDirection::LongSpread),
            "short_spread" => Some(PairDirection::ShortSpread),
            _ => None,
        }
    }

    /// Order side for leg 1 when opening
    pub fn leg1_entry(&self) -> OrderSide {
        match self {
            PairDirection::LongSpread => OrderSide::Buy,
            PairDirection::ShortSpread => OrderSide::Sell,
        }
    }

    /// Order side for leg 2 when opening
    pub fn leg2_entry(&self) -> OrderSide {
        self.leg1_entry().opposite()
    }
}

/// Pair lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    PendingExecution,
    Open,
    Closed,
    ExecutionFailed,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::PendingExecution => "pending_execution",
            PairStatus::Open => "open",
            PairStatus::Closed => "closed",
            PairStatus::ExecutionFailed => "execution_failed",
        }
    }

    pub fn parse(s: &str) -> Option<PairStatus> {
        match s {
            "pending_execution" => Some(PairStatus::PendingExecution),
            "open" => Some(PairStatus::Open),
            "closed" => Some(PairStatus::Closed),
            "execution_failed" => Some(PairStatus::ExecutionFailed),
            _ => None,
        }
    }
}

/// Two coupled legs opened and unwound together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPosition {
    pub pair_id: String,
    pub symbol1: Symbol,
    pub symbol2: Symbol,
    pub direction: PairDirection,
    pub hedge_ratio: f64,
    pub entry_spread: f64,
    pub entry_z_score: f64,
    pub entry_time: DateTime<Utc>,
    pub size1: f64,
    pub size2: f64,
    pub entry_price1: f64,
    pub entry_price2: f64,
    pub entry_capital: f64,
    pub unrealized_pnl: f64,
    /// Running maximum of unrealized_pnl, drives the trailing stop
    pub max_pnl: f64,
    pub exit_price1: Option<f64>,
    pub exit_price2: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub realized_pnl: f64,
    pub status: PairStatus,
}

impl PairPosition {
    pub fn pair_id_for(symbol1: &Symbol, symbol2: &Symbol) -> String {
        format!("{}_{}", symbol1, symbol2)
    }

    /// Mark-to-market P&L of both legs before fees
    pub fn pnl_at(&self, price1: f64, price2: f64) -> f64 {
        match self.direction {
            PairDirection::LongSpread => {
                (price1 - self.entry_price1) * self.size1
                    + (self.entry_price2 - price2) * self.size2
            }
            PairDirection::ShortSpread => {
                (self.entry_price1 - price1) * self.size1
                    + (price2 - self.entry_price2) * self.size2
            }
        }
    }

    /// Update the mark and the running maximum
    pub fn update_pnl(&mut self, price1: f64, price2: f64) {
        self.unrealized_pnl = self.pnl_at(price1, price2);
        if self.unrealized_pnl > self.max_pnl {
            self.max_pnl = self.unrealized_pnl;
        }
    }
}

/// Immutable audit record of a fill (or partial fill)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: Option<i64>,
    pub position_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub order_type: String,
    pub profit_loss: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        position_id: &str,
        symbol: &Symbol,
        side: Side,
        price: f64,
        amount: f64,
        fee: f64,
        profit_loss: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TradeRecord {
            trade_id: None,
            position_id: position_id.to_string(),
            symbol: symbol.clone(),
            side,
            price,
            amount,
            cost: price * amount,
            fee,
            fee_currency: symbol.quote_currency().to_string(),
            order_type: "market".to_string(),
            profit_loss,
            timestamp,
        }
    }
}

/// Action requested by the risk controller for an open position
#[derive(Debug, Clone, PartialEq)]
pub struct ExitAction {
    pub kind: ExitKind,
    pub close_ratio: f64,
    pub reason: String,
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Liquidation,
    StopLoss,
    FullClose,
    PartialClose,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_symbol_currencies() {
        let spot = Symbol::new("BTC/JPY");
        assert_eq!(spot.base_currency(), "BTC");
        assert_eq!(spot.quote_currency(), "JPY");
        assert!(!spot.is_leverage_capable());

        let fx = Symbol::new("FX_BTC_JPY");
        assert_eq!(fx.base_currency(), "BTC");
        assert_eq!(fx.quote_currency(), "JPY");
        assert!(fx.is_leverage_capable());
    }

    #[test]
    fn test_position_pnl_long() {
        let pos = Position::new(Symbol::new("BTC/JPY"), Side::Long, 10_000_000.0, 0.01, Utc::now());
        assert_relative_eq!(pos.gross_pnl(11_000_000.0), 10_000.0);
        assert_relative_eq!(pos.unrealized_pnl_pct(11_000_000.0), 10.0);
        // net of 0.15% fees on both legs
        let net = pos.unrealized_pnl(11_000_000.0, 0.0015);
        assert_relative_eq!(net, 10_000.0 - 150.0 - 165.0);
    }

    #[test]
    fn test_position_pnl_short() {
        let pos =
            Position::new(Symbol::new("FX_BTC_JPY"), Side::Short, 10_000_000.0, 0.01, Utc::now());
        assert_relative_eq!(pos.gross_pnl(9_000_000.0), 10_000.0);
        assert_relative_eq!(pos.unrealized_pnl_pct(11_050_000.0), -10.5);
    }

    #[test]
    fn test_margin_ratio() {
        let mut pos =
            Position::new(Symbol::new("FX_BTC_JPY"), Side::Long, 10_000_000.0, 0.01, Utc::now());
        pos.leverage = 2.0;
        // initial margin = 50,000; flat market keeps the ratio at 1.0
        assert_relative_eq!(pos.margin_ratio(10_000_000.0), 1.0);
        // a 2,500,000 drop costs 25,000 of the 50,000 margin
        assert_relative_eq!(pos.margin_ratio(7_500_000.0), 0.5);
        assert_relative_eq!(pos.liquidation_price(0.5), 7_500_000.0);
    }

    #[test]
    fn test_close_and_reopen() {
        let mut pos =
            Position::new(Symbol::new("BTC/JPY"), Side::Long, 10_000_000.0, 0.01, Utc::now());
        pos.status = PositionStatus::Open;
        pos.close(11_000_000.0, Utc::now(), 0.0);
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_relative_eq!(pos.realized_pnl, 10_000.0);

        pos.reopen();
        assert_eq!(pos.status, PositionStatus::Open);
        assert!(pos.exit_price.is_none());
        assert_relative_eq!(pos.realized_pnl, 0.0);
    }

    #[test]
    fn test_pair_pnl_long_spread() {
        let pair = PairPosition {
            pair_id: "BTC/JPY_ETH/JPY".to_string(),
            symbol1: Symbol::new("BTC/JPY"),
            symbol2: Symbol::new("ETH/JPY"),
            direction: PairDirection::LongSpread,
            hedge_ratio: 1.0,
            entry_spread: 0.0,
            entry_z_score: -2.1,
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
            status: PairStatus::Open,
        };
        // leg1 +100,000/unit, leg2 -10,000/unit against us
        let pnl = pair.pnl_at(12_100_000.0, 510_000.0);
        assert_relative_eq!(pnl, 100_000.0 * 0.01 - 10_000.0 * 0.15);
    }

    #[test]
    fn test_pair_max_pnl_tracking() {
        let mut pair = PairPosition {
            pair_id: "a_b".to_string(),
            symbol1: Symbol::new("BTC/JPY"),
            symbol2: Symbol::new("ETH/JPY"),
            direction: PairDirection::ShortSpread,
            hedge_ratio: 1.0,
            entry_spread: 0.0,
            entry_z_score: 2.4,
            entry_time: Utc::now(),
            size1: 0.01,
            size2: 0.1,
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
            status: PairStatus::Open,
        };
        pair.update_pnl(11_900_000.0, 500_000.0);
        assert_relative_eq!(pair.max_pnl, 1_000.0);
        pair.update_pnl(11_950_000.0, 500_000.0);
        // mark dropped, maximum sticks
        assert_relative_eq!(pair.unrealized_pnl, 500.0);
        assert_relative_eq!(pair.max_pnl, 1_000.0);
    }
}
