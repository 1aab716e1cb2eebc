//! Single-leg order executor
//!
//! Entry is a two-phase commit between the exchange and the durable store:
//! a pending row reserves the position id before the order goes out, and the
//! row is confirmed, cancelled, or parked as execution_unknown depending on
//! how the order resolves. The whole sequence for one attempt runs under a
//! process-wide order lock.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::ExchangeError;
use crate::exchange::{ExchangeApi, OrderResult};
use crate::notify::TelegramNotifier;
use crate::positions::{PartialClose, PositionBook, PositionError};
use crate::risk::RiskController;
use crate::safe_mode::{SafeModeController, SafeModeEvent};
use crate::types::{ExitKind, Position, Side, Symbol};

/// Re-quote drift that triggers a warning (entry continues at latest price)
pub const PRICE_SLIP_WARNING_THRESHOLD: f64 = 0.02;

/// Re-quote drift that aborts the entry
pub const PRICE_SLIP_ERROR_THRESHOLD: f64 = 0.05;

/// Fills below this fraction of the requested amount are logged as partial
pub const PARTIAL_FILL_THRESHOLD: f64 = 0.95;

/// Status-poll schedule after an order timeout, in seconds (total ≤ 62s)
pub const ORDER_STATUS_RETRY_DELAYS: [u64; 6] = [2, 4, 8, 16, 16, 16];

pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    book: Arc<PositionBook>,
    risk: Arc<RiskController>,
    safe_mode: Arc<SafeModeController>,
    notifier: Arc<TelegramNotifier>,
    clock: Arc<dyn Clock>,
    /// Serializes every order attempt, single-leg and pair alike
    order_lock: Arc<tokio::sync::Mutex<()>>,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        book: Arc<PositionBook>,
        risk: Arc<RiskController>,
        safe_mode: Arc<SafeModeController>,
        notifier: Arc<TelegramNotifier>,
        clock: Arc<dyn Clock>,
        order_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        OrderExecutor {
            exchange,
            book,
            risk,
            safe_mode,
            notifier,
            clock,
            order_lock,
        }
    }

    fn handle_safe_mode_event(&self, event: SafeModeEvent) {
        match event {
            SafeModeEvent::Latched(reason) => {
                self.notifier.notify_alert(
                    "Safe mode engaged",
                    &format!("{}\nNew entries are refused; exits remain allowed.", reason),
                );
            }
            SafeModeEvent::Cleared => {
                self.notifier
                    .notify_info("Safe mode cleared", "API connectivity restored; trading resumes.");
            }
            SafeModeEvent::None => {}
        }
    }

    /// Place a market order with API-failure accounting on the safe-mode
    /// controller. Timeouts pass through untouched for the status-poll branch.
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: crate::types::OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        match self.exchange.create_market_order(symbol, side, amount).await {
            Ok(order) => {
                self.handle_safe_mode_event(self.safe_mode.record_api_success());
                Ok(order)
            }
            Err(e @ ExchangeError::Timeout { .. }) => Err(e),
            Err(e) => {
                let event = self
                    .safe_mode
                    .record_api_failure(&format!("{} order", symbol));
                self.handle_safe_mode_event(event);
                Err(e)
            }
        }
    }

    /// Full entry sequence. Returns the opened position, or None when the
    /// entry was skipped or failed in a handled way.
    pub async fn enter(
        &self,
        symbol: &Symbol,
        side: Side,
        quoted_price: f64,
        confidence: f64,
        available_capital: f64,
    ) -> Result<Option<Position>> {
        if self.safe_mode.is_engaged() {
            warn!("{} entry refused: safe mode engaged", symbol);
            return Ok(None);
        }
        if self.book.open_count() >= self.risk.max_positions() as usize {
            info!(
                "{} entry skipped: max positions reached ({})",
                symbol,
                self.risk.max_positions()
            );
            return Ok(None);
        }

        let _guard = self.order_lock.lock().await;

        if let Err(block) = self.risk.should_enter_trade(confidence, available_capital) {
            info!("{} entry skipped: {}", symbol, block);
            return Ok(None);
        }

        // Price-slip re-check: quotes age while signals are computed
        let mut current_price = quoted_price;
        match self.exchange.get_current_price(symbol).await {
            Ok(latest) => {
                self.handle_safe_mode_event(self.safe_mode.record_api_success());
                let slip = (latest - quoted_price).abs() / quoted_price;
                if slip > PRICE_SLIP_ERROR_THRESHOLD {
                    error!(
                        "{} entry aborted: price slipped {:.2}% ({:.0} -> {:.0})",
                        symbol,
                        slip * 100.0,
                        quoted_price,
                        latest
                    );
                    return Ok(None);
                }
                if slip > PRICE_SLIP_WARNING_THRESHOLD {
                    warn!(
                        "{} price slip {:.2}%, continuing at latest price {:.0}",
                        symbol,
                        slip * 100.0,
                        latest
                    );
                }
                current_price = latest;
            }
            Err(e) => {
                warn!("{} latest price fetch failed, using quote: {}", symbol, e);
            }
        }

        let quantity =
            self.risk
                .calculate_position_size_with_risk(available_capital, current_price, side);
        if quantity <= 0.0 {
            info!("{} entry skipped: computed quantity is zero", symbol);
            return Ok(None);
        }
        if let Err(reason) = self
            .risk
            .validate_position_size(quantity * current_price, available_capital)
        {
            info!("{} entry skipped: {}", symbol, reason);
            return Ok(None);
        }

        let pending = match self.book.create_pending_position(
            symbol,
            side,
            current_price,
            quantity,
            self.clock.now(),
        ) {
            Ok(p) => p,
            Err(e @ PositionError::Storage(_)) => return Err(e.into()),
            Err(e) => {
                info!("{} entry skipped: {}", symbol, e);
                return Ok(None);
            }
        };

        info!(
            "→ entering {} {} {:.8} @ {:.0}",
            side, symbol, quantity, current_price
        );
        self.execute_pending(pending, current_price).await
    }

    async fn execute_pending(
        &self,
        mut pending: Position,
        current_price: f64,
    ) -> Result<Option<Position>> {
        let symbol = pending.symbol.clone();
        let order = match self
            .place_market_order(&symbol, pending.side.entry_order(), pending.quantity)
            .await
        {
            Ok(order) => order,
            Err(ExchangeError::Timeout { order_id: Some(id) }) => {
                warn!("{} order timed out, polling status of {}", symbol, id);
                match self.poll_order_status(&id, &symbol).await {
                    Some(order) => order,
                    None => {
                        self.book.mark_pending_unknown(&mut pending)?;
                        return Ok(None);
                    }
                }
            }
            Err(ExchangeError::Timeout { order_id: None }) => {
                let event = self
                    .safe_mode
                    .record_api_failure(&format!("{} order (timeout)", symbol));
                self.handle_safe_mode_event(event);
                self.book
                    .cancel_pending_position(&mut pending, "timeout with no order id")?;
                return Ok(None);
            }
            Err(e) => {
                self.book
                    .cancel_pending_position(&mut pending, &format!("order failed: {}", e))?;
                return Ok(None);
            }
        };

        // Interpret the result: zero fill cancels, partial fill confirms at
        // the executed amount and price
        let filled = order.filled;
        if filled <= 0.0 {
            self.book.cancel_pending_position(
                &mut pending,
                &format!("zero fill (status {:?})", order.status),
            )?;
            return Ok(None);
        }
        if filled < pending.quantity * PARTIAL_FILL_THRESHOLD {
            warn!(
                "{} partial fill: {:.8}/{:.8} ({:.1}%)",
                symbol,
                filled,
                pending.quantity,
                filled / pending.quantity * 100.0
            );
        }
        pending.quantity = filled;
        let actual_price = order.executed_price(current_price);

        if let Err(e) = self
            .book
            .confirm_pending_position(&mut pending, actual_price, self.clock.now())
        {
            // The fill happened but the confirm write failed; surface loudly
            let _ = self
                .book
                .cancel_pending_position(&mut pending, &format!("confirm failed: {}", e));
            return Err(e.into());
        }

        self.notifier
            .notify_trade_open(&symbol, pending.side, actual_price, filled);
        Ok(Some(pending))
    }

    /// Bounded status polling after a timeout. Returns the terminal order if
    /// one appears; None means the order's fate stays unknown.
    async fn poll_order_status(&self, order_id: &str, symbol: &Symbol) -> Option<OrderResult> {
        let attempts = ORDER_STATUS_RETRY_DELAYS.len();
        for (i, delay) in ORDER_STATUS_RETRY_DELAYS.iter().enumerate() {
            debug!(
                "status poll {}/{}: waiting {}s for {}",
                i + 1,
                attempts,
                delay,
                order_id
            );
            sleep(Duration::from_secs(*delay)).await;
            match self.exchange.get_order_status(order_id, symbol).await {
                Ok(order) if order.status.is_terminal() => {
                    info!("order {} resolved to {:?}", order_id, order.status);
                    self.handle_safe_mode_event(self.safe_mode.record_api_success());
                    return Some(order);
                }
                Ok(order) => {
                    debug!("order {} still {:?}", order_id, order.status);
                }
                Err(e) => {
                    warn!("status poll {}/{} failed: {}", i + 1, attempts, e);
                    if i + 1 == attempts {
                        error!("all status polls failed for {}; fate unknown", order_id);
                        return None;
                    }
                }
            }
        }
        error!("order {} never reached a terminal status", order_id);
        None
    }

    /// Close the full position with an opposing market order
    pub async fn close(
        &self,
        symbol: &Symbol,
        exit_price: f64,
        reason: &str,
    ) -> Result<Option<Position>> {
        let Some(position) = self.book.get(symbol) else {
            warn!("{} close requested but no open position", symbol);
            return Ok(None);
        };

        let order = match self
            .place_market_order(symbol, position.side.exit_order(), position.quantity)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!("{} close order failed: {}", symbol, e);
                return Ok(None);
            }
        };
        if !order.status.is_success() {
            error!("{} close order not executed: {:?}", symbol, order.status);
            return Ok(None);
        }

        let closed = self.book.close_position(symbol, exit_price, self.clock.now())?;
        let pnl_pct = {
            let invested = closed.entry_price * closed.quantity;
            if invested > f64::EPSILON {
                closed.realized_pnl / invested * 100.0
            } else {
                0.0
            }
        };
        info!("✓ position closed ({}): pnl {:+.0} ({:+.2}%)", reason, closed.realized_pnl, pnl_pct);

        self.risk.record_trade_result(closed.realized_pnl);
        self.risk.reset_profit_tracking(symbol);
        self.notifier.notify_trade_close(
            symbol,
            closed.side,
            closed.entry_price,
            exit_price,
            closed.quantity,
            closed.realized_pnl,
            pnl_pct,
        );
        Ok(Some(closed))
    }

    /// Close part of a position (staged take-profit)
    pub async fn partial_close(
        &self,
        symbol: &Symbol,
        exit_price: f64,
        close_ratio: f64,
        level: u8,
    ) -> Result<Option<PartialClose>> {
        let Some(position) = self.book.get(symbol) else {
            warn!("{} partial close requested but no open position", symbol);
            return Ok(None);
        };
        let partial_quantity = position.quantity * close_ratio;

        let order = match self
            .place_market_order(symbol, position.side.exit_order(), partial_quantity)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!("{} partial close order failed: {}", symbol, e);
                return Ok(None);
            }
        };
        if !order.status.is_success() {
            error!("{} partial close order not executed: {:?}", symbol, order.status);
            return Ok(None);
        }

        let info = self
            .book
            .partial_close_position(symbol, exit_price, close_ratio, self.clock.now())?;
        self.risk.record_trade_result(info.pnl);
        self.notifier
            .notify_take_profit(symbol, level, close_ratio, info.pnl_pct);
        Ok(Some(info))
    }

    /// Run the risk controller's exit checks against an open position and
    /// dispatch whatever it asks for
    pub async fn manage_existing(&self, symbol: &Symbol, current_price: f64) -> Result<()> {
        let Some(position) = self.book.get(symbol) else {
            return Ok(());
        };
        let pnl = position.unrealized_pnl(current_price, 0.0);
        let pnl_pct = position.unrealized_pnl_pct(current_price);
        debug!(
            "{} held: {} unrealized {:+.0} ({:+.2}%)",
            symbol, position.side, pnl, pnl_pct
        );

        let Some(action) = self.risk.get_exit_action(&position, current_price) else {
            return Ok(());
        };
        info!("→ {} exit: {:?} ({})", symbol, action.kind, action.reason);

        match action.kind {
            ExitKind::StopLoss => {
                self.notifier.notify_stop_loss(symbol, pnl_pct);
                self.close(symbol, current_price, &action.reason).await?;
            }
            ExitKind::Liquidation | ExitKind::FullClose => {
                self.close(symbol, current_price, &action.reason).await?;
            }
            ExitKind::PartialClose => {
                self.partial_close(
                    symbol,
                    current_price,
                    action.close_ratio,
                    action.level.unwrap_or(1),
                )
                .await?;
            }
        }
        Ok(())
    }
}
