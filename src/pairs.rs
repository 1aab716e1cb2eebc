//! Pair executor
//!
//! The only place that issues two dependent orders. Opening reserves the
//! pair row in the durable store first, then places the legs sequentially;
//! a leg-2 failure is compensated by unwinding leg 1 with bounded retries.
//! Closing mirrors the protocol, re-opening leg 1 to restore the hedge if
//! leg 2 cannot be closed. Rollback exhaustion is a CRITICAL event: the
//! operator is alerted and safe mode latches until restart.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::PairTradingConfig;
use crate::error::ExchangeError;
use crate::exchange::{round_amount, ExchangeApi, OrderResult};
use crate::notify::TelegramNotifier;
use crate::positions::PositionBook;
use crate::risk::RiskController;
use crate::safe_mode::{SafeModeController, SafeModeReason};
use crate::signals::{SpreadAction, SpreadSignal};
use crate::store::{PairExit, SqliteStore};
use crate::types::{OrderSide, PairDirection, PairPosition, PairStatus, Symbol};

/// Compensating-order attempts before declaring the hedge broken
pub const MAX_ROLLBACK_RETRIES: u32 = 3;

/// Backoff base between rollback attempts (2s, 4s)
pub const ROLLBACK_RETRY_WAIT_BASE: u64 = 2;

pub struct PairExecutor {
    exchange: Arc<dyn ExchangeApi>,
    book: Arc<PositionBook>,
    store: Arc<SqliteStore>,
    risk: Arc<RiskController>,
    safe_mode: Arc<SafeModeController>,
    notifier: Arc<TelegramNotifier>,
    clock: Arc<dyn Clock>,
    order_lock: Arc<tokio::sync::Mutex<()>>,
    cfg: PairTradingConfig,
    commission_rate: f64,
}

impl PairExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        book: Arc<PositionBook>,
        store: Arc<SqliteStore>,
        risk: Arc<RiskController>,
        safe_mode: Arc<SafeModeController>,
        notifier: Arc<TelegramNotifier>,
        clock: Arc<dyn Clock>,
        order_lock: Arc<tokio::sync::Mutex<()>>,
        cfg: PairTradingConfig,
        commission_rate: f64,
    ) -> Self {
        PairExecutor {
            exchange,
            book,
            store,
            risk,
            safe_mode,
            notifier,
            clock,
            order_lock,
            cfg,
            commission_rate,
        }
    }

    async fn place(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderResult, ExchangeError> {
        match self.exchange.create_market_order(symbol, side, amount).await {
            Ok(order) => {
                self.safe_mode.record_api_success();
                Ok(order)
            }
            Err(e) => {
                self.safe_mode
                    .record_api_failure(&format!("{} pair leg", symbol));
                Err(e)
            }
        }
    }

    // ==================== signal routing ====================

    pub fn should_enter(&self, signal: &SpreadSignal, pair_id: &str) -> bool {
        if self.book.has_pair(pair_id) {
            return false;
        }
        if self.book.pair_count() >= self.cfg.max_pairs as usize {
            return false;
        }
        matches!(signal.signal, SpreadAction::LongSpread | SpreadAction::ShortSpread)
    }

    /// Exit policy: take-profit, trailing stop on the running maximum,
    /// mean-reversion close, z-score stop, direction change
    pub fn should_exit(&self, signal: &SpreadSignal, position: &PairPosition) -> Option<String> {
        let profit_pct = if position.entry_capital > 0.0 {
            position.unrealized_pnl / position.entry_capital
        } else {
            0.0
        };

        if profit_pct >= self.cfg.take_profit_pct {
            return Some("take_profit".to_string());
        }

        if position.max_pnl > 0.0 && position.entry_capital > 0.0 {
            let max_profit_pct = position.max_pnl / position.entry_capital;
            if max_profit_pct >= self.cfg.min_profit_pct {
                let drawdown = position.max_pnl - position.unrealized_pnl;
                if drawdown >= position.entry_capital * self.cfg.trailing_stop_pct {
                    return Some("trailing_stop".to_string());
                }
            }
        }

        if signal.signal == SpreadAction::Close {
            if profit_pct >= self.cfg.min_profit_pct {
                return Some("mean_reversion_profit".to_string());
            }
            if signal.z_score.abs() < self.cfg.z_score_exit * 0.5 {
                return Some("mean_reversion".to_string());
            }
        }

        if signal.z_score.abs() > self.cfg.z_score_stop_loss {
            return Some("stop_loss".to_string());
        }

        match (position.direction, signal.signal) {
            (PairDirection::LongSpread, SpreadAction::ShortSpread)
            | (PairDirection::ShortSpread, SpreadAction::LongSpread) => {
                Some("direction_change".to_string())
            }
            _ => None,
        }
    }

    /// Leg sizes: a fixed slice of capital on leg 1, hedge-ratio-weighted
    /// notional on leg 2
    pub fn calculate_sizes(
        &self,
        hedge_ratio: f64,
        capital: f64,
        price1: f64,
        price2: f64,
    ) -> (f64, f64, f64) {
        let pair_capital = capital * self.cfg.position_size_pct;
        let size1 = round_amount(pair_capital / price1);
        let size2 = round_amount(size1 * hedge_ratio * (price1 / price2));
        (size1, size2, pair_capital)
    }

    pub fn update_unrealized(&self, prices: &HashMap<Symbol, f64>) {
        self.book.update_pair_marks(prices);
    }

    // ==================== open protocol ====================

    /// Open both legs. Steps: sell-side balance check, DB-first reservation,
    /// leg 1, leg 2, compensating rollback on leg-2 failure.
    pub async fn open_pair(
        &self,
        symbol1: &Symbol,
        symbol2: &Symbol,
        signal: &SpreadSignal,
        price1: f64,
        price2: f64,
        capital: f64,
    ) -> Result<Option<PairPosition>> {
        if self.safe_mode.is_engaged() {
            warn!("pair entry refused: safe mode engaged");
            return Ok(None);
        }
        let direction = match signal.signal {
            SpreadAction::LongSpread => PairDirection::LongSpread,
            SpreadAction::ShortSpread => PairDirection::ShortSpread,
            _ => return Ok(None),
        };

        let _guard = self.order_lock.lock().await;

        let (size1, size2, pair_capital) =
            self.calculate_sizes(signal.hedge_ratio, capital, price1, price2);
        if size1 <= 0.0 || size2 <= 0.0 {
            return Ok(None);
        }

        let pair_id = PairPosition::pair_id_for(symbol1, symbol2);
        let mut pair = PairPosition {
            pair_id: pair_id.clone(),
            symbol1: symbol1.clone(),
            symbol2: symbol2.clone(),
            direction,
            hedge_ratio: signal.hedge_ratio,
            entry_spread: price1 - signal.hedge_ratio * price2,
            entry_z_score: signal.z_score,
            entry_time: self.clock.now(),
            size1,
            size2,
            entry_price1: price1,
            entry_price2: price2,
            entry_capital: pair_capital,
            unrealized_pnl: 0.0,
            max_pnl: 0.0,
            exit_price1: None,
            exit_price2: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: 0.0,
            status: PairStatus::PendingExecution,
        };

        // Spot markets cannot go short uncovered: the selling leg must be
        // backed by an existing balance
        let (sell_symbol, sell_size) = match direction {
            PairDirection::LongSpread => (symbol2, size2),
            PairDirection::ShortSpread => (symbol1, size1),
        };
        match self.exchange.fetch_balance(sell_symbol.base_currency()).await {
            Ok(balance) => {
                self.safe_mode.record_api_success();
                if balance.free < sell_size {
                    error!(
                        "pair entry aborted: {} balance {:.6} below required {:.6}",
                        sell_symbol.base_currency(),
                        balance.free,
                        sell_size
                    );
                    return Ok(None);
                }
            }
            Err(e) => {
                self.safe_mode.record_api_failure("pair balance check");
                warn!("pair entry aborted: balance check failed: {}", e);
                return Ok(None);
            }
        }

        // DB-first reservation: a crash after this point leaves a row the
        // startup check will refuse to ignore
        if let Err(e) = self.store.create_pair_position(&pair) {
            error!("pair reservation write failed, no orders sent: {}", e);
            self.notifier.notify_error(
                "Pair reservation failed",
                &format!("{}\nNo orders were sent.\n{}", pair_id, e),
            );
            return Ok(None);
        }

        // Leg 1
        let leg1 = self.place(symbol1, direction.leg1_entry(), size1).await;
        if !order_succeeded(&leg1) {
            error!("{} leg-1 order failed, pair abandoned", symbol1);
            self.mark_pair_failed(&pair_id);
            return Ok(None);
        }

        // Leg 2
        let leg2 = self.place(symbol2, direction.leg2_entry(), size2).await;
        if !order_succeeded(&leg2) {
            error!("{} leg-2 order failed, unwinding leg 1", symbol2);
            self.rollback_leg1(
                &pair_id,
                symbol1,
                direction.leg1_entry().opposite(),
                size1,
                RollbackContext::Open,
            )
            .await;
            return Ok(None);
        }

        pair.status = PairStatus::Open;
        if let Err(e) = self.store.update_pair_status(&pair_id, PairStatus::Open) {
            error!("pair status update failed after fills: {}", e);
            self.notifier.notify_error(
                "Pair status update failed",
                &format!("{}\nBoth legs filled but the row still reads pending.\n{}", pair_id, e),
            );
        }
        self.book.insert_pair(pair.clone());

        info!(
            "✓ pair opened: {} ({}) sizes {:.6}/{:.6} z={:.2}",
            pair_id,
            direction.as_str(),
            size1,
            size2,
            signal.z_score
        );
        self.notifier.notify_pair_trade_open(
            &pair_id, symbol1, symbol2, direction, size1, size2, signal.z_score,
        );
        Ok(Some(pair))
    }

    // ==================== close protocol ====================

    /// Close both legs; a leg-2 failure re-opens leg 1 to restore the hedge
    pub async fn close_pair(
        &self,
        pair_id: &str,
        price1: f64,
        price2: f64,
        reason: &str,
    ) -> Result<Option<f64>> {
        let Some(pair) = self.book.get_pair(pair_id) else {
            warn!("{} close requested but pair not held", pair_id);
            return Ok(None);
        };

        let _guard = self.order_lock.lock().await;
        info!("closing pair {} ({})", pair_id, reason);

        // Closing inverts the entry sides
        let leg1_close = pair.direction.leg1_entry().opposite();
        let leg2_close = pair.direction.leg2_entry().opposite();

        let leg1 = self.place(&pair.symbol1, leg1_close, pair.size1).await;
        if !order_succeeded(&leg1) {
            error!("{} leg-1 close failed, pair stays open", pair.symbol1);
            return Ok(None);
        }

        let leg2 = self.place(&pair.symbol2, leg2_close, pair.size2).await;
        if !order_succeeded(&leg2) {
            error!("{} leg-2 close failed, restoring hedge on leg 1", pair.symbol2);
            // Compensation re-enters leg 1 on its original side
            self.rollback_leg1(
                pair_id,
                &pair.symbol1,
                pair.direction.leg1_entry(),
                pair.size1,
                RollbackContext::Close {
                    open_leg: pair.symbol2.clone(),
                },
            )
            .await;
            return Ok(None);
        }

        // Both legs closed: realize P&L net of commission on all executed legs
        let gross = pair.pnl_at(price1, price2);
        let fees = (pair.entry_price1 * pair.size1
            + pair.entry_price2 * pair.size2
            + price1 * pair.size1
            + price2 * pair.size2)
            * self.commission_rate;
        let pnl = gross - fees;

        self.book.remove_pair(pair_id);
        let exit = PairExit {
            exit_price1: price1,
            exit_price2: price2,
            exit_time: self.clock.now(),
            exit_reason: reason.to_string(),
            realized_pnl: pnl,
        };
        if let Err(e) = self.store.close_pair_position(pair_id, &exit) {
            // The exchange-side close succeeded; the book must not resurrect
            // the pair, so report and move on
            error!("pair close persisted failed: {}", e);
            self.notifier.notify_error(
                "Pair close record failed",
                &format!("{}\nLegs are closed but the exit row was not written.\n{}", pair_id, e),
            );
        }

        info!("✓ pair closed: {} pnl {:+.0} ({})", pair_id, pnl, reason);
        self.risk.record_trade_result(pnl);
        self.notifier.notify_pair_trade_close(pair_id, pnl, reason);
        Ok(Some(pnl))
    }

    // ==================== rollback ====================

    fn mark_pair_failed(&self, pair_id: &str) {
        if let Err(e) = self
            .store
            .update_pair_status(pair_id, PairStatus::ExecutionFailed)
        {
            error!("failed to mark pair {} execution_failed: {}", pair_id, e);
            self.notifier.notify_error(
                "Pair status record failed",
                &format!("{}\nCould not record the failed state.\n{}", pair_id, e),
            );
        }
    }

    async fn rollback_leg1(
        &self,
        pair_id: &str,
        symbol1: &Symbol,
        rollback_side: OrderSide,
        size1: f64,
        context: RollbackContext,
    ) {
        for attempt in 0..MAX_ROLLBACK_RETRIES {
            if attempt > 0 {
                let wait = ROLLBACK_RETRY_WAIT_BASE.pow(attempt);
                warn!(
                    "rollback retry {}/{}: waiting {}s",
                    attempt,
                    MAX_ROLLBACK_RETRIES - 1,
                    wait
                );
                sleep(Duration::from_secs(wait)).await;
            }

            let order = self.place(symbol1, rollback_side, size1).await;
            if order_succeeded(&order) {
                warn!(
                    "✓ rollback succeeded on attempt {}: {} {} {:.6}",
                    attempt + 1,
                    rollback_side,
                    symbol1,
                    size1
                );
                match &context {
                    RollbackContext::Open => {
                        self.mark_pair_failed(pair_id);
                        self.notifier.notify_error(
                            "Pair rollback",
                            &format!(
                                "{}\nLeg 2 failed; leg 1 was unwound ({} {} {:.6}).",
                                pair_id, rollback_side, symbol1, size1
                            ),
                        );
                    }
                    RollbackContext::Close { open_leg } => {
                        self.notifier.notify_error(
                            "Pair close rollback",
                            &format!(
                                "{}\nLeg-2 close failed; leg 1 was re-opened to keep the hedge.\n\
                                 {} remains open.",
                                pair_id, open_leg
                            ),
                        );
                    }
                }
                return;
            }
            warn!("✗ rollback attempt {} failed", attempt + 1);
        }

        // Exhausted: an un-hedged leg is live on the exchange
        error!(
            "✗✗✗ rollback failed {} times: {} {:.6} is un-hedged",
            MAX_ROLLBACK_RETRIES, symbol1, size1
        );
        let detail = match &context {
            RollbackContext::Open => format!(
                "{}\nLeg 2 failed and leg 1 could not be unwound.\n\
                 Un-hedged position: {} {:.6}\n\
                 Check the exchange and close the position manually.",
                pair_id, symbol1, size1
            ),
            RollbackContext::Close { open_leg } => format!(
                "{}\nOnly leg 1 is closed; {} is still open and leg 1 could not be re-opened.\n\
                 Restore the hedge manually on the exchange.",
                pair_id, open_leg
            ),
        };
        self.notifier.notify_alert("Pair rollback failed", &detail);
        if matches!(context, RollbackContext::Open) {
            self.mark_pair_failed(pair_id);
        }
        self.safe_mode.engage(SafeModeReason::RollbackFailed);
    }
}

enum RollbackContext {
    Open,
    Close { open_leg: Symbol },
}

fn order_succeeded(result: &Result<OrderResult, ExchangeError>) -> bool {
    matches!(result, Ok(order) if order.status.is_success())
}
