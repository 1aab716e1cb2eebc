//! Risk controller
//!
//! Stop-loss, staged take-profit, margin checks, drawdown, consecutive-loss
//! and period-loss pauses with 24-hour auto-resume, plus risk-based position
//! sizing. Decisions are pure functions of the current position, price and
//! carried state; the state sits behind an internal lock so the bot command
//! task can share the controller with the trade loop.

use chrono::{DateTime, Datelike, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::RiskManagementConfig;
use crate::exchange::round_amount;
use crate::types::{ExitAction, ExitKind, Position, Side, Symbol};

/// Hours a pause lasts before trading resumes automatically
pub const AUTO_RESUME_HOURS: i64 = 24;

/// Reasons an entry is refused. Not errors: the loop logs and skips.
#[derive(Debug, Clone, Error)]
pub enum EntryBlock {
    #[error("trading paused: {0}")]
    Paused(String),

    #[error("{0}")]
    PeriodLoss(String),

    #[error("confidence {confidence:.2} below minimum {min:.2}")]
    LowConfidence { confidence: f64, min: f64 },

    #[error("maximum drawdown exceeded")]
    DrawdownExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginState {
    Spot,
    Normal,
    MarginCall,
    Liquidation,
}

#[derive(Debug, Clone)]
pub struct MarginCheck {
    pub state: MarginState,
    pub margin_ratio: f64,
    pub liquidation_price: f64,
    pub action: Option<ExitAction>,
}

/// Point-in-time view of risk state for /status and reports
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub trading_paused: bool,
    pub pause_reason: Option<String>,
    pub consecutive_losses: u32,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub monthly_pnl: f64,
    pub stop_loss_pct: f64,
}

#[derive(Debug)]
struct RiskState {
    stop_loss_pct: f64,
    peak_equity: f64,
    current_equity: f64,
    partial_profit_taken: HashSet<Symbol>,
    consecutive_losses: u32,
    trading_paused: bool,
    pause_timestamp: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
    daily_pnl: f64,
    weekly_pnl: f64,
    monthly_pnl: f64,
    last_reset_day: Option<chrono::NaiveDate>,
    last_reset_week: Option<(i32, u32)>,
    last_reset_month: Option<(i32, u32)>,
}

pub struct RiskController {
    cfg: RiskManagementConfig,
    initial_capital: f64,
    min_confidence: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<RiskState>,
}

impl RiskController {
    pub fn new(
        cfg: RiskManagementConfig,
        initial_capital: f64,
        min_confidence: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "risk controller ready: stop_loss={}% drawdown={}% staged_tp=({}%, {}%) \
             loss_limits=({}d/{}w/{}m)% consecutive_limit={}",
            cfg.stop_loss_pct,
            cfg.max_drawdown_pct,
            cfg.take_profit_first,
            cfg.take_profit_second,
            cfg.max_daily_loss_pct,
            cfg.max_weekly_loss_pct,
            cfg.max_monthly_loss_pct,
            cfg.consecutive_loss_limit
        );
        let stop_loss_pct = cfg.stop_loss_pct;
        RiskController {
            cfg,
            initial_capital,
            min_confidence,
            clock,
            state: Mutex::new(RiskState {
                stop_loss_pct,
                peak_equity: 0.0,
                current_equity: initial_capital,
                partial_profit_taken: HashSet::new(),
                consecutive_losses: 0,
                trading_paused: false,
                pause_timestamp: None,
                pause_reason: None,
                daily_pnl: 0.0,
                weekly_pnl: 0.0,
                monthly_pnl: 0.0,
                last_reset_day: None,
                last_reset_week: None,
                last_reset_month: None,
            }),
        }
    }

    pub fn max_positions(&self) -> u32 {
        self.cfg.max_positions
    }

    pub fn max_position_size(&self) -> f64 {
        self.cfg.max_position_size
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn stop_loss_pct(&self) -> f64 {
        self.state.lock().unwrap().stop_loss_pct
    }

    /// Live-update from the bot's set_stop_loss command; clamped to [1, 50]
    pub fn set_stop_loss_pct(&self, value: f64) {
        let clamped = value.clamp(1.0, 50.0);
        self.state.lock().unwrap().stop_loss_pct = clamped;
        info!("stop loss updated to {}%", clamped);
    }

    // ==================== exit checks ====================

    pub fn check_stop_loss(&self, position: &Position, current_price: f64) -> bool {
        let pnl_pct = position.unrealized_pnl_pct(current_price);
        let threshold = self.stop_loss_pct();
        if pnl_pct <= -threshold {
            warn!(
                "stop loss triggered: {} {:.2}% (threshold -{}%)",
                position.symbol, pnl_pct, threshold
            );
            return true;
        }
        false
    }

    /// Staged take-profit. The first stage fires at most once per position
    /// lifetime; the second is a full close. Stages are evaluated in order
    /// and the first match wins.
    pub fn check_profit_taking(
        &self,
        position: &Position,
        current_price: f64,
    ) -> Option<ExitAction> {
        let pnl_pct = position.unrealized_pnl_pct(current_price);
        let levels = [
            (1u8, self.cfg.take_profit_first, 0.5),
            (2u8, self.cfg.take_profit_second, 1.0),
        ];

        let mut state = self.state.lock().unwrap();
        for (level, threshold_pct, close_ratio) in levels {
            if level == 1 && state.partial_profit_taken.contains(&position.symbol) {
                continue;
            }
            if pnl_pct >= threshold_pct {
                if level == 1 {
                    state.partial_profit_taken.insert(position.symbol.clone());
                }
                let kind = if close_ratio >= 1.0 {
                    ExitKind::FullClose
                } else {
                    ExitKind::PartialClose
                };
                info!(
                    "take-profit stage {} hit: {} +{:.2}% -> close {:.0}%",
                    level,
                    position.symbol,
                    pnl_pct,
                    close_ratio * 100.0
                );
                return Some(ExitAction {
                    kind,
                    close_ratio,
                    reason: format!("stage {} take-profit (+{:.2}%)", level, pnl_pct),
                    level: Some(level),
                });
            }
        }
        None
    }

    /// Margin maintenance for leveraged positions
    pub fn check_margin_status(&self, position: &Position, current_price: f64) -> MarginCheck {
        if !position.is_leveraged {
            return MarginCheck {
                state: MarginState::Spot,
                margin_ratio: 1.0,
                liquidation_price: 0.0,
                action: None,
            };
        }

        let margin_ratio = position.margin_ratio(current_price);
        let liquidation_price = position.liquidation_price(self.cfg.liquidation_threshold);

        if margin_ratio <= self.cfg.liquidation_threshold {
            error!(
                "forced liquidation: {} margin ratio {:.1}% (threshold {:.1}%)",
                position.symbol,
                margin_ratio * 100.0,
                self.cfg.liquidation_threshold * 100.0
            );
            return MarginCheck {
                state: MarginState::Liquidation,
                margin_ratio,
                liquidation_price,
                action: Some(ExitAction {
                    kind: ExitKind::Liquidation,
                    close_ratio: 1.0,
                    reason: format!("forced liquidation (margin ratio {:.1}%)", margin_ratio * 100.0),
                    level: None,
                }),
            };
        }

        if margin_ratio <= self.cfg.margin_call_threshold {
            warn!(
                "margin call: {} margin ratio {:.1}%, liquidation at {:.0}",
                position.symbol,
                margin_ratio * 100.0,
                liquidation_price
            );
            return MarginCheck {
                state: MarginState::MarginCall,
                margin_ratio,
                liquidation_price,
                action: None,
            };
        }

        MarginCheck {
            state: MarginState::Normal,
            margin_ratio,
            liquidation_price,
            action: None,
        }
    }

    /// Combined exit check: margin first, then stop-loss, then take-profit
    pub fn get_exit_action(&self, position: &Position, current_price: f64) -> Option<ExitAction> {
        if position.is_leveraged {
            let margin = self.check_margin_status(position, current_price);
            if margin.action.is_some() {
                return margin.action;
            }
        }

        if self.check_stop_loss(position, current_price) {
            return Some(ExitAction {
                kind: ExitKind::StopLoss,
                close_ratio: 1.0,
                reason: format!(
                    "stop loss ({:.2}%)",
                    position.unrealized_pnl_pct(current_price)
                ),
                level: None,
            });
        }

        self.check_profit_taking(position, current_price)
    }

    pub fn reset_profit_tracking(&self, symbol: &Symbol) {
        self.state.lock().unwrap().partial_profit_taken.remove(symbol);
    }

    // ==================== entry gating ====================

    /// Track peak equity; returns true when drawdown breaches the limit
    pub fn check_drawdown(&self, current_equity: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.current_equity = current_equity;
        if current_equity > state.peak_equity {
            state.peak_equity = current_equity;
        }
        if state.peak_equity <= 0.0 {
            return false;
        }
        let drawdown_pct = (state.peak_equity - current_equity) / state.peak_equity * 100.0;
        if drawdown_pct >= self.cfg.max_drawdown_pct {
            error!(
                "maximum drawdown exceeded: {:.2}% (limit {}%)",
                drawdown_pct, self.cfg.max_drawdown_pct
            );
            return true;
        }
        false
    }

    pub fn should_enter_trade(&self, confidence: f64, current_equity: f64) -> Result<(), EntryBlock> {
        if let Some(reason) = self.is_paused() {
            return Err(EntryBlock::Paused(reason));
        }
        if let Some(reason) = self.check_period_loss_limits() {
            return Err(EntryBlock::PeriodLoss(reason));
        }
        if confidence < self.min_confidence {
            return Err(EntryBlock::LowConfidence {
                confidence,
                min: self.min_confidence,
            });
        }
        if self.check_drawdown(current_equity) {
            return Err(EntryBlock::DrawdownExceeded);
        }
        Ok(())
    }

    // ==================== trade results & pauses ====================

    /// Record realized P&L: period buckets plus the consecutive-loss
    /// counter. Results at or below zero count as losses.
    pub fn record_trade_result(&self, pnl: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        Self::roll_period_buckets(&mut state, now);
        state.daily_pnl += pnl;
        state.weekly_pnl += pnl;
        state.monthly_pnl += pnl;

        if pnl <= 0.0 {
            state.consecutive_losses += 1;
            warn!(
                "consecutive losses: {} (limit {})",
                state.consecutive_losses, self.cfg.consecutive_loss_limit
            );
            if state.consecutive_losses >= self.cfg.consecutive_loss_limit
                && !state.trading_paused
            {
                state.trading_paused = true;
                state.pause_timestamp = Some(now);
                state.pause_reason = Some(format!(
                    "consecutive loss limit reached ({})",
                    state.consecutive_losses
                ));
                error!(
                    "consecutive loss limit reached, trading paused for {}h",
                    AUTO_RESUME_HOURS
                );
            }
        } else {
            if state.consecutive_losses > 0 {
                info!("consecutive losses reset (was {})", state.consecutive_losses);
            }
            state.consecutive_losses = 0;
        }
    }

    fn roll_period_buckets(state: &mut RiskState, now: DateTime<Utc>) {
        let day = now.date_naive();
        let iso = now.iso_week();
        let week = (iso.year(), iso.week());
        let month = (now.year(), now.month());

        if state.last_reset_day != Some(day) {
            state.daily_pnl = 0.0;
            state.last_reset_day = Some(day);
        }
        if state.last_reset_week != Some(week) {
            state.weekly_pnl = 0.0;
            state.last_reset_week = Some(week);
        }
        if state.last_reset_month != Some(month) {
            state.monthly_pnl = 0.0;
            state.last_reset_month = Some(month);
        }
    }

    /// Any period bucket breaching its limit latches the pause
    pub fn check_period_loss_limits(&self) -> Option<String> {
        if self.initial_capital <= 0.0 {
            return None;
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        Self::roll_period_buckets(&mut state, now);

        let checks = [
            (state.daily_pnl, self.cfg.max_daily_loss_pct, "daily"),
            (state.weekly_pnl, self.cfg.max_weekly_loss_pct, "weekly"),
            (state.monthly_pnl, self.cfg.max_monthly_loss_pct, "monthly"),
        ];
        for (pnl, limit, label) in checks {
            let loss_pct = pnl / self.initial_capital * 100.0;
            if loss_pct <= -limit {
                let msg = format!("{} loss limit exceeded: {:.2}% (limit -{}%)", label, loss_pct, limit);
                error!("{}", msg);
                if !state.trading_paused {
                    state.trading_paused = true;
                    state.pause_timestamp = Some(now);
                    state.pause_reason = Some(msg.clone());
                }
                return Some(msg);
            }
        }
        None
    }

    /// Clear the pause once 24 hours have elapsed; consecutive losses reset
    pub fn check_auto_resume(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let Some(paused_at) = state.pause_timestamp else {
            return false;
        };
        if !state.trading_paused {
            return false;
        }
        if now - paused_at >= chrono::Duration::hours(AUTO_RESUME_HOURS) {
            info!("pause elapsed {}h, resuming trading automatically", AUTO_RESUME_HOURS);
            state.trading_paused = false;
            state.pause_timestamp = None;
            state.pause_reason = None;
            state.consecutive_losses = 0;
            return true;
        }
        false
    }

    pub fn is_paused(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.trading_paused {
            Some(
                state
                    .pause_reason
                    .clone()
                    .unwrap_or_else(|| "loss limit exceeded".to_string()),
            )
        } else {
            None
        }
    }

    /// Manual pause from the bot interface
    pub fn pause(&self, reason: &str) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.trading_paused = true;
        state.pause_timestamp = Some(now);
        state.pause_reason = Some(reason.to_string());
        warn!("trading paused: {}", reason);
    }

    /// Manual resume: clears the pause and zeroes consecutive losses
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.trading_paused = false;
        state.pause_timestamp = None;
        state.pause_reason = None;
        state.consecutive_losses = 0;
        info!("trading resumed");
    }

    // ==================== sizing ====================

    /// Risk-based sizing: quantity = risk amount / stop distance, capped at
    /// max_position_size of capital. For shorts the stop sits above entry.
    pub fn calculate_position_size_with_risk(
        &self,
        available_capital: f64,
        current_price: f64,
        side: Side,
    ) -> f64 {
        if current_price <= 0.0 || available_capital <= 0.0 {
            return 0.0;
        }
        let risk_amount = available_capital * (self.cfg.risk_per_trade_pct / 100.0);
        let stop_pct = self.stop_loss_pct() / 100.0;
        let stop_loss_price = match side {
            Side::Long => current_price * (1.0 - stop_pct),
            Side::Short => current_price * (1.0 + stop_pct),
        };
        let risk_per_unit = (current_price - stop_loss_price).abs();
        if risk_per_unit <= 0.0 {
            return 0.0;
        }
        let quantity = risk_amount / risk_per_unit;
        let max_quantity = available_capital * self.cfg.max_position_size / current_price;
        round_amount(quantity.min(max_quantity))
    }

    pub fn validate_position_size(
        &self,
        position_value: f64,
        available_capital: f64,
    ) -> Result<(), String> {
        let max_allowed = available_capital * self.cfg.max_position_size;
        if position_value > max_allowed {
            let msg = format!(
                "position value {:.0} exceeds {:.0} ({:.0}% of capital)",
                position_value,
                max_allowed,
                self.cfg.max_position_size * 100.0
            );
            warn!("{}", msg);
            return Err(msg);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let state = self.state.lock().unwrap();
        let drawdown_pct = if state.peak_equity > 0.0 {
            (state.peak_equity - state.current_equity) / state.peak_equity * 100.0
        } else {
            0.0
        };
        RiskSnapshot {
            trading_paused: state.trading_paused,
            pause_reason: state.pause_reason.clone(),
            consecutive_losses: state.consecutive_losses,
            peak_equity: state.peak_equity,
            drawdown_pct,
            daily_pnl: state.daily_pnl,
            weekly_pnl: state.weekly_pnl,
            monthly_pnl: state.monthly_pnl,
            stop_loss_pct: state.stop_loss_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn controller_with_clock() -> (RiskController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = RiskController::new(
            RiskManagementConfig::default(),
            200_000.0,
            0.6,
            clock.clone(),
        );
        (controller, clock)
    }

    fn long_position(entry: f64, quantity: f64) -> Position {
        let mut p = Position::new(Symbol::new("BTC/JPY"), Side::Long, entry, quantity, Utc::now());
        p.status = crate::types::PositionStatus::Open;
        p
    }

    #[test]
    fn test_stop_loss_trigger() {
        let (risk, _) = controller_with_clock();
        let position = long_position(10_000_000.0, 0.01);
        assert!(!risk.check_stop_loss(&position, 9_100_000.0)); // -9%
        assert!(risk.check_stop_loss(&position, 9_000_000.0)); // -10%
    }

    #[test]
    fn test_stop_loss_short_side() {
        let (risk, _) = controller_with_clock();
        let mut position =
            Position::new(Symbol::new("FX_BTC_JPY"), Side::Short, 10_000_000.0, 0.01, Utc::now());
        position.is_leveraged = false; // isolate the stop check
        // +10.5% against the short
        let action = risk.get_exit_action(&position, 11_050_000.0).unwrap();
        assert_eq!(action.kind, ExitKind::StopLoss);
        assert_relative_eq!(action.close_ratio, 1.0);
    }

    #[test]
    fn test_staged_take_profit_first_stage_once() {
        let (risk, _) = controller_with_clock();
        let position = long_position(10_000_000.0, 0.01);

        // +15% fires stage 1 at half size
        let action = risk.check_profit_taking(&position, 11_500_000.0).unwrap();
        assert_eq!(action.kind, ExitKind::PartialClose);
        assert_relative_eq!(action.close_ratio, 0.5);
        assert_eq!(action.level, Some(1));

        // same gain again: stage 1 is spent, nothing fires below stage 2
        assert!(risk.check_profit_taking(&position, 11_500_000.0).is_none());

        // +25% fires stage 2 as a full close
        let action = risk.check_profit_taking(&position, 12_500_000.0).unwrap();
        assert_eq!(action.kind, ExitKind::FullClose);
        assert_relative_eq!(action.close_ratio, 1.0);
        assert_eq!(action.level, Some(2));

        // a fresh lifetime gets stage 1 back
        risk.reset_profit_tracking(&position.symbol);
        assert!(risk.check_profit_taking(&position, 11_500_000.0).is_some());
    }

    #[test]
    fn test_margin_check_precedes_stop_loss() {
        let (risk, _) = controller_with_clock();
        let mut position =
            Position::new(Symbol::new("FX_BTC_JPY"), Side::Long, 10_000_000.0, 0.01, Utc::now());
        position.leverage = 2.0;

        // deep enough that both margin and stop loss would fire
        let action = risk.get_exit_action(&position, 7_000_000.0).unwrap();
        assert_eq!(action.kind, ExitKind::Liquidation);

        // margin call zone warns without action, stop-loss takes over
        let check = risk.check_margin_status(&position, 9_200_000.0);
        assert_eq!(check.state, MarginState::MarginCall);
        assert!(check.action.is_none());
    }

    #[test]
    fn test_consecutive_losses_latch_and_reset() {
        let (risk, _) = controller_with_clock();
        for _ in 0..4 {
            risk.record_trade_result(-100.0);
        }
        assert!(risk.is_paused().is_none());
        // zero counts as a loss
        risk.record_trade_result(0.0);
        assert!(risk.is_paused().is_some());

        risk.resume();
        assert!(risk.is_paused().is_none());
        assert_eq!(risk.snapshot().consecutive_losses, 0);

        // a win resets the streak immediately
        risk.record_trade_result(-100.0);
        risk.record_trade_result(50.0);
        assert_eq!(risk.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn test_auto_resume_after_24_hours() {
        let (risk, clock) = controller_with_clock();
        for _ in 0..5 {
            risk.record_trade_result(-100.0);
        }
        assert!(risk.is_paused().is_some());

        clock.advance(Duration::hours(23));
        assert!(!risk.check_auto_resume());
        assert!(risk.is_paused().is_some());

        clock.advance(Duration::hours(2));
        assert!(risk.check_auto_resume());
        assert!(risk.is_paused().is_none());
        assert_eq!(risk.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn test_period_loss_limit_latches_pause() {
        let (risk, _) = controller_with_clock();
        // -5% of 200,000 initial capital
        risk.record_trade_result(-10_000.0);
        let reason = risk.check_period_loss_limits();
        assert!(reason.is_some());
        assert!(risk.is_paused().is_some());
    }

    #[test]
    fn test_should_enter_trade_gates() {
        let (risk, _) = controller_with_clock();
        assert!(risk.should_enter_trade(0.75, 200_000.0).is_ok());
        assert!(matches!(
            risk.should_enter_trade(0.4, 200_000.0),
            Err(EntryBlock::LowConfidence { .. })
        ));

        risk.pause("manual");
        assert!(matches!(
            risk.should_enter_trade(0.75, 200_000.0),
            Err(EntryBlock::Paused(_))
        ));
        risk.resume();

        // 25% drawdown from a 200,000 peak
        risk.check_drawdown(200_000.0);
        assert!(matches!(
            risk.should_enter_trade(0.75, 150_000.0),
            Err(EntryBlock::DrawdownExceeded)
        ));
    }

    #[test]
    fn test_risk_based_sizing() {
        let (risk, _) = controller_with_clock();
        // risk 2% of 200,000 = 4,000; stop distance 10% of 12,000,000
        let quantity =
            risk.calculate_position_size_with_risk(200_000.0, 12_000_000.0, Side::Long);
        assert_relative_eq!(quantity, 4_000.0 / 1_200_000.0, epsilon = 1e-8);

        // cap kicks in when the stop is tight relative to capital
        let capped = risk.calculate_position_size_with_risk(200_000.0, 100.0, Side::Long);
        assert_relative_eq!(capped, 200_000.0 * 0.95 / 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_validate_position_size() {
        let (risk, _) = controller_with_clock();
        assert!(risk.validate_position_size(100_000.0, 200_000.0).is_ok());
        assert!(risk.validate_position_size(195_000.0, 200_000.0).is_err());
    }

    #[test]
    fn test_set_stop_loss_clamped() {
        let (risk, _) = controller_with_clock();
        risk.set_stop_loss_pct(75.0);
        assert_relative_eq!(risk.stop_loss_pct(), 50.0);
        risk.set_stop_loss_pct(0.2);
        assert_relative_eq!(risk.stop_loss_pct(), 1.0);
        risk.set_stop_loss_pct(12.0);
        assert_relative_eq!(risk.stop_loss_pct(), 12.0);
    }
}
