//! Safe-mode latch and API failure accounting
//!
//! One latch, three inputs: a streak of API failures, a pair-rollback
//! exhaustion, or a startup recovery failure. While latched, every new-entry
//! path short-circuits; exits and rollbacks stay permitted. Only the
//! API-failure latch clears itself (on the first successful call); the other
//! reasons require a manual restart.
//!
//! The failure counter and the latch sit behind separate locks, taken in
//! that order, so the loop never observes a stale latch between check and
//! use.

use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Consecutive adapter failures before safe mode latches
pub const API_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeModeReason {
    /// Auto-clears on the next successful adapter call
    ApiFailures(u32),
    /// A pair rollback exhausted its retries; manual restart only
    RollbackFailed,
    /// Startup reconciliation could not rebuild state; manual restart only
    StartupRecovery,
}

impl SafeModeReason {
    fn auto_clearable(&self) -> bool {
        matches!(self, SafeModeReason::ApiFailures(_))
    }
}

impl fmt::Display for SafeModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeModeReason::ApiFailures(n) => write!(f, "API failures ({} consecutive)", n),
            SafeModeReason::RollbackFailed => write!(f, "pair rollback failed"),
            SafeModeReason::StartupRecovery => write!(f, "startup position recovery failed"),
        }
    }
}

/// State transition reported back to the caller so it can notify
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeModeEvent {
    None,
    Latched(SafeModeReason),
    Cleared,
}

pub struct SafeModeController {
    failures: Mutex<u32>,
    latch: Mutex<Option<SafeModeReason>>,
    threshold: u32,
}

impl Default for SafeModeController {
    fn default() -> Self {
        Self::new(API_FAILURE_THRESHOLD)
    }
}

impl SafeModeController {
    pub fn new(threshold: u32) -> Self {
        SafeModeController {
            failures: Mutex::new(0),
            latch: Mutex::new(None),
            threshold,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.latch.lock().unwrap().is_some()
    }

    pub fn reason(&self) -> Option<SafeModeReason> {
        self.latch.lock().unwrap().clone()
    }

    /// Latch unconditionally (rollback / startup failures)
    pub fn engage(&self, reason: SafeModeReason) {
        let mut latch = self.latch.lock().unwrap();
        if latch.is_none() || latch.as_ref().is_some_and(|r| r.auto_clearable()) {
            error!("safe mode engaged: {}", reason);
            *latch = Some(reason);
        }
    }

    /// Record a failed adapter call; latches at the threshold
    pub fn record_api_failure(&self, operation: &str) -> SafeModeEvent {
        let count = {
            let mut failures = self.failures.lock().unwrap();
            // bounded so a long outage cannot overflow the counter
            if *failures < 9_999 {
                *failures += 1;
            }
            *failures
        };
        warn!("API failure: {} ({}/{})", operation, count, self.threshold);

        if count >= self.threshold {
            let mut latch = self.latch.lock().unwrap();
            if latch.is_none() {
                let reason = SafeModeReason::ApiFailures(count);
                error!("safe mode engaged: {} - new entries refused, exits still allowed", reason);
                *latch = Some(reason.clone());
                return SafeModeEvent::Latched(reason);
            }
        }
        SafeModeEvent::None
    }

    /// Record a successful adapter call; resets the counter and clears an
    /// API-failure latch. Manual-only reasons stay latched.
    pub fn record_api_success(&self) -> SafeModeEvent {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                info!("API recovered, failure counter reset ({} -> 0)", *failures);
                *failures = 0;
            }
        }
        let mut latch = self.latch.lock().unwrap();
        if latch.as_ref().is_some_and(|r| r.auto_clearable()) {
            info!("safe mode cleared: API connectivity restored");
            *latch = None;
            return SafeModeEvent::Cleared;
        }
        SafeModeEvent::None
    }

    pub fn failure_count(&self) -> u32 {
        *self.failures.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latches_at_threshold() {
        let safe_mode = SafeModeController::new(3);
        assert_eq!(safe_mode.record_api_failure("order"), SafeModeEvent::None);
        assert_eq!(safe_mode.record_api_failure("order"), SafeModeEvent::None);
        assert!(!safe_mode.is_engaged());

        let event = safe_mode.record_api_failure("order");
        assert_eq!(event, SafeModeEvent::Latched(SafeModeReason::ApiFailures(3)));
        assert!(safe_mode.is_engaged());
    }

    #[test]
    fn test_success_clears_api_latch() {
        let safe_mode = SafeModeController::new(2);
        safe_mode.record_api_failure("balance");
        safe_mode.record_api_failure("balance");
        assert!(safe_mode.is_engaged());

        assert_eq!(safe_mode.record_api_success(), SafeModeEvent::Cleared);
        assert!(!safe_mode.is_engaged());
        assert_eq!(safe_mode.failure_count(), 0);
    }

    #[test]
    fn test_rollback_latch_survives_success() {
        let safe_mode = SafeModeController::default();
        safe_mode.engage(SafeModeReason::RollbackFailed);
        assert!(safe_mode.is_engaged());

        assert_eq!(safe_mode.record_api_success(), SafeModeEvent::None);
        assert!(safe_mode.is_engaged());
        assert_eq!(safe_mode.reason(), Some(SafeModeReason::RollbackFailed));
    }

    #[test]
    fn test_manual_reason_upgrades_api_latch() {
        let safe_mode = SafeModeController::new(1);
        safe_mode.record_api_failure("order");
        assert!(safe_mode.is_engaged());

        safe_mode.engage(SafeModeReason::StartupRecovery);
        assert_eq!(safe_mode.reason(), Some(SafeModeReason::StartupRecovery));
        // no longer auto-clearable
        safe_mode.record_api_success();
        assert!(safe_mode.is_engaged());
    }

    #[test]
    fn test_counter_resets_on_success_before_threshold() {
        let safe_mode = SafeModeController::new(5);
        for _ in 0..4 {
            safe_mode.record_api_failure("ticker");
        }
        safe_mode.record_api_success();
        assert_eq!(safe_mode.failure_count(), 0);
        assert!(!safe_mode.is_engaged());
    }
}
