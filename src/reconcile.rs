//! Startup and periodic reconciliation
//!
//! At startup the durable store is authoritative: incomplete pair
//! reservations block a live-mode start outright, stale pending rows age
//! into execution_failed, and open rows are rehydrated into memory. A
//! failure anywhere in the rebuild latches safe mode so the system can run
//! but will not open new positions. Periodically, execution_unknown rows
//! left by timed-out orders are aged out the same way.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::notify::TelegramNotifier;
use crate::positions::PositionBook;
use crate::safe_mode::{SafeModeController, SafeModeReason};
use crate::store::{PositionUpdate, SqliteStore};
use crate::types::PositionStatus;

/// Pending rows older than this are treated as failed at startup
pub const PENDING_STALE_SECS: i64 = 300;

/// execution_unknown rows older than this resolve to failed
pub const UNKNOWN_STALE_SECS: i64 = 600;

pub struct Reconciler {
    store: Arc<SqliteStore>,
    book: Arc<PositionBook>,
    safe_mode: Arc<SafeModeController>,
    notifier: Arc<TelegramNotifier>,
    clock: Arc<dyn Clock>,
    live_mode: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<SqliteStore>,
        book: Arc<PositionBook>,
        safe_mode: Arc<SafeModeController>,
        notifier: Arc<TelegramNotifier>,
        clock: Arc<dyn Clock>,
        live_mode: bool,
    ) -> Self {
        Reconciler {
            store,
            book,
            safe_mode,
            notifier,
            clock,
            live_mode,
        }
    }

    /// Full startup pass. In live mode an incomplete pair reservation aborts
    /// startup with an operator message; everything else degrades to safe
    /// mode rather than refusing to run.
    pub fn startup(&self) -> Result<()> {
        self.check_incomplete_pairs()?;
        self.restore_pair_positions();
        self.restore_single_positions();
        Ok(())
    }

    fn check_incomplete_pairs(&self) -> Result<()> {
        let incomplete = self.store.recover_incomplete_pairs()?;
        if incomplete.is_empty() {
            info!("no incomplete pair reservations");
            return Ok(());
        }

        let ids: Vec<&str> = incomplete.iter().map(|p| p.pair_id.as_str()).collect();
        if self.live_mode {
            error!("startup refused: {} incomplete pair reservation(s)", incomplete.len());
            bail!(
                "{} incomplete pair position(s) found: {}.\n\
                 Verify both legs on the exchange manually, then delete the \
                 pending rows from pair_positions before restarting.",
                incomplete.len(),
                ids.join(", ")
            );
        }
        warn!(
            "test mode: continuing despite {} incomplete pair reservation(s): {}",
            incomplete.len(),
            ids.join(", ")
        );
        Ok(())
    }

    fn restore_pair_positions(&self) {
        let pairs = match self.store.get_open_pair_positions() {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("pair position restore failed: {}", e);
                self.safe_mode.engage(SafeModeReason::StartupRecovery);
                self.notifier.notify_error(
                    "Startup recovery failed",
                    &format!("Pair positions could not be loaded.\n{}\nRunning in safe mode.", e),
                );
                return;
            }
        };
        if pairs.is_empty() {
            info!("no pair positions to restore");
            return;
        }
        for pair in pairs {
            info!("✓ pair position restored: {}", pair.pair_id);
            self.book.insert_pair(pair);
        }
    }

    fn restore_single_positions(&self) {
        let rows = match self.store.get_open_positions() {
            Ok(rows) => rows,
            Err(e) => {
                error!("position restore failed: {}", e);
                self.safe_mode.engage(SafeModeReason::StartupRecovery);
                self.notifier.notify_error(
                    "Startup recovery failed",
                    &format!("Positions could not be loaded.\n{}\nRunning in safe mode.", e),
                );
                return;
            }
        };

        let now = self.clock.now().timestamp();
        let mut restored = 0usize;
        let mut failed: Vec<String> = Vec::new();

        for position in rows {
            match position.status {
                PositionStatus::PendingExecution => {
                    let age = now - position.entry_time.timestamp();
                    if age > PENDING_STALE_SECS {
                        warn!(
                            "stale pending position aged to failed: {} ({}s old)",
                            position.position_id, age
                        );
                        if let Err(e) = self.store.update_position(
                            &position.position_id,
                            &PositionUpdate::status(PositionStatus::ExecutionFailed),
                        ) {
                            error!("aging write failed for {}: {}", position.position_id, e);
                            failed.push(position.position_id.clone());
                        }
                    } else {
                        // an in-flight attempt may still own this row
                        info!("fresh pending position skipped: {}", position.position_id);
                    }
                }
                PositionStatus::ExecutionFailed | PositionStatus::ExecutionUnknown => {}
                PositionStatus::Open => {
                    restored += 1;
                    self.book.restore_open_position(position);
                }
                PositionStatus::Closed => {}
            }
        }

        if restored > 0 {
            info!("{} open position(s) restored", restored);
        }
        if !failed.is_empty() {
            self.safe_mode.engage(SafeModeReason::StartupRecovery);
            self.notifier.notify_error(
                "Startup recovery failed",
                &format!(
                    "{} position(s) could not be reconciled: {}\n\
                     Running in safe mode; check the exchange manually.",
                    failed.len(),
                    failed.join(", ")
                ),
            );
        }
    }

    /// Periodic pass: resolve execution_unknown rows that never reached a
    /// terminal order status.
    // TODO: query the exchange's order history here once the adapter exposes
    // one, instead of resolving purely by age
    pub fn reconcile_unknown_positions(&self) {
        let unknowns = match self.store.get_positions_by_status(PositionStatus::ExecutionUnknown) {
            Ok(rows) => rows,
            Err(e) => {
                error!("unknown-position query failed: {}", e);
                return;
            }
        };
        if unknowns.is_empty() {
            return;
        }

        info!("reconciling {} execution_unknown position(s)", unknowns.len());
        let now = self.clock.now().timestamp();
        for position in unknowns {
            let age = now - position.entry_time.timestamp();
            if age > UNKNOWN_STALE_SECS {
                warn!(
                    "unknown position aged to failed: {} ({:.1} min old)",
                    position.position_id,
                    age as f64 / 60.0
                );
                if let Err(e) = self.store.update_position(
                    &position.position_id,
                    &PositionUpdate::status(PositionStatus::ExecutionFailed),
                ) {
                    error!("aging write failed for {}: {}", position.position_id, e);
                }
            } else {
                info!(
                    "unknown position still fresh, keeping: {} ({:.1} min old)",
                    position.position_id,
                    age as f64 / 60.0
                );
            }
        }
    }
}
