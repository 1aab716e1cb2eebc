//! Summary reports over the durable store
//!
//! The loop dispatches these on its configured schedule; rendering is kept
//! to plain text blocks the notifier can forward as-is.

use std::sync::Arc;

use crate::error::StorageError;
use crate::store::SqliteStore;
use crate::types::Position;

#[derive(Debug, Clone, Default)]
pub struct SummaryStats {
    pub total_trades: i64,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub today_pnl: f64,
    pub today_trades: i64,
}

pub struct ReportGenerator {
    store: Arc<SqliteStore>,
}

impl ReportGenerator {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        ReportGenerator { store }
    }

    pub fn summary_stats(&self) -> Result<SummaryStats, StorageError> {
        let stats = self.store.trade_stats()?;
        let win_rate = if stats.total_trades > 0 {
            stats.winning_trades as f64 / stats.total_trades as f64 * 100.0
        } else {
            0.0
        };
        let today_key = chrono::Utc::now().date_naive().to_string();
        let today = self
            .store
            .daily_pnl(1)?
            .into_iter()
            .find(|d| d.day == today_key);
        Ok(SummaryStats {
            total_trades: stats.total_trades,
            win_rate,
            total_pnl: stats.total_pnl,
            today_pnl: today.as_ref().map(|d| d.pnl).unwrap_or(0.0),
            today_trades: today.map(|d| d.trades).unwrap_or(0),
        })
    }

    pub fn daily_report(&self, open_positions: &[Position]) -> Result<String, StorageError> {
        let stats = self.summary_stats()?;
        let mut lines = vec![
            "📋 Daily Report".to_string(),
            format!("Today: ¥{:+.0} over {} trade(s)", stats.today_pnl, stats.today_trades),
            format!(
                "All-time: ¥{:+.0} over {} trade(s), win rate {:.1}%",
                stats.total_pnl, stats.total_trades, stats.win_rate
            ),
        ];
        if open_positions.is_empty() {
            lines.push("No open positions".to_string());
        } else {
            lines.push(format!("Open positions ({}):", open_positions.len()));
            for p in open_positions {
                lines.push(format!(
                    "  {} {} {:.6} @ ¥{:.0}",
                    p.symbol, p.side, p.quantity, p.entry_price
                ));
            }
        }
        Ok(lines.join("\n"))
    }

    pub fn weekly_report(&self) -> Result<String, StorageError> {
        self.period_report("📅 Weekly Report", 7)
    }

    pub fn monthly_report(&self) -> Result<String, StorageError> {
        self.period_report("🗓 Monthly Report", 31)
    }

    fn period_report(&self, title: &str, days: u32) -> Result<String, StorageError> {
        let daily = self.store.daily_pnl(days)?;
        let total: f64 = daily.iter().map(|d| d.pnl).sum();
        let trades: i64 = daily.iter().map(|d| d.trades).sum();

        let mut lines = vec![
            title.to_string(),
            format!("PnL: ¥{:+.0} over {} trade(s) in {} day(s)", total, trades, daily.len()),
        ];
        for day in daily.iter().take(10) {
            lines.push(format!("  {}: ¥{:+.0} ({} trades)", day.day, day.pnl, day.trades));
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol, TradeRecord};
    use chrono::Utc;

    #[test]
    fn test_summary_stats() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let symbol = Symbol::new("BTC/JPY");
        for pnl in [1_000.0, -400.0, 200.0] {
            let trade = TradeRecord::fill(
                "P1",
                &symbol,
                Side::Long,
                12_000_000.0,
                0.001,
                18.0,
                pnl,
                Utc::now(),
            );
            store.insert_trade(&trade).unwrap();
        }

        let reporter = ReportGenerator::new(store);
        let stats = reporter.summary_stats().unwrap();
        assert_eq!(stats.total_trades, 3);
        assert!((stats.total_pnl - 800.0).abs() < 1e-9);
        assert!((stats.win_rate - 2.0 / 3.0 * 100.0).abs() < 1e-9);
        assert_eq!(stats.today_trades, 3);
    }

    #[test]
    fn test_daily_report_lists_positions() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let reporter = ReportGenerator::new(store);
        let position = crate::types::Position::new(
            Symbol::new("BTC/JPY"),
            Side::Long,
            12_000_000.0,
            0.01,
            Utc::now(),
        );
        let text = reporter.daily_report(std::slice::from_ref(&position)).unwrap();
        assert!(text.contains("BTC/JPY"));
        assert!(text.contains("Open positions (1)"));
    }
}
