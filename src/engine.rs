//! Trading engine and main loop
//!
//! One cooperative cycle: auto-resume check, trend strategy per symbol, the
//! cointegration pass, then maintenance on fixed cadences and time-driven
//! reports. API-shaped errors back off exponentially and stop the system
//! after a bounded streak; everything else is logged, notified, and skipped.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bot::BotHandler;
use crate::clock::Clock;
use crate::config::{Config, ReportingConfig};
use crate::error::ExchangeError;
use crate::exchange::ExchangeApi;
use crate::executor::OrderExecutor;
use crate::notify::TelegramNotifier;
use crate::pairs::PairExecutor;
use crate::positions::PositionBook;
use crate::reconcile::Reconciler;
use crate::report::ReportGenerator;
use crate::risk::RiskController;
use crate::safe_mode::SafeModeController;
use crate::signals::{CointegrationProvider, SignalProvider, TradeSignal};
use crate::store::SqliteStore;
use crate::types::{PairPosition, Side, Symbol};

/// Cycles between periodic execution_unknown reconciliation
pub const POSITION_RECONCILE_CYCLES: u32 = 10;

/// Cycles between WAL checkpoints
pub const WAL_CHECKPOINT_CYCLES: u32 = 20;

/// Cycles between durable-store connection refreshes
pub const DB_CONNECTION_REFRESH_CYCLES: u32 = 100;

/// Consecutive API-shaped cycle errors before a clean stop
pub const MAX_CONSECUTIVE_API_ERRORS: u32 = 10;

/// Recovery sleep after a non-API cycle error
pub const ERROR_RECOVERY_WAIT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Morning,
    Noon,
    Evening,
    Weekly,
    Monthly,
}

/// Tracks which time-driven reports have fired today so each dispatches at
/// most once when the wall clock crosses its configured point
#[derive(Debug)]
pub struct ReportSchedule {
    cfg: ReportingConfig,
    sent: HashMap<&'static str, NaiveDate>,
}

impl ReportSchedule {
    pub fn new(cfg: ReportingConfig) -> Self {
        ReportSchedule {
            cfg,
            sent: HashMap::new(),
        }
    }

    /// Reports due at `now`, each marked sent for today
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<ReportKind> {
        let today = now.date_naive();
        let time = now.format("%H:%M").to_string();
        let mut due = Vec::new();

        let daily = [
            (ReportKind::Morning, "morning", self.cfg.morning_report_time.clone()),
            (ReportKind::Noon, "noon", self.cfg.noon_report_time.clone()),
            (ReportKind::Evening, "evening", self.cfg.evening_report_time.clone()),
        ];
        for (kind, key, at) in daily {
            if time >= at && self.sent.get(key) != Some(&today) {
                self.sent.insert(key, today);
                due.push(kind);
            }
        }

        if now.weekday().num_days_from_monday() == self.cfg.weekly_report_day
            && time >= self.cfg.weekly_report_time
            && self.sent.get("weekly") != Some(&today)
        {
            self.sent.insert("weekly", today);
            due.push(ReportKind::Weekly);
        }

        // month end: tomorrow is the 1st
        let is_last_day = (now + ChronoDuration::days(1)).day() == 1;
        if is_last_day
            && time >= self.cfg.monthly_report_time
            && self.sent.get("monthly") != Some(&today)
        {
            self.sent.insert("monthly", today);
            due.push(ReportKind::Monthly);
        }

        due
    }
}

#[derive(Debug, Clone, Copy)]
enum StrategyKind {
    Trend,
    Cointegration,
}

pub struct CryptoTrader {
    config: Config,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<SqliteStore>,
    book: Arc<PositionBook>,
    risk: Arc<RiskController>,
    safe_mode: Arc<SafeModeController>,
    notifier: Arc<TelegramNotifier>,
    executor: OrderExecutor,
    pair_executor: PairExecutor,
    reconciler: Reconciler,
    reporter: ReportGenerator,
    bot: Option<Arc<BotHandler>>,
    signal_provider: Box<dyn SignalProvider>,
    cointegration: Box<dyn CointegrationProvider>,
    clock: Arc<dyn Clock>,
    report_schedule: ReportSchedule,
    cycle_count: u32,
    last_health_check: DateTime<Utc>,
    is_running: bool,
}

impl CryptoTrader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<SqliteStore>,
        signal_provider: Box<dyn SignalProvider>,
        cointegration: Box<dyn CointegrationProvider>,
        clock: Arc<dyn Clock>,
        live_mode: bool,
    ) -> Self {
        let commission = config.exchange.commission_rate;
        let notifier = Arc::new(TelegramNotifier::new(&config.telegram));
        let safe_mode = Arc::new(SafeModeController::default());
        let book = Arc::new(PositionBook::new(store.clone(), commission));
        let risk = Arc::new(RiskController::new(
            config.risk_management.clone(),
            config.trading.initial_capital,
            config.trading.min_confidence,
            clock.clone(),
        ));
        let order_lock = Arc::new(tokio::sync::Mutex::new(()));

        let executor = OrderExecutor::new(
            exchange.clone(),
            book.clone(),
            risk.clone(),
            safe_mode.clone(),
            notifier.clone(),
            clock.clone(),
            order_lock.clone(),
        );
        let pair_executor = PairExecutor::new(
            exchange.clone(),
            book.clone(),
            store.clone(),
            risk.clone(),
            safe_mode.clone(),
            notifier.clone(),
            clock.clone(),
            order_lock,
            config.pair_trading.clone(),
            commission,
        );
        let reconciler = Reconciler::new(
            store.clone(),
            book.clone(),
            safe_mode.clone(),
            notifier.clone(),
            clock.clone(),
            live_mode,
        );
        let reporter = ReportGenerator::new(store.clone());
        let bot = config_path.map(|path| {
            Arc::new(BotHandler::new(
                config.clone(),
                path,
                risk.clone(),
                book.clone(),
                safe_mode.clone(),
            ))
        });
        let report_schedule = ReportSchedule::new(config.reporting.clone());
        let now = clock.now();

        CryptoTrader {
            config,
            exchange,
            store,
            book,
            risk,
            safe_mode,
            notifier,
            executor,
            pair_executor,
            reconciler,
            reporter,
            bot,
            signal_provider,
            cointegration,
            clock,
            report_schedule,
            cycle_count: 0,
            last_health_check: now,
            is_running: false,
        }
    }

    /// Startup reconciliation; refuses a live start over incomplete pairs
    pub fn initialize(&self) -> Result<()> {
        info!("reconciling durable state...");
        self.reconciler.startup()
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    pub fn risk(&self) -> &Arc<RiskController> {
        &self.risk
    }

    pub fn safe_mode(&self) -> &Arc<SafeModeController> {
        &self.safe_mode
    }

    // ==================== capital ====================

    async fn available_capital(&self, strategy: StrategyKind) -> Result<f64> {
        let balance = match self.exchange.fetch_balance("JPY").await {
            Ok(b) => {
                self.safe_mode.record_api_success();
                b
            }
            Err(e) => {
                self.safe_mode.record_api_failure("balance fetch");
                return Err(e.into());
            }
        };
        if balance.free <= 0.0 {
            return Ok(0.0);
        }
        let ratio = match strategy {
            StrategyKind::Trend => self.config.strategy_allocation.trend_ratio,
            StrategyKind::Cointegration => self.config.strategy_allocation.cointegration_ratio,
        };
        Ok(balance.free * ratio)
    }

    async fn fetch_price(&self, symbol: &Symbol) -> Option<f64> {
        match self.exchange.get_current_price(symbol).await {
            Ok(price) if price > 0.0 => {
                self.safe_mode.record_api_success();
                Some(price)
            }
            Ok(price) => {
                warn!("{} returned non-positive price {}", symbol, price);
                None
            }
            Err(e) => {
                self.safe_mode.record_api_failure(&format!("{} ticker", symbol));
                warn!("{} price fetch failed: {}", symbol, e);
                None
            }
        }
    }

    // ==================== cycle ====================

    pub async fn run_trading_cycle(&mut self) -> Result<()> {
        info!("━━━ trading cycle {} ━━━", self.cycle_count + 1);

        if self.risk.check_auto_resume() {
            self.notifier.notify_info(
                "Trading auto-resumed",
                "The pause window elapsed; trading resumed automatically.",
            );
        }

        if self.config.strategy_allocation.trend_ratio > 0.0 {
            self.run_trend_strategy().await?;
        } else {
            debug!("trend strategy disabled (allocation 0)");
        }

        if self.config.strategy_allocation.cointegration_ratio > 0.0 {
            self.run_cointegration_strategy().await?;
        } else {
            debug!("cointegration strategy disabled (allocation 0)");
        }

        Ok(())
    }

    async fn run_trend_strategy(&mut self) -> Result<()> {
        info!("[trend] processing {} symbol(s)", self.config.trading.pairs.len());
        let pairs = self.config.trading.pairs.clone();

        for pair_cfg in pairs {
            let symbol = Symbol::new(&pair_cfg.symbol);
            let Some(decision) = self.signal_provider.signal(&symbol) else {
                debug!("{} no decision this cycle", symbol);
                continue;
            };
            let Some(price) = self.fetch_price(&symbol).await else {
                continue;
            };

            if self.book.get(&symbol).is_some() {
                self.executor.manage_existing(&symbol, price).await?;
                continue;
            }

            let side = match decision.signal {
                TradeSignal::Buy => Side::Long,
                TradeSignal::Sell => Side::Short,
                TradeSignal::Hold => {
                    debug!("{} HOLD", symbol);
                    continue;
                }
            };
            let capital = self.available_capital(StrategyKind::Trend).await? * pair_cfg.allocation;
            if capital <= 0.0 {
                debug!("{} no capital available", symbol);
                continue;
            }
            self.executor
                .enter(&symbol, side, price, decision.confidence, capital)
                .await?;
        }
        Ok(())
    }

    async fn run_cointegration_strategy(&mut self) -> Result<()> {
        info!("[cointegration] processing");

        let mut prices = HashMap::new();
        for pair_cfg in &self.config.trading.pairs {
            let symbol = Symbol::new(&pair_cfg.symbol);
            if let Some(price) = self.fetch_price(&symbol).await {
                prices.insert(symbol, price);
            }
        }
        if prices.len() < 2 {
            warn!("[cointegration] insufficient price data ({} symbols)", prices.len());
            return Ok(());
        }

        self.cointegration.update_cointegration(&prices);
        let signals = self.cointegration.generate_signals(&prices);
        self.pair_executor.update_unrealized(&prices);

        // exits first so freed slots are available to entries
        for pair in self.book.open_pairs() {
            let Some(signal) = signals.get(&pair.pair_id) else { continue };
            if let Some(reason) = self.pair_executor.should_exit(signal, &pair) {
                let (Some(p1), Some(p2)) =
                    (prices.get(&pair.symbol1), prices.get(&pair.symbol2))
                else {
                    continue;
                };
                self.pair_executor
                    .close_pair(&pair.pair_id, *p1, *p2, &reason)
                    .await?;
            }
        }

        for (symbol1, symbol2) in self.cointegration.tradable_pairs() {
            let pair_id = PairPosition::pair_id_for(&symbol1, &symbol2);
            let Some(signal) = signals.get(&pair_id) else { continue };
            if !self.pair_executor.should_enter(signal, &pair_id) {
                continue;
            }
            let (Some(p1), Some(p2)) = (prices.get(&symbol1), prices.get(&symbol2)) else {
                continue;
            };
            let capital = self.available_capital(StrategyKind::Cointegration).await?;
            if capital <= 0.0 {
                continue;
            }
            self.pair_executor
                .open_pair(&symbol1, &symbol2, signal, *p1, *p2, capital)
                .await?;
        }
        Ok(())
    }

    // ==================== maintenance & reports ====================

    fn run_maintenance(&mut self) {
        if self.cycle_count % POSITION_RECONCILE_CYCLES == 0 {
            self.reconciler.reconcile_unknown_positions();
        }
        if self.cycle_count % WAL_CHECKPOINT_CYCLES == 0 {
            info!("[maintenance] WAL checkpoint");
            if let Err(e) = self.store.checkpoint_wal() {
                warn!("WAL checkpoint failed: {}", e);
            }
        }
        if self.cycle_count % DB_CONNECTION_REFRESH_CYCLES == 0 {
            info!("[maintenance] refreshing store connection");
            self.store.close_all_connections();
        }

        let now = self.clock.now();
        if now - self.last_health_check > ChronoDuration::hours(1) {
            self.health_check();
            self.last_health_check = now;
        }

        if self.cycle_count % 10 == 0 {
            match self.reporter.summary_stats() {
                Ok(stats) => info!(
                    "[performance] trades={} win_rate={:.1}% pnl={:+.0}",
                    stats.total_trades, stats.win_rate, stats.total_pnl
                ),
                Err(e) => warn!("performance summary failed: {}", e),
            }
        }
    }

    fn health_check(&self) {
        info!("[health] periodic check");
        if let Err(e) = self.store.ping() {
            error!("[health] store unreachable: {}", e);
            self.notifier
                .notify_error("Health check failed", &format!("Durable store unreachable: {}", e));
        }
        info!(
            "[health] positions={} pairs={} safe_mode={} api_failures={}",
            self.book.open_count(),
            self.book.pair_count(),
            self.safe_mode.is_engaged(),
            self.safe_mode.failure_count(),
        );
    }

    fn dispatch_reports(&mut self) {
        let due = self.report_schedule.due(self.clock.now());
        for kind in due {
            let result = match kind {
                ReportKind::Morning | ReportKind::Noon | ReportKind::Evening => {
                    self.send_daily_report()
                }
                ReportKind::Weekly => self.reporter.weekly_report().map(|r| self.notifier.send(r)),
                ReportKind::Monthly => {
                    self.reporter.monthly_report().map(|r| self.notifier.send(r))
                }
            };
            if let Err(e) = result {
                warn!("report dispatch failed ({:?}): {}", kind, e);
            }
        }
    }

    fn send_daily_report(&self) -> Result<(), crate::error::StorageError> {
        let stats = self.reporter.summary_stats()?;
        self.notifier.notify_daily_summary(
            stats.total_pnl,
            stats.today_pnl,
            stats.today_trades,
            stats.win_rate,
            self.book.open_count(),
        );
        let text = self.reporter.daily_report(&self.book.all_open())?;
        self.notifier.send(text);
        Ok(())
    }

    // ==================== lifecycle ====================

    /// Main loop. Runs until `stop()` is observed or a shutdown message
    /// arrives on the channel.
    pub async fn start(
        &mut self,
        interval_minutes: u64,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("══════════════════════════════════════════════════");
        info!(" crypto-trader starting");
        info!(" symbols: {}", self.config.trading.pairs.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>().join(", "));
        info!(" capital: ¥{:.0}", self.config.trading.initial_capital);
        info!(" cycle interval: {} minute(s)", interval_minutes);
        info!("══════════════════════════════════════════════════");

        let bot_handle = self.bot.clone().and_then(|bot| bot.spawn());

        self.is_running = true;
        let mut consecutive_api_errors: u32 = 0;

        while self.is_running {
            match self.run_trading_cycle().await {
                Ok(()) => {
                    self.cycle_count += 1;
                    if consecutive_api_errors > 0 {
                        info!("cycle succeeded, API error streak reset ({})", consecutive_api_errors);
                        consecutive_api_errors = 0;
                    }
                    self.run_maintenance();
                    self.dispatch_reports();
                }
                Err(e) if is_api_error(&e) => {
                    consecutive_api_errors += 1;
                    error!(
                        "API error in cycle ({}/{}): {:#}",
                        consecutive_api_errors, MAX_CONSECUTIVE_API_ERRORS, e
                    );
                    if consecutive_api_errors >= MAX_CONSECUTIVE_API_ERRORS {
                        let msg = format!(
                            "{} consecutive API errors; shutting down cleanly.\nLast error: {:#}",
                            consecutive_api_errors, e
                        );
                        error!("{}", msg);
                        self.notifier.notify_alert("Emergency stop: API failures", &msg);
                        break;
                    }
                    let wait = 2u64.saturating_pow(consecutive_api_errors).min(300);
                    warn!("backing off {}s before next cycle", wait);
                    sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                Err(e) => {
                    error!("cycle error: {:#}", e);
                    self.notifier.notify_error("Trading cycle error", &format!("{:#}", e));
                    sleep(Duration::from_secs(ERROR_RECOVERY_WAIT_SECS)).await;
                    continue;
                }
            }

            debug!("sleeping {} minute(s) until next cycle", interval_minutes);
            tokio::select! {
                _ = sleep(Duration::from_secs(interval_minutes * 60)) => {}
                _ = shutdown.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.stop();
        if let Some(handle) = bot_handle {
            handle.abort();
        }
        Ok(())
    }

    /// Final report and resource teardown
    pub fn stop(&mut self) {
        if !self.is_running {
            return;
        }
        info!("crypto-trader stopping...");
        self.is_running = false;
        if let Some(bot) = &self.bot {
            bot.stop();
        }
        if let Err(e) = self.send_daily_report() {
            warn!("final report failed: {}", e);
        }
        self.store.close_all_connections();
        info!("crypto-trader stopped");
    }
}

/// API-shaped errors drive the bounded-backoff branch of the loop
fn is_api_error(err: &anyhow::Error) -> bool {
    if err.chain().any(|c| c.downcast_ref::<ExchangeError>().is_some()) {
        return true;
    }
    let text = format!("{:#}", err).to_lowercase();
    ["api", "network", "connection", "timeout", "request"]
        .iter()
        .any(|kw| text.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule() -> ReportSchedule {
        ReportSchedule::new(ReportingConfig::default())
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_morning_report_fires_once_per_day() {
        let mut schedule = schedule();
        // before 07:00: nothing
        assert!(schedule.due(at(2024, 3, 5, 6, 59)).is_empty());
        // crossing 07:00 fires morning
        assert_eq!(schedule.due(at(2024, 3, 5, 7, 1)), vec![ReportKind::Morning]);
        // later the same day: no repeat
        assert!(schedule.due(at(2024, 3, 5, 8, 0)).is_empty());
        // next day fires again
        assert_eq!(schedule.due(at(2024, 3, 6, 7, 30)), vec![ReportKind::Morning]);
    }

    #[test]
    fn test_evening_includes_weekly_on_monday() {
        let mut schedule = schedule();
        // 2024-03-04 is a Monday; 22:00 triggers evening + weekly
        let due = schedule.due(at(2024, 3, 4, 22, 0));
        assert!(due.contains(&ReportKind::Evening));
        assert!(due.contains(&ReportKind::Weekly));

        // Tuesday evening has no weekly
        let due = schedule.due(at(2024, 3, 5, 22, 0));
        assert!(due.contains(&ReportKind::Evening));
        assert!(!due.contains(&ReportKind::Weekly));
    }

    #[test]
    fn test_monthly_fires_on_last_day() {
        let mut schedule = schedule();
        let due = schedule.due(at(2024, 3, 31, 22, 5));
        assert!(due.contains(&ReportKind::Monthly));

        let mut schedule = ReportSchedule::new(ReportingConfig::default());
        let due = schedule.due(at(2024, 3, 30, 22, 5));
        assert!(!due.contains(&ReportKind::Monthly));
    }

    #[test]
    fn test_late_start_fires_all_elapsed_daily_reports() {
        let mut schedule = schedule();
        let due = schedule.due(at(2024, 3, 5, 23, 0));
        assert_eq!(
            due,
            vec![ReportKind::Morning, ReportKind::Noon, ReportKind::Evening]
        );
    }

    #[test]
    fn test_is_api_error_classification() {
        let api: anyhow::Error = ExchangeError::Network("down".into()).into();
        assert!(is_api_error(&api));

        let wrapped = api.context("entering BTC/JPY");
        assert!(is_api_error(&wrapped));

        let other = anyhow::anyhow!("division by zero");
        assert!(!is_api_error(&other));
    }
}
