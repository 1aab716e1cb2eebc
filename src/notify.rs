//! Telegram notifications
//!
//! Fire-and-forget: each notification spawns its own send task, failures are
//! logged and never propagate to the calling operation. A disabled notifier
//! logs at debug so test runs stay quiet.

use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::types::{PairDirection, Side, Symbol};

const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    enabled: bool,
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        let enabled =
            config.enabled && config.bot_token.is_some() && config.chat_id.is_some();
        if !enabled {
            warn!("Telegram notifications disabled (token/chat id not configured)");
        }
        let token = config.bot_token.clone().unwrap_or_default();
        TelegramNotifier {
            enabled,
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", TELEGRAM_BASE_URL, token),
            chat_id: config.chat_id.clone().unwrap_or_default(),
        }
    }

    /// Disabled notifier for tests and test mode
    pub fn disabled() -> Self {
        TelegramNotifier {
            enabled: false,
            client: reqwest::Client::new(),
            url: String::new(),
            chat_id: String::new(),
        }
    }

    /// Queue a message for delivery; never blocks, never fails the caller
    pub fn send(&self, text: String) {
        if !self.enabled {
            debug!("[notify] {}", text.replace('\n', " | "));
            return;
        }
        let client = self.client.clone();
        let url = self.url.clone();
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("telegram notification delivered");
                }
                Ok(resp) => warn!("telegram error status: {}", resp.status()),
                Err(e) => warn!("telegram send failed: {}", e),
            }
        });
    }

    pub fn notify_trade_open(&self, symbol: &Symbol, side: Side, price: f64, quantity: f64) {
        let side_label = match side {
            Side::Long => "🟢 LONG",
            Side::Short => "🔴 SHORT",
        };
        self.send(format!(
            "📈 <b>Trade Opened</b>\n\n{} <b>{}</b>\nPrice: ¥{:.0}\nQty: {:.6}\nNotional: ¥{:.0}",
            side_label,
            symbol,
            price,
            quantity,
            price * quantity
        ));
        info!("trade open notification: {} {}", symbol, side);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notify_trade_close(
        &self,
        symbol: &Symbol,
        side: Side,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        pnl: f64,
        pnl_pct: f64,
    ) {
        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        self.send(format!(
            "{} <b>Trade Closed — {} {}</b>\nEntry: ¥{:.0}  Exit: ¥{:.0}\nQty: {:.6}\nPnL: ¥{:+.0} ({:+.2}%)",
            emoji, side, symbol, entry_price, exit_price, quantity, pnl, pnl_pct
        ));
    }

    pub fn notify_take_profit(&self, symbol: &Symbol, level: u8, close_ratio: f64, pnl_pct: f64) {
        self.send(format!(
            "🎯 <b>Take Profit (stage {})</b>\n\n{}\nClosed: {:.0}%\nUnrealized: {:+.2}%",
            level,
            symbol,
            close_ratio * 100.0,
            pnl_pct
        ));
    }

    pub fn notify_stop_loss(&self, symbol: &Symbol, pnl_pct: f64) {
        self.send(format!(
            "🛑 <b>Stop Loss</b>\n\n{}\nLoss: {:.2}%",
            symbol, pnl_pct
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notify_pair_trade_open(
        &self,
        pair_id: &str,
        symbol1: &Symbol,
        symbol2: &Symbol,
        direction: PairDirection,
        size1: f64,
        size2: f64,
        z_score: f64,
    ) {
        let legs = match direction {
            PairDirection::LongSpread => format!("buy {} / sell {}", symbol1, symbol2),
            PairDirection::ShortSpread => format!("sell {} / buy {}", symbol1, symbol2),
        };
        self.send(format!(
            "🔗 <b>Pair Opened</b>\n\n{}\n{}\nSizes: {:.6} / {:.6}\nz-score: {:.2}",
            pair_id, legs, size1, size2, z_score
        ));
    }

    pub fn notify_pair_trade_close(&self, pair_id: &str, pnl: f64, reason: &str) {
        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        self.send(format!(
            "{} <b>Pair Closed</b>\n\n{}\nPnL: ¥{:+.0}\nReason: {}",
            emoji, pair_id, pnl, reason
        ));
    }

    pub fn notify_daily_summary(
        &self,
        total_pnl: f64,
        daily_pnl: f64,
        trades: i64,
        win_rate: f64,
        open_positions: usize,
    ) {
        self.send(format!(
            "📊 <b>Daily Summary</b>\n\nTotal PnL: ¥{:+.0}\nToday: ¥{:+.0}\nTrades: {}  Win rate: {:.1}%\nOpen positions: {}",
            total_pnl, daily_pnl, trades, win_rate, open_positions
        ));
    }

    /// Distinct alert for events requiring operator action
    pub fn notify_alert(&self, title: &str, message: &str) {
        self.send(format!("🚨 <b>CRITICAL: {}</b>\n\n{}", title, message));
    }

    pub fn notify_error(&self, title: &str, message: &str) {
        self.send(format!("⚠️ <b>{}</b>\n\n{}", title, message));
    }

    pub fn notify_info(&self, title: &str, message: &str) {
        self.send(format!("ℹ️ <b>{}</b>\n\n{}", title, message));
    }
}
