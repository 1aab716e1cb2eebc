//! Telegram bot command interface
//!
//! A background task long-polls getUpdates and answers a small command set,
//! authenticated by an allowlist of chat ids. Command handling itself is
//! synchronous; no engine lock is ever held across an await on the Telegram
//! API.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::positions::PositionBook;
use crate::risk::RiskController;
use crate::safe_mode::SafeModeController;

const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// Accepted range for set_stop_loss, tighter than the config clamp
const STOP_LOSS_MIN: f64 = 1.0;
const STOP_LOSS_MAX: f64 = 30.0;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

pub struct BotHandler {
    client: reqwest::Client,
    token: Option<String>,
    allowed_chat_ids: Vec<i64>,
    risk: Arc<RiskController>,
    book: Arc<PositionBook>,
    safe_mode: Arc<SafeModeController>,
    config: Mutex<Config>,
    config_path: PathBuf,
    running: Arc<AtomicBool>,
}

impl BotHandler {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        risk: Arc<RiskController>,
        book: Arc<PositionBook>,
        safe_mode: Arc<SafeModeController>,
    ) -> Self {
        let token = config.telegram.bot_token.clone().filter(|_| config.telegram.enabled);
        let allowed_chat_ids = config
            .telegram
            .chat_id
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        BotHandler {
            client: reqwest::Client::new(),
            token,
            allowed_chat_ids,
            risk,
            book,
            safe_mode,
            config: Mutex::new(config),
            config_path,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the long-poll loop. Returns None when the bot is not configured.
    pub fn spawn(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let token = self.token.clone()?;
        self.running.store(true, Ordering::SeqCst);
        info!("bot command interface started ({} allowed chat id(s))", self.allowed_chat_ids.len());

        let handle = tokio::spawn(async move {
            let mut offset: i64 = 0;
            while self.running.load(Ordering::SeqCst) {
                let url = format!(
                    "{}/bot{}/getUpdates?timeout=30&offset={}",
                    TELEGRAM_BASE_URL, token, offset
                );
                let response = match self.client.get(&url).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("bot poll failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                        continue;
                    }
                };
                let updates: UpdatesResponse = match response.json().await {
                    Ok(u) => u,
                    Err(e) => {
                        warn!("bot poll parse failed: {}", e);
                        continue;
                    }
                };
                if !updates.ok {
                    warn!("getUpdates returned not-ok");
                    continue;
                }

                for update in updates.result {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.message else { continue };
                    let Some(text) = message.text else { continue };

                    if !self.is_allowed(message.chat.id) {
                        warn!("command from unauthorized chat {} ignored", message.chat.id);
                        continue;
                    }
                    debug!("bot command: {}", text);
                    let reply = self.handle_command(text.trim());
                    self.send_reply(&token, message.chat.id, &reply).await;
                }
            }
            info!("bot command interface stopped");
        });
        Some(handle)
    }

    fn is_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chat_ids.contains(&chat_id)
    }

    async fn send_reply(&self, token: &str, chat_id: i64, text: &str) {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_BASE_URL, token);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Err(e) = self.client.post(&url).json(&body).send().await {
            warn!("bot reply failed: {}", e);
        }
    }

    /// Dispatch one command line to its handler
    pub fn handle_command(&self, text: &str) -> String {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("");
        match command {
            "/status" => self.cmd_status(),
            "/positions" => self.cmd_positions(),
            "/config" => self.cmd_config(),
            "/pause" => {
                self.risk.pause("paused by operator command");
                "⏸ Trading paused. Use /resume to continue.".to_string()
            }
            "/resume" => {
                self.risk.resume();
                "▶️ Trading resumed; consecutive losses reset.".to_string()
            }
            "/set_stop_loss" => self.cmd_set_stop_loss(parts.next()),
            "/help" | "/commands" => Self::cmd_help(),
            _ => format!("Unknown command: {}\n\n{}", command, Self::cmd_help()),
        }
    }

    fn cmd_status(&self) -> String {
        let snapshot = self.risk.snapshot();
        let safe_mode = match self.safe_mode.reason() {
            Some(reason) => format!("engaged ({})", reason),
            None => "off".to_string(),
        };
        let paused = match snapshot.pause_reason {
            Some(reason) => format!("paused ({})", reason),
            None => "active".to_string(),
        };
        format!(
            "📡 <b>Status</b>\n\
             Trading: {}\n\
             Safe mode: {}\n\
             Open positions: {}  Pairs: {}\n\
             Consecutive losses: {}\n\
             Drawdown: {:.2}%\n\
             PnL today/week/month: ¥{:+.0} / ¥{:+.0} / ¥{:+.0}",
            paused,
            safe_mode,
            self.book.open_count(),
            self.book.pair_count(),
            snapshot.consecutive_losses,
            snapshot.drawdown_pct,
            snapshot.daily_pnl,
            snapshot.weekly_pnl,
            snapshot.monthly_pnl,
        )
    }

    fn cmd_positions(&self) -> String {
        let singles = self.book.all_open();
        let pairs = self.book.open_pairs();
        if singles.is_empty() && pairs.is_empty() {
            return "No open positions.".to_string();
        }
        let mut lines = vec!["📊 <b>Positions</b>".to_string()];
        for p in singles {
            lines.push(format!(
                "{} {} {:.6} @ ¥{:.0}",
                p.symbol, p.side, p.quantity, p.entry_price
            ));
        }
        for pair in pairs {
            lines.push(format!(
                "{} ({}) pnl ¥{:+.0}",
                pair.pair_id,
                pair.direction.as_str(),
                pair.unrealized_pnl
            ));
        }
        lines.join("\n")
    }

    fn cmd_config(&self) -> String {
        let config = self.config.lock().unwrap();
        format!(
            "⚙️ <b>Config</b>\n\
             Capital: ¥{:.0}\n\
             Min confidence: {:.2}\n\
             Stop loss: {:.1}%\n\
             Take profit: {:.0}% / {:.0}%\n\
             Max positions: {}\n\
             Max drawdown: {:.0}%\n\
             Allocation trend/coint: {:.0}%/{:.0}%",
            config.trading.initial_capital,
            config.trading.min_confidence,
            self.risk.stop_loss_pct(),
            config.risk_management.take_profit_first,
            config.risk_management.take_profit_second,
            config.risk_management.max_positions,
            config.risk_management.max_drawdown_pct,
            config.strategy_allocation.trend_ratio * 100.0,
            config.strategy_allocation.cointegration_ratio * 100.0,
        )
    }

    fn cmd_set_stop_loss(&self, arg: Option<&str>) -> String {
        let Some(raw) = arg else {
            return "Usage: /set_stop_loss <percent> (1.0 - 30.0)".to_string();
        };
        let Ok(value) = raw.parse::<f64>() else {
            return format!("Not a number: {}", raw);
        };
        if !(STOP_LOSS_MIN..=STOP_LOSS_MAX).contains(&value) {
            return format!(
                "Stop loss must be within {:.1} - {:.1}%, got {}",
                STOP_LOSS_MIN, STOP_LOSS_MAX, value
            );
        }

        self.risk.set_stop_loss_pct(value);
        let result = {
            let mut config = self.config.lock().unwrap();
            config.risk_management.stop_loss_pct = value;
            config.save_with_backup(&self.config_path)
        };
        match result {
            Ok(()) => format!("✅ Stop loss set to {:.1}% (config saved with backup)", value),
            Err(e) => format!(
                "⚠️ Stop loss set to {:.1}% live, but the config write failed: {}",
                value, e
            ),
        }
    }

    fn cmd_help() -> String {
        "Available commands:\n\
         /status - trading state, safe mode, risk counters\n\
         /positions - open positions and pairs\n\
         /config - key configuration values\n\
         /pause - pause new entries\n\
         /resume - resume trading, reset loss streak\n\
         /set_stop_loss <pct> - update stop loss (1.0 - 30.0)\n\
         /help - this message"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::SqliteStore;

    fn handler() -> (BotHandler, PathBuf) {
        static SEQ: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "crypto-trader-bot-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.json");

        let config: Config = serde_json::from_str(
            r#"{
                "trading": {
                    "pairs": [{"symbol": "BTC/JPY"}],
                    "initial_capital": 200000
                },
                "risk_management": {},
                "telegram": {"bot_token": "t", "chat_id": "12345", "enabled": true}
            }"#,
        )
        .unwrap();
        config.save_with_backup(&config_path).unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let book = Arc::new(PositionBook::new(store, 0.0015));
        let risk = Arc::new(RiskController::new(
            config.risk_management.clone(),
            config.trading.initial_capital,
            config.trading.min_confidence,
            Arc::new(SystemClock),
        ));
        let bot = BotHandler::new(
            config,
            config_path.clone(),
            risk,
            book,
            Arc::new(SafeModeController::default()),
        );
        (bot, config_path)
    }

    #[test]
    fn test_allowlist() {
        let (bot, _) = handler();
        assert!(bot.is_allowed(12345));
        assert!(!bot.is_allowed(99999));
    }

    #[test]
    fn test_pause_resume_commands() {
        let (bot, _) = handler();
        bot.handle_command("/pause");
        assert!(bot.risk.is_paused().is_some());

        let reply = bot.handle_command("/status");
        assert!(reply.contains("paused"));

        bot.handle_command("/resume");
        assert!(bot.risk.is_paused().is_none());
    }

    #[test]
    fn test_set_stop_loss_validation() {
        let (bot, _) = handler();
        let reply = bot.handle_command("/set_stop_loss 45");
        assert!(reply.contains("must be within"));

        let reply = bot.handle_command("/set_stop_loss abc");
        assert!(reply.contains("Not a number"));

        let reply = bot.handle_command("/set_stop_loss");
        assert!(reply.contains("Usage"));
    }

    #[test]
    fn test_set_stop_loss_round_trip() {
        let (bot, config_path) = handler();
        let reply = bot.handle_command("/set_stop_loss 12.5");
        assert!(reply.contains("12.5"));
        assert!((bot.risk.stop_loss_pct() - 12.5).abs() < 1e-9);

        let contents = std::fs::read_to_string(&config_path).unwrap();
        let reloaded: Config = serde_json::from_str(&contents).unwrap();
        assert!((reloaded.risk_management.stop_loss_pct - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_command_shows_help() {
        let (bot, _) = handler();
        let reply = bot.handle_command("/frobnicate");
        assert!(reply.contains("Unknown command"));
        assert!(reply.contains("/status"));
    }
}
