/// notifier.rs – Telegram alerts and the chat command surface.
///
/// Alerts are fire-and-forget with payload deduplication: identical texts
/// inside the configured window are suppressed. The command poller accepts
/// `status`, `pnl`, `kill <token>`, `pause <strategy>` and `resume
/// <strategy>`; kill requires the configured confirmation token. Everything
/// degrades to a no-op when credentials are missing.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Timelike, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::database::Database;
use crate::models::StrategyId;
use crate::pnl::PnlTracker;
use crate::risk::KillSwitch;

/// Operator commands routed to the control loop.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Kill { reason: String },
    Pause(StrategyId),
    Resume(StrategyId),
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub struct Notifier {
    enabled: bool,
    http: Client,
    api_base: String,
    chat_id: String,
    dedup_window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(settings: &Settings) -> Self {
        let token = settings.telegram_bot_token.expose();
        let enabled = !token.is_empty() && !settings.telegram.chat_id.is_empty();
        if !enabled {
            info!("telegram disabled: missing bot token or chat id");
        }
        Self {
            enabled,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_base: format!("https://api.telegram.org/bot{token}"),
            chat_id: settings.telegram.chat_id.clone(),
            dedup_window: Duration::from_secs(settings.telegram.dedup_window_secs),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Send an alert, suppressing identical payloads inside the dedup window.
    pub async fn alert(&self, text: &str) {
        if !self.enabled {
            debug!(alert = text, "telegram disabled, alert dropped");
            return;
        }
        if self.is_duplicate(text).await {
            debug!("duplicate alert suppressed");
            return;
        }
        self.send(text).await;
    }

    /// Critical alerts skip deduplication.
    pub async fn alert_critical(&self, text: &str) {
        if !self.enabled {
            warn!(alert = text, "telegram disabled, critical alert dropped");
            return;
        }
        self.send(&format!("CRITICAL: {text}")).await;
    }

    async fn is_duplicate(&self, text: &str) -> bool {
        let mut recent = self.recent.lock().await;
        let now = Instant::now();
        recent.retain(|_, sent| now.duration_since(*sent) < self.dedup_window);
        match recent.get(text) {
            Some(_) => true,
            None => {
                recent.insert(text.to_string(), now);
                false
            }
        }
    }

    async fn send(&self, text: &str) {
        let payload = json!({ "chat_id": self.chat_id, "text": text });
        let result = self
            .http
            .post(format!("{}/sendMessage", self.api_base))
            .json(&payload)
            .send()
            .await;
        if let Err(e) = result {
            warn!("telegram send failed: {e}");
        }
    }

    async fn reply(&self, text: &str) {
        if self.enabled {
            self.send(text).await;
        }
    }

    // ------------------------------------------------------------------
    // Command poller
    // ------------------------------------------------------------------

    /// Long-poll getUpdates and dispatch operator commands. Read-only
    /// queries are answered inline; state-changing commands go through the
    /// control channel.
    pub async fn run_command_loop(
        self: Arc<Self>,
        settings: Settings,
        pnl: Arc<PnlTracker>,
        db: Arc<Database>,
        kill: Arc<KillSwitch>,
        control_tx: mpsc::Sender<ControlCommand>,
    ) {
        if !self.enabled {
            return;
        }
        let mut offset: i64 = 0;
        loop {
            let updates = match self.fetch_updates(offset).await {
                Ok(u) => u,
                Err(e) => {
                    warn!("telegram poll failed: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                if let Some(id) = update["update_id"].as_i64() {
                    offset = offset.max(id + 1);
                }
                let Some(text) = update["message"]["text"].as_str() else {
                    continue;
                };
                self.handle_command(text, &settings, &pnl, &db, &kill, &control_tx)
                    .await;
            }
        }
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Value>> {
        let resp = self
            .http
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[("offset", offset.to_string()), ("timeout", "25".into())])
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .json::<Value>()
            .await?;
        Ok(resp["result"].as_array().cloned().unwrap_or_default())
    }

    async fn handle_command(
        &self,
        text: &str,
        settings: &Settings,
        pnl: &PnlTracker,
        db: &Database,
        kill: &KillSwitch,
        control_tx: &mpsc::Sender<ControlCommand>,
    ) {
        let mut parts = text.trim().trim_start_matches('/').split_whitespace();
        let command = parts.next().unwrap_or("").to_lowercase();

        match command.as_str() {
            "status" => {
                let halted = if kill.is_active() { "HALTED" } else { "running" };
                let open = db.count_open_positions().unwrap_or(0);
                let summary = pnl.summary_text().await;
                self.reply(&format!(
                    "Mode: {} | {halted}\nOpen positions: {open}\n{summary}",
                    settings.bot.trading_mode
                ))
                .await;
            }
            "pnl" => {
                let total = db.total_realized_pnl().unwrap_or(0.0);
                let summary = pnl.summary_text().await;
                self.reply(&format!("{summary}\nAll-time realized: {total:+.2}"))
                    .await;
            }
            "kill" => {
                let token = parts.next().unwrap_or("");
                if token != settings.telegram.kill_confirmation_token {
                    self.reply(&format!(
                        "Kill requires confirmation: kill {}",
                        settings.telegram.kill_confirmation_token
                    ))
                    .await;
                    return;
                }
                let _ = control_tx
                    .send(ControlCommand::Kill {
                        reason: "telegram operator command".into(),
                    })
                    .await;
            }
            "pause" => match parts.next().unwrap_or("").parse::<StrategyId>() {
                Ok(strategy) => {
                    let _ = control_tx.send(ControlCommand::Pause(strategy)).await;
                    self.reply(&format!("Paused {strategy}")).await;
                }
                Err(_) => {
                    self.reply("Usage: pause <copy_trader|arb_scanner|stink_bidder>")
                        .await
                }
            },
            "resume" => match parts.next().unwrap_or("").parse::<StrategyId>() {
                Ok(strategy) => {
                    let _ = control_tx.send(ControlCommand::Resume(strategy)).await;
                    self.reply(&format!("Resumed {strategy}")).await;
                }
                Err(_) => {
                    self.reply("Usage: resume <copy_trader|arb_scanner|stink_bidder>")
                        .await
                }
            },
            _ => {}
        }
    }

    /// Fire the daily summary at the configured UTC hour.
    pub async fn run_daily_summary_loop(self: Arc<Self>, pnl: Arc<PnlTracker>, utc_hour: u32) {
        let mut last_sent_date = String::new();
        loop {
            let now = Utc::now();
            let today = now.format("%Y-%m-%d").to_string();
            if now.hour() == utc_hour % 24 && last_sent_date != today {
                let summary = pnl.summary_text().await;
                self.alert(&format!("Daily summary {today}\n{summary}")).await;
                if let Err(e) = pnl.record_daily().await {
                    warn!("daily pnl snapshot failed: {e:#}");
                }
                last_sent_date = today;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }
}
