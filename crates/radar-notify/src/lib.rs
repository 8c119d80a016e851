//! Alert formatting and paced fan-out to push-messaging targets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{attr, Item, MonitorConfig, NotifyTarget};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "radar-notify";

/// Items listed individually in one alert.
pub const MAX_LISTED_ITEMS: usize = 10;
/// Raw row text is cut to this many characters.
pub const MAX_ROW_CHARS: usize = 100;
/// Pause between consecutive deliveries to stay under provider rate limits.
pub const DEFAULT_TARGET_PACE: Duration = Duration::from_secs(2);

pub const DEFAULT_PUSH_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("push to {target} failed: {message}")]
    Transport { target: String, message: String },
    #[error("push to {target} rejected with status {status}: {body}")]
    Status {
        target: String,
        status: u16,
        body: String,
    },
}

/// One outbound delivery mechanism.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn send(&self, target: &NotifyTarget, html: &str) -> Result<(), NotifierError>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramChannel {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(api_base: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PushChannel for TelegramChannel {
    async fn send(&self, target: &NotifyTarget, html: &str) -> Result<(), NotifierError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, target.credential);
        let body = SendMessage {
            chat_id: &target.channel_id,
            text: html,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifierError::Transport {
                target: target.name.clone(),
                // reqwest errors embed the URL, which carries the bot credential
                message: e.without_url().to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotifierError::Status {
            target: target.name.clone(),
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        })
    }
}

/// Where an alert came from, shown in its header and footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertSource {
    pub label: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Nothing was attempted: push disabled or nothing to report.
    pub suppressed: bool,
}

pub struct Notifier {
    channel: Arc<dyn PushChannel>,
    pace: Duration,
}

impl Notifier {
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            pace: DEFAULT_TARGET_PACE,
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Deliver one alert summarizing `items` to every enabled target. Never
    /// fails; per-target errors are logged and counted.
    pub async fn notify(&self, config: &MonitorConfig, source: &AlertSource, items: &[Item]) -> NotifyReport {
        if !config.notify_method.pushes() || items.is_empty() {
            return NotifyReport {
                suppressed: true,
                ..NotifyReport::default()
            };
        }

        let message = format_alert(source, items, Utc::now());
        let mut report = NotifyReport::default();
        let mut attempted = 0usize;

        for target in &config.notify_targets {
            if !target.enabled {
                report.skipped += 1;
                continue;
            }
            if attempted > 0 && !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
            attempted += 1;

            match self.channel.send(target, &message).await {
                Ok(()) => {
                    info!(target = %target.name, channel = %target.channel_id, items = items.len(), "push delivered");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(target = %target.name, channel = %target.channel_id, error = %err, "push failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Push a synthetic item so operators can check their targets.
    pub async fn send_test(&self, config: &MonitorConfig, source: &AlertSource) -> NotifyReport {
        self.notify(config, source, &[synthetic_item(Utc::now())]).await
    }
}

pub fn synthetic_item(now: DateTime<Utc>) -> Item {
    Item::new("test-123", now)
        .with_attr(attr::NAME, "Test Token")
        .with_attr(attr::SYMBOL, "TEST")
        .with_attr(attr::CHAIN, "ETH")
        .with_attr(attr::CONTRACT_ADDRESS, "0x1234567890abcdef")
}

/// Build the HTML alert body. At most `MAX_LISTED_ITEMS` are listed.
pub fn format_alert(source: &AlertSource, items: &[Item], now: DateTime<Utc>) -> String {
    let mut out = format!(
        "🚀 <b>{}: {} new {}</b>\n\n",
        escape_html(&source.label),
        items.len(),
        if items.len() == 1 { "listing" } else { "listings" }
    );

    for item in items.iter().take(MAX_LISTED_ITEMS) {
        out.push_str(&format_item_line(item));
        out.push('\n');
    }
    if items.len() > MAX_LISTED_ITEMS {
        out.push_str(&format!("…and {} more\n", items.len() - MAX_LISTED_ITEMS));
    }

    out.push_str(&format!(
        "\n⏰ <b>Detected:</b> {}\n",
        now.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(link) = &source.link {
        out.push_str(&format!("🔗 <b>Source:</b> {}\n", escape_html(link)));
    }
    out.push_str("\n💡 Listing Radar");
    out
}

fn format_item_line(item: &Item) -> String {
    if let Some(raw) = item.attr(attr::RAW_TEXT) {
        let rank = item.attr(attr::RANK).unwrap_or("?");
        let flat = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let cut: String = flat.chars().take(MAX_ROW_CHARS).collect();
        return format!("#{rank}. {}", escape_html(&cut));
    }

    let symbol = item.attr(attr::SYMBOL).unwrap_or(&item.identity);
    let mut line = format!("• <b>{}</b>", escape_html(symbol));
    if let Some(name) = item.attr(attr::NAME) {
        line.push_str(&format!(" ({})", escape_html(name)));
    }
    line.push_str(&format!(" · ID {}", escape_html(&item.identity)));
    if let Some(chain) = item.attr(attr::CHAIN_NAME).or(item.attr(attr::CHAIN)) {
        line.push_str(&format!(" · ⛓ {}", escape_html(chain)));
    }
    if let Some(contract) = item.attr(attr::CONTRACT_ADDRESS) {
        line.push_str(&format!("\n   📜 <code>{}</code>", escape_html(contract)));
    }
    line
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
