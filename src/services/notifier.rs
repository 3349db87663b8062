use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SendError;
use crate::models::{metric, Alert};

/// Destination for formatted alert text (chat API, log, test double).
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), SendError>;
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramSink {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
    parse_mode: String,
    disable_preview: bool,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: &str, parse_mode: &str, disable_preview: bool) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(12))
            .build()
            .map_err(|e| SendError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            parse_mode: parse_mode.to_string(),
            disable_preview,
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl NotifySink for TelegramSink {
    async fn send(&self, text: &str) -> Result<(), SendError> {
        if self.token.is_empty() {
            return Err(SendError::NotConfigured("telegram bot token"));
        }
        if self.chat_id.is_empty() {
            return Err(SendError::NotConfigured("telegram chat id"));
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": self.parse_mode,
            "disable_web_page_preview": self.disable_preview,
        });

        let resp = self.client.post(&url)
            .json(&payload)
            .send()
            .await
            // reqwest errors embed the URL, which carries the token.
            .map_err(|e| SendError::Network(e.without_url().to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let description = resp
            .json::<TelegramReply>()
            .await
            .ok()
            .and_then(|r| r.description)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

        Err(SendError::Rejected { status: status.as_u16(), description })
    }
}

/// Writes alerts to the log instead of a chat (dry runs, missing credentials).
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotifySink for LogSink {
    async fn send(&self, text: &str) -> Result<(), SendError> {
        tracing::info!(target: "pump_watch::alerts", "\n{}", text);
        Ok(())
    }
}

/// Per-watcher message shape.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageTemplate {
    #[serde(default = "default_title")]
    pub title: String,
    /// Deep link with `{key}` substituted by the entity key.
    #[serde(default = "default_link")]
    pub link_template: String,
    #[serde(default)]
    pub extra_links: Vec<String>,
}

fn default_title() -> String { "🆕 *New candidate*".to_string() }
fn default_link() -> String { "https://dexscreener.com/solana/{key}".to_string() }

impl Default for MessageTemplate {
    fn default() -> Self {
        Self { title: default_title(), link_template: default_link(), extra_links: Vec::new() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertFormatter {
    template: MessageTemplate,
}

impl AlertFormatter {
    pub fn new(template: MessageTemplate) -> Self {
        Self { template }
    }

    pub fn format(&self, alert: &Alert) -> String {
        let name = alert.name.as_deref().unwrap_or("Unknown");
        let symbol = alert.symbol.as_deref().unwrap_or("?");

        let mut lines = vec![
            self.template.title.clone(),
            String::new(),
            format!("*{}* ({})", escape_markdown(name), escape_markdown(symbol)),
            format!("`{}`", alert.key.replace('`', "'")),
            String::new(),
            format!("Reason: *{}*", escape_markdown(&alert.reason)),
        ];

        for m in &alert.relevant {
            lines.push(format!("{}: *{}*", escape_markdown(m), format_value(metric(&alert.metrics, m))));
        }

        lines.push(String::new());
        for link in std::iter::once(&self.template.link_template).chain(&self.template.extra_links) {
            lines.push(format!("🔗 {}", link.replace("{key}", &alert.key)));
        }

        let detected = chrono::DateTime::from_timestamp(alert.timestamp, 0)
            .unwrap_or_else(chrono::Utc::now);
        lines.push(String::new());
        lines.push(format!("_Detected at {} UTC_", detected.format("%Y-%m-%dT%H:%M:%S")));

        lines.join("\n")
    }
}

/// Formats and delivers alerts through one sink.
#[derive(Clone)]
pub struct Notifier {
    formatter: AlertFormatter,
    sink: Arc<dyn NotifySink>,
}

impl Notifier {
    pub fn new(formatter: AlertFormatter, sink: Arc<dyn NotifySink>) -> Self {
        Self { formatter, sink }
    }

    pub async fn notify(&self, alert: &Alert) -> Result<(), SendError> {
        let text = self.formatter.format(alert);
        self.sink.send(&text).await
    }
}

fn escape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `1234567.891` -> `1,234,567.89`; values below 1 keep up to 6 decimals.
pub fn format_value(v: f64) -> String {
    if v != 0.0 && v.abs() < 1.0 {
        let s = format!("{:.6}", v);
        return s.trim_end_matches('0').trim_end_matches('.').to_string();
    }

    let rounded = format!("{:.2}", v.abs());
    let (int_part, frac_part) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));

    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let frac = frac_part.trim_end_matches('0');
    let sign = if v < 0.0 { "-" } else { "" };
    if frac.is_empty() {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metrics;

    fn alert() -> Alert {
        let mut metrics = Metrics::new();
        metrics.insert("txn_count".into(), 9.0);
        metrics.insert("market_cap_usd".into(), 3200.5);
        metrics.insert("volume_usd".into(), 1.0);
        Alert {
            watcher: "pump".into(),
            key: "mintA".into(),
            name: Some("Moon_Dog".into()),
            symbol: Some("MDOG".into()),
            reason: "txn_delta".into(),
            metrics,
            relevant: vec!["txn_count".into(), "market_cap_usd".into()],
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn message_contains_key_reason_metrics_and_link() {
        let fmt = AlertFormatter::new(MessageTemplate {
            title: "🚀 *Spike*".into(),
            link_template: "https://pump.fun/{key}".into(),
            extra_links: vec!["https://dexscreener.com/solana/{key}".into()],
        });
        let text = fmt.format(&alert());

        assert!(text.starts_with("🚀 *Spike*"));
        assert!(text.contains("*Moon\\_Dog* (MDOG)"));
        assert!(text.contains("`mintA`"));
        assert!(text.contains("Reason: *txn\\_delta*"));
        assert!(text.contains("txn\\_count: *9*"));
        assert!(text.contains("market\\_cap\\_usd: *3,200.5*"));
        assert!(!text.contains("volume"));
        assert!(text.contains("🔗 https://pump.fun/mintA"));
        assert!(text.contains("🔗 https://dexscreener.com/solana/mintA"));
        assert!(text.contains("_Detected at 2023-11-14T22:13:20 UTC_"));
    }

    #[test]
    fn value_formatting() {
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(1234567.891), "1,234,567.89");
        assert_eq!(format_value(-4500.0), "-4,500");
        assert_eq!(format_value(0.00001234), "0.000012");
        assert_eq!(format_value(999.999), "1,000");
    }

    #[tokio::test]
    async fn telegram_without_credentials_is_not_configured() {
        let sink = TelegramSink::new("", "@chan", "Markdown", false).unwrap();
        assert!(matches!(sink.send("hi").await, Err(SendError::NotConfigured(_))));
        let sink = TelegramSink::new("123:abc", "", "Markdown", false).unwrap();
        assert!(matches!(sink.send("hi").await, Err(SendError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        assert!(LogSink.send("anything").await.is_ok());
    }
}
