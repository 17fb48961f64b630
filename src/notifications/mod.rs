//! Operator notifications over the Telegram bot API. Quota and expiry
//! crossings fire one message per crossing; without a configured token the
//! sender degrades to a log line.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram returned {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), NotificationError>;
}

pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: Option<String>,
}

impl TelegramNotifier {
    pub fn new(http: reqwest::Client, bot_token: Option<String>) -> Self {
        Self { http, bot_token }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), NotificationError> {
        let Some(token) = &self.bot_token else {
            info!(chat_id, text, "notification (no bot token configured)");
            return Ok(());
        };
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected(resp.status().as_u16()))
        }
    }
}

/// Human-readable byte count for notification texts. Values at or above
/// 100 of a unit get one decimal, smaller ones two.
pub fn format_usage(bytes: i64) -> String {
    const UNITS: [(f64, &str); 3] = [
        (1024.0 * 1024.0 * 1024.0 * 1024.0, "TB"),
        (1024.0 * 1024.0 * 1024.0, "GB"),
        (1024.0 * 1024.0, "MB"),
    ];
    let bytes = bytes.max(0) as f64;
    for (factor, unit) in UNITS {
        if bytes >= factor {
            let value = bytes / factor;
            return if value >= 100.0 {
                format!("{value:.1} {unit}")
            } else {
                format!("{value:.2} {unit}")
            };
        }
    }
    format!("{bytes:.0} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_formatting_picks_unit_and_precision() {
        assert_eq!(format_usage(512), "512 B");
        assert_eq!(format_usage(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_usage(150 * 1024 * 1024), "150.0 MB");
        assert_eq!(format_usage(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_usage(2 * 1024 * 1024 * 1024 * 1024), "2.00 TB");
        assert_eq!(format_usage(-7), "0 B");
    }
}
