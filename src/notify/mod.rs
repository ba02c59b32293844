/// Outbound notification channel.
///
/// Notifications are best-effort by contract: delivery failure is logged
/// and reported as `false`, never surfaced as an error, and never blocks
/// or fails the operation that triggered it.
use async_trait::async_trait;
use serde_json::json;

/// Trait for notification channels. `address` is channel-specific
/// (for Telegram, a chat id).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, address: &str, text: &str) -> bool;
}

/// Telegram Bot API channel.
pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, address: &str, text: &str) -> bool {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({ "chat_id": address, "text": text });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Telegram notification rejected");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Telegram notification failed");
                false
            }
        }
    }
}

/// Channel that drops everything. Used when no bot token is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _address: &str, _text: &str) -> bool {
        false
    }
}
