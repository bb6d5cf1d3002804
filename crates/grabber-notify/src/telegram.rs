//! Telegram Bot API channel.

use async_trait::async_trait;
use grabber_log::{Notifier, NotifyError};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::http;

/// Default Bot API endpoint.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Sends alerts to a chat through a bot.
pub struct TelegramNotifier {
    http: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    /// Escape Markdown (v1) control characters.
    fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if matches!(c, '_' | '*' | '[' | '`') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        #[derive(Serialize)]
        struct SendMessage<'a> {
            chat_id: &'a str,
            text: &'a str,
            parse_mode: &'static str,
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text: message,
                parse_mode: "Markdown",
            })
            .send()
            .await
            .map_err(http::transport)?;

        http::check(response).await?;
        debug!(chat_id = %self.chat_id, "telegram message sent");
        Ok(())
    }
}
