//! Generic JSON webhook channel.

use async_trait::async_trait;
use grabber_log::{Notifier, NotifyError};
use reqwest::Client;
use tracing::debug;

use crate::http;

/// POSTs `{"text": ..., "source": "grabber"}` to a URL.
pub struct WebhookNotifier {
    http: Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let mut request = self.http.post(&self.url).json(&serde_json::json!({
            "text": message,
            "source": "grabber",
        }));
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(http::transport)?;
        http::check(response).await?;
        debug!(url = %self.url, "webhook delivered");
        Ok(())
    }
}
