//! Slack incoming-webhook channel.

use async_trait::async_trait;
use grabber_log::{Notifier, NotifyError};
use reqwest::Client;
use tracing::debug;

use crate::http;

pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    fn escape(&self, text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await
            .map_err(http::transport)?;

        http::check(response).await?;
        debug!("slack message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_escape_entities() {
        let notifier = SlackNotifier::new("https://example.com");
        assert_eq!(notifier.escape("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        // Underscores are not markup in plain webhook text.
        assert_eq!(notifier.escape("line_1"), "line_1");
    }

    #[tokio::test]
    async fn test_send_posts_text() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/T/B/X"))
            .and(body_json(serde_json::json!({ "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = SlackNotifier::new(format!("{}/services/T/B/X", mock_server.uri()));
        notifier.send("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_unreachable_is_transport_error() {
        let notifier = SlackNotifier::new("http://127.0.0.1:1/services/T/B/SECRET");
        let err = notifier.send("hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
        assert!(!err.to_string().contains("SECRET"));
    }
}
