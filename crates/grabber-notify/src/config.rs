//! Channel configuration.

use std::sync::Arc;

use grabber_log::Notifier;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{SlackNotifier, TelegramNotifier, WebhookNotifier};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    /// Bot API server; the public one when unset.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Every channel an alert may go to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// Build the enabled channels. Enabled channels missing a credential are
/// skipped with a warning.
pub fn build_notifiers(config: &ChannelsConfig) -> Vec<Arc<dyn Notifier>> {
    let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();

    if let Some(tg) = config.telegram.as_ref().filter(|c| c.enabled) {
        if tg.bot_token.is_empty() || tg.chat_id.is_empty() {
            warn!("telegram enabled without bot token or chat id, skipping");
        } else {
            let mut notifier = TelegramNotifier::new(&tg.bot_token, &tg.chat_id);
            if let Some(base) = &tg.api_base {
                notifier = notifier.with_api_base(base);
            }
            channels.push(Arc::new(notifier));
        }
    }

    if let Some(slack) = config.slack.as_ref().filter(|c| c.enabled) {
        if slack.webhook_url.is_empty() {
            warn!("slack enabled without webhook url, skipping");
        } else {
            channels.push(Arc::new(SlackNotifier::new(&slack.webhook_url)));
        }
    }

    if let Some(wh) = config.webhook.as_ref().filter(|c| c.enabled) {
        if wh.url.is_empty() {
            warn!("webhook enabled without url, skipping");
        } else {
            let notifier = wh
                .headers
                .iter()
                .fold(WebhookNotifier::new(&wh.url), |n, (k, v)| n.with_header(k, v));
            channels.push(Arc::new(notifier));
        }
    }

    info!(
        channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "notification channels configured"
    );
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(channels: &[Arc<dyn Notifier>]) -> Vec<&str> {
        channels.iter().map(|c| c.name()).collect()
    }

    #[test]
    fn test_nothing_configured() {
        assert!(build_notifiers(&ChannelsConfig::default()).is_empty());
    }

    #[test]
    fn test_enabled_channels_are_built() {
        let config = ChannelsConfig {
            telegram: Some(TelegramConfig {
                enabled: true,
                bot_token: "t".to_string(),
                chat_id: "1".to_string(),
                api_base: None,
            }),
            slack: Some(SlackConfig {
                enabled: true,
                webhook_url: "https://hooks.example.com/x".to_string(),
            }),
            webhook: Some(WebhookConfig {
                enabled: true,
                url: "https://example.com/alerts".to_string(),
                headers: vec![("x-api-key".to_string(), "k".to_string())],
            }),
        };

        let channels = build_notifiers(&config);
        assert_eq!(names(&channels), vec!["telegram", "slack", "webhook"]);
    }

    #[test]
    fn test_disabled_or_incomplete_channels_are_skipped() {
        let config = ChannelsConfig {
            telegram: Some(TelegramConfig {
                enabled: true,
                bot_token: "t".to_string(),
                chat_id: String::new(),
                api_base: None,
            }),
            slack: Some(SlackConfig {
                enabled: false,
                webhook_url: "https://hooks.example.com/x".to_string(),
            }),
            webhook: None,
        };

        assert!(build_notifiers(&config).is_empty());
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: ChannelsConfig = serde_json::from_value(serde_json::json!({
            "slack": { "enabled": true, "webhook_url": "https://hooks.example.com/x" }
        }))
        .unwrap();

        assert_eq!(config.telegram, None);
        assert_eq!(
            config.slack,
            Some(SlackConfig {
                enabled: true,
                webhook_url: "https://hooks.example.com/x".to_string(),
            })
        );
    }
}
