//! HTTP notification channels for grabber failure alerts.
//!
//! Each channel implements [`grabber_log::Notifier`]:
//!
//! - **Telegram**: Bot API `sendMessage` with Markdown parsing
//! - **Slack**: incoming webhook
//! - **Webhook**: generic JSON POST
//!
//! [`build_notifiers`] turns a [`ChannelsConfig`] into the enabled channels.

mod config;
mod http;
mod slack;
mod telegram;
mod webhook;

pub use config::{ChannelsConfig, SlackConfig, TelegramConfig, WebhookConfig, build_notifiers};
pub use slack::SlackNotifier;
pub use telegram::{TELEGRAM_API_BASE, TelegramNotifier};
pub use webhook::WebhookNotifier;
