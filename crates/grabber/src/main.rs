//! Grabber: run log driver for incremental vendor grabs
//!
//! Subcommands, meant to be called from a scheduled job:
//! - `window`: next time window to fetch for a lineage
//! - `running`: open a run record
//! - `complete`: close a run record as complete
//! - `fail`: close a run record as failed and escalate
//! - `last`: print the lineage's latest run record
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::num::NonZeroU32;
use std::path::PathBuf;

use chrono::FixedOffset;
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Parse `key=value`; the value is read as JSON when it parses, else as a string.
fn parse_field(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    if grabber_log::RESERVED_FIELDS.contains(&key) {
        return Err(format!("'{}' is a record field and cannot be set here", key));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[derive(Parser)]
#[command(name = "grabber")]
#[command(about = "Run log and failure escalation for vendor grab jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the run log lives and which lineage to act on.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Directory of the JSON run log
    #[arg(long, env = "GRABBER_STORE_DIR", default_value = "grabber-log")]
    pub store_dir: PathBuf,

    /// Collection (file) holding the run records
    #[arg(long, env = "GRABBER_COLLECTION", default_value = grabber_log::DEFAULT_COLLECTION)]
    pub collection: String,

    /// Vendor code
    #[arg(long, env = "GRABBER_VENDOR_CODE")]
    pub vendor_code: String,

    /// Agent line
    #[arg(long, env = "GRABBER_AGENT", default_value = "")]
    pub agent: String,

    /// Record type (vendor endpoint)
    #[arg(long, env = "GRABBER_RECORD_TYPE", default_value = "")]
    pub record_type: String,

    /// Operator code
    #[arg(long, env = "GRABBER_OPERATOR_CODE", default_value = "")]
    pub operator_code: String,
}

/// Alert channels and policy.
#[derive(Args, Debug, Clone)]
pub struct NotifyArgs {
    /// Environment label shown in alerts
    #[arg(long, env = "GRABBER_ENVIRONMENT", default_value = "local")]
    pub environment: String,

    /// Alert every N consecutive failures
    #[arg(long, env = "GRABBER_NOTIFY_THRESHOLD", default_value = "5")]
    pub notify_threshold: NonZeroU32,

    /// Upper bound on each alert send, in seconds
    #[arg(long, env = "GRABBER_NOTIFY_TIMEOUT_SECS", default_value = "10")]
    pub notify_timeout_secs: u64,

    /// Send alerts to Telegram
    #[arg(long, env = "GRABBER_TELEGRAM_ENABLED", value_parser = parse_bool_env, default_value = "false")]
    pub telegram_enabled: bool,

    /// Telegram bot token
    #[arg(long, env = "GRABBER_TELEGRAM_BOT_TOKEN", default_value = "", hide_env_values = true)]
    pub telegram_bot_token: String,

    /// Telegram chat id
    #[arg(long, env = "GRABBER_TELEGRAM_CHAT_ID", default_value = "")]
    pub telegram_chat_id: String,

    /// Send alerts to a Slack incoming webhook
    #[arg(long, env = "GRABBER_SLACK_ENABLED", value_parser = parse_bool_env, default_value = "false")]
    pub slack_enabled: bool,

    /// Slack incoming webhook URL
    #[arg(long, env = "GRABBER_SLACK_WEBHOOK_URL", default_value = "", hide_env_values = true)]
    pub slack_webhook_url: String,

    /// Send alerts to a generic JSON webhook
    #[arg(long, env = "GRABBER_WEBHOOK_ENABLED", value_parser = parse_bool_env, default_value = "false")]
    pub webhook_enabled: bool,

    /// Generic webhook URL
    #[arg(long, env = "GRABBER_WEBHOOK_URL", default_value = "")]
    pub webhook_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the next window to fetch
    Window {
        #[command(flatten)]
        target: TargetArgs,

        /// Default lower bound, in minutes before now
        #[arg(long, allow_negative_numbers = true)]
        past_minutes: i64,

        /// Widest window to hand out, in minutes
        #[arg(long, allow_negative_numbers = true)]
        max_window_minutes: i64,

        /// Pull the upper bound back from now, in minutes
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        buffer_now_minutes: i64,

        /// Overlap when resuming after a completed run, in minutes
        #[arg(long, default_value = "1", allow_negative_numbers = true)]
        cover_time_range_minutes: i64,

        /// Only consider prior records with this field value (key=value, repeatable)
        #[arg(long = "last-filter", value_parser = parse_field)]
        last_filter: Vec<(String, serde_json::Value)>,

        /// Zone record boundaries are written in
        #[arg(long, env = "GRABBER_ZONE", default_value = "+08:00")]
        zone: FixedOffset,
    },

    /// Open a run record and print its id
    Running {
        #[command(flatten)]
        target: TargetArgs,

        /// Window start, as stored on the record
        #[arg(long)]
        start: String,

        /// Window end, as stored on the record
        #[arg(long)]
        end: Option<String>,

        /// Extra field (key=value, repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, serde_json::Value)>,
    },

    /// Close a run record as complete
    Complete {
        #[command(flatten)]
        target: TargetArgs,

        /// Run record id
        #[arg(long)]
        id: String,

        /// Window end, as stored on the record
        #[arg(long)]
        end: Option<String>,

        /// Extra field (key=value, repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, serde_json::Value)>,
    },

    /// Close a run record as failed and escalate
    Fail {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        notify: NotifyArgs,

        /// Run record id
        #[arg(long)]
        id: String,

        /// Window end, as stored on the record
        #[arg(long)]
        end: Option<String>,

        /// Error message
        #[arg(long)]
        error: Option<String>,

        /// Expected, operator-initiated failure: record it without alerting
        #[arg(long)]
        maintain: bool,

        /// Extra field (key=value, repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, serde_json::Value)>,
    },

    /// Print the latest run record of the lineage
    Last {
        #[command(flatten)]
        target: TargetArgs,

        /// Only consider records with this field value (key=value, repeatable)
        #[arg(long = "filter", value_parser = parse_field)]
        filter: Vec<(String, serde_json::Value)>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "grabber=info,grabber_log=info,grabber_notify=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Window {
            target,
            past_minutes,
            max_window_minutes,
            buffer_now_minutes,
            cover_time_range_minutes,
            last_filter,
            zone,
        } => {
            let mut config = grabber_log::WindowConfig::new(past_minutes, max_window_minutes)
                .with_buffer_now_minutes(buffer_now_minutes)
                .with_cover_time_range_minutes(cover_time_range_minutes)
                .with_zone(zone);
            if !last_filter.is_empty() {
                config = config.with_last_log_filter(commands::field_filter(last_filter));
            }
            commands::window(&target, &config).await
        }

        Commands::Running {
            target,
            start,
            end,
            fields,
        } => commands::running(&target, start, commands::extra(end, None, fields)).await,

        Commands::Complete {
            target,
            id,
            end,
            fields,
        } => commands::complete(&target, id, commands::extra(end, None, fields)).await,

        Commands::Fail {
            target,
            notify,
            id,
            end,
            error,
            maintain,
            fields,
        } => {
            commands::fail(
                &target,
                &notify,
                id,
                commands::extra(end, error, fields),
                maintain,
            )
            .await
        }

        Commands::Last { target, filter } => {
            let filter = (!filter.is_empty()).then(|| commands::field_filter(filter));
            commands::last(&target, filter.as_ref()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("TRUE"), Ok(true));
        assert_eq!(parse_bool_env("on"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert_eq!(parse_bool_env("off"), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("page=3"),
            Ok(("page".to_string(), serde_json::json!(3)))
        );
        assert_eq!(
            parse_field("mode=resync"),
            Ok(("mode".to_string(), serde_json::json!("resync")))
        );
        assert_eq!(
            parse_field("note=a=b"),
            Ok(("note".to_string(), serde_json::json!("a=b")))
        );
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
        assert!(parse_field("status=manual").is_err());
        assert!(parse_field("created_at=2024").is_err());
    }

    #[test]
    fn test_cli_parses_window() {
        let cli = Cli::try_parse_from([
            "grabber",
            "window",
            "--vendor-code",
            "pg",
            "--past-minutes",
            "60",
            "--max-window-minutes",
            "120",
            "--last-filter",
            "mode=resync",
        ])
        .unwrap();

        match cli.command {
            Commands::Window {
                target,
                past_minutes,
                zone,
                last_filter,
                ..
            } => {
                assert_eq!(target.vendor_code, "pg");
                assert_eq!(target.collection, "grabber_log");
                assert_eq!(past_minutes, 60);
                assert_eq!(zone.local_minus_utc(), 8 * 3600);
                assert_eq!(last_filter.len(), 1);
            }
            _ => panic!("expected window command"),
        }
    }

    #[test]
    fn test_cli_rejects_reserved_field() {
        let result = Cli::try_parse_from([
            "grabber",
            "running",
            "--vendor-code",
            "pg",
            "--start",
            "2024-03-01 19:00:00",
            "--field",
            "status=manual",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_rejects_zero_threshold() {
        let result = Cli::try_parse_from([
            "grabber",
            "fail",
            "--vendor-code",
            "pg",
            "--id",
            "x",
            "--notify-threshold",
            "0",
        ]);
        assert!(result.is_err());
    }
}
