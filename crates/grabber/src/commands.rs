//! Subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::info;

use grabber_log::{
    EscalationConfig, FailOptions, FailureEscalator, FileRunLogStore, GrabberLog, Lineage,
    RunExtra, RunFilter, WindowConfig,
};
use grabber_notify::{ChannelsConfig, SlackConfig, TelegramConfig, WebhookConfig, build_notifiers};

use crate::{NotifyArgs, TargetArgs};

/// Build extra record fields from command-line values.
pub fn extra(
    end: Option<String>,
    error: Option<String>,
    fields: Vec<(String, serde_json::Value)>,
) -> RunExtra {
    RunExtra {
        end,
        error,
        fields: fields.into_iter().collect(),
    }
}

/// Filter on extra-field values.
pub fn field_filter(fields: Vec<(String, serde_json::Value)>) -> RunFilter {
    fields
        .into_iter()
        .fold(RunFilter::default(), |filter, (k, v)| filter.with_field(k, v))
}

fn channels_config(args: &NotifyArgs) -> ChannelsConfig {
    ChannelsConfig {
        telegram: Some(TelegramConfig {
            enabled: args.telegram_enabled,
            bot_token: args.telegram_bot_token.clone(),
            chat_id: args.telegram_chat_id.clone(),
            api_base: None,
        }),
        slack: Some(SlackConfig {
            enabled: args.slack_enabled,
            webhook_url: args.slack_webhook_url.clone(),
        }),
        webhook: Some(WebhookConfig {
            enabled: args.webhook_enabled,
            url: args.webhook_url.clone(),
            headers: Vec::new(),
        }),
    }
}

async fn open(target: &TargetArgs, escalator: FailureEscalator) -> Result<GrabberLog> {
    let store = FileRunLogStore::open(&target.store_dir)
        .await
        .map_err(|e| miette::miette!("failed to open run log at {}: {}", target.store_dir.display(), e))?;

    let lineage = Lineage::new(&target.vendor_code)
        .with_agent(&target.agent)
        .with_record_type(&target.record_type)
        .with_operator_code(&target.operator_code);

    Ok(
        GrabberLog::new(Arc::new(store), Arc::new(escalator), lineage)
            .with_collection(&target.collection),
    )
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}

pub async fn window(target: &TargetArgs, config: &WindowConfig) -> Result<()> {
    let log = open(target, FailureEscalator::disabled()).await?;
    let next = log
        .next_window(config)
        .await
        .map_err(|e| miette::miette!("failed to compute window: {}", e))?;

    info!(
        lineage = %log.lineage(),
        start = %next.window.start,
        end = %next.window.end,
        empty = next.window.is_empty(),
        "next window"
    );
    print_json(&serde_json::json!({
        "start": next.window.start_timestamp(),
        "end": next.window.end_timestamp(),
        "start_field": next.window.start_field(),
        "end_field": next.window.end_field(),
    }))
}

pub async fn running(target: &TargetArgs, start: String, extra: RunExtra) -> Result<()> {
    let mut log = open(target, FailureEscalator::disabled()).await?;
    let id = log
        .running(start, extra)
        .await
        .map_err(|e| miette::miette!("failed to open run: {}", e))?;
    println!("{}", id);
    Ok(())
}

pub async fn complete(target: &TargetArgs, id: String, extra: RunExtra) -> Result<()> {
    let mut log = open(target, FailureEscalator::disabled()).await?;
    log.set_id(id);
    log.complete(extra)
        .await
        .map_err(|e| miette::miette!("failed to complete run: {}", e))
}

pub async fn fail(
    target: &TargetArgs,
    notify: &NotifyArgs,
    id: String,
    extra: RunExtra,
    maintain: bool,
) -> Result<()> {
    let escalation = EscalationConfig::new(&notify.environment, notify.notify_threshold)
        .with_dispatch_timeout(Duration::from_secs(notify.notify_timeout_secs));
    let channels = build_notifiers(&channels_config(notify));
    let mut log = open(target, FailureEscalator::new(escalation, channels)).await?;

    log.set_id(id);
    let options = FailOptions {
        maintain,
        ..FailOptions::default()
    };
    let outcome = log
        .fail(extra, options)
        .await
        .map_err(|e| miette::miette!("failed to record failure: {}", e))?;

    // The process exits after this; let in-flight alerts finish or time out.
    if let Some(dispatch) = outcome.dispatch {
        dispatch.join().await;
    }

    print_json(&serde_json::json!({ "fail_count": outcome.fail_count }))
}

pub async fn last(target: &TargetArgs, filter: Option<&RunFilter>) -> Result<()> {
    let log = open(target, FailureEscalator::disabled()).await?;
    let record = log
        .last_record(filter)
        .await
        .map_err(|e| miette::miette!("failed to read run log: {}", e))?;
    print_json(&record)
}
