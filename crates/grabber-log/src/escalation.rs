//! Failure escalation.
//!
//! Consecutive failures within a lineage are counted on the failing records.
//! Operators are alerted every `notify_threshold` failures, once early at the
//! 10th failure, and a last time at [`MAX_NOTIFY_FAIL_COUNT`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Lineage, Notifier, RunRecord, RunStatus};

/// Failure count at which the last automatic alert of a streak goes out.
pub const MAX_NOTIFY_FAIL_COUNT: u32 = 500;

/// Failure count that always alerts, whatever the threshold.
const EARLY_WARNING_FAIL_COUNT: u32 = 10;

/// Longest error excerpt carried in an alert, in characters.
const ERROR_EXCERPT_CHARS: usize = 300;

/// Default upper bound on a single channel send.
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default alert period when none is configured.
const DEFAULT_NOTIFY_THRESHOLD: NonZeroU32 = NonZeroU32::new(5).unwrap();

/// Escalation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationConfig {
    /// Environment label shown in alerts (e.g. `prod`).
    pub environment: String,
    /// Alert every this many consecutive failures.
    pub notify_threshold: NonZeroU32,
    /// Upper bound on each channel send.
    pub dispatch_timeout: Duration,
}

impl EscalationConfig {
    pub fn new(environment: impl Into<String>, notify_threshold: NonZeroU32) -> Self {
        Self {
            environment: environment.into(),
            notify_threshold,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self::new("local", DEFAULT_NOTIFY_THRESHOLD)
    }
}

/// Whether a failure produces an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    /// No alert for this failure.
    Skip,
    /// Alert.
    Send,
    /// Alert, and announce that automatic alerts stop here.
    SendFinal,
}

/// Failure count for a new failure, given the record before it.
///
/// A streak continues only when the prior record failed; a prior failure
/// recorded without a count (maintenance) counts as zero.
pub fn next_fail_count(prior: Option<&RunRecord>) -> u32 {
    match prior {
        Some(record) if record.status == RunStatus::Fail => {
            record.fail_count.unwrap_or(0).saturating_add(1)
        }
        _ => 1,
    }
}

pub fn decide_notify(fail_count: u32, threshold: NonZeroU32) -> NotifyDecision {
    use std::cmp::Ordering;

    match fail_count.cmp(&MAX_NOTIFY_FAIL_COUNT) {
        Ordering::Less
            if fail_count % threshold.get() == 0 || fail_count == EARLY_WARNING_FAIL_COUNT =>
        {
            NotifyDecision::Send
        }
        Ordering::Less | Ordering::Greater => NotifyDecision::Skip,
        Ordering::Equal => NotifyDecision::SendFinal,
    }
}

/// Spawned channel sends for one alert.
///
/// The tasks run on their own; dropping this detaches them.
#[derive(Debug, Default)]
pub struct Dispatch {
    handles: Vec<JoinHandle<()>>,
}

impl Dispatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every send to finish or time out.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "notification task panicked");
            }
        }
    }
}

/// Decides failure counts and alerts the configured channels.
pub struct FailureEscalator {
    config: EscalationConfig,
    channels: Vec<Arc<dyn Notifier>>,
}

impl FailureEscalator {
    pub fn new(config: EscalationConfig, channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { config, channels }
    }

    /// An escalator with no channels; failures are recorded without counting.
    pub fn disabled() -> Self {
        Self::new(EscalationConfig::default(), Vec::new())
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// True when at least one channel is configured.
    pub fn is_enabled(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Alert text for a failure, before channel escaping.
    pub fn compose_message(
        &self,
        lineage: &Lineage,
        fail_count: u32,
        error: Option<&str>,
        decision: NotifyDecision,
    ) -> String {
        let mut lines = vec![
            format!("[{}] grabber fail", self.config.environment),
            format!("vendor: {}", lineage.vendor_code),
            format!("agent: {}", lineage.agent),
        ];
        if !lineage.record_type.is_empty() {
            lines.push(format!("record type: {}", lineage.record_type));
        }
        if !lineage.operator_code.is_empty() {
            lines.push(format!("operator: {}", lineage.operator_code));
        }
        lines.push(format!("fail count: {}", fail_count));
        if let Some(error) = error.filter(|e| !e.is_empty()) {
            let excerpt: String = error.chars().take(ERROR_EXCERPT_CHARS).collect();
            lines.push(format!("error: {}", excerpt));
        }
        if decision == NotifyDecision::SendFinal {
            lines.push(format!(
                "notification cap reached ({} consecutive failures): no further alerts will be sent, escalate manually",
                MAX_NOTIFY_FAIL_COUNT
            ));
        }
        lines.join("\n")
    }

    /// Alert the channels if this failure count calls for it.
    pub fn escalate(
        &self,
        lineage: &Lineage,
        fail_count: u32,
        error: Option<&str>,
    ) -> Option<Dispatch> {
        let decision = decide_notify(fail_count, self.config.notify_threshold);
        if decision == NotifyDecision::Skip {
            debug!(lineage = %lineage, fail_count, "failure below alert threshold");
            return None;
        }

        info!(lineage = %lineage, fail_count, ?decision, "escalating failure");
        let message = self.compose_message(lineage, fail_count, error, decision);
        Some(self.dispatch(&message))
    }

    /// Send `message` to every channel concurrently.
    ///
    /// Must be called within a tokio runtime. Send errors and timeouts are
    /// logged and dropped.
    pub fn dispatch(&self, message: &str) -> Dispatch {
        let timeout = self.config.dispatch_timeout;
        let handles = self
            .channels
            .iter()
            .map(|channel| {
                let channel = Arc::clone(channel);
                let text = channel.escape(message);
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, channel.send(&text)).await {
                        Ok(Ok(())) => debug!(channel = channel.name(), "notification sent"),
                        Ok(Err(e)) => {
                            warn!(channel = channel.name(), error = %e, "notification failed")
                        }
                        Err(_) => warn!(
                            channel = channel.name(),
                            timeout_secs = timeout.as_secs_f64(),
                            "notification timed out"
                        ),
                    }
                })
            })
            .collect();
        Dispatch { handles }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{NewRunRecord, NotifyError, RunExtra};
    use async_trait::async_trait;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Channel that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) sent: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub(crate) fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        fn escape(&self, text: &str) -> String {
            text.replace('_', "\\_")
        }

        async fn send(&self, message: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    /// Channel that never answers.
    pub(crate) struct HangingNotifier;

    #[async_trait]
    impl Notifier for HangingNotifier {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            std::future::pending().await
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _message: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected {
                status: 500,
                body: "boom".to_string(),
            })
        }
    }

    fn threshold(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn prior(status: RunStatus, fail_count: Option<u32>) -> RunRecord {
        let mut record = RunRecord::from_new(
            "prior".to_string(),
            NewRunRecord {
                lineage: Lineage::new("pg"),
                status,
                start: "2024-01-01 00:00:00".to_string(),
                extra: RunExtra::default(),
            },
            Utc::now(),
        );
        record.fail_count = fail_count;
        record
    }

    // === Unit Tests ===

    #[test]
    fn test_fail_count_starts_a_streak() {
        assert_eq!(next_fail_count(None), 1);
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Complete, None))), 1);
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Running, None))), 1);
        // A stale count on a non-failed record does not carry over.
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Complete, Some(7)))), 1);
    }

    #[test]
    fn test_fail_count_continues_a_streak() {
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Fail, Some(1)))), 2);
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Fail, Some(499)))), 500);
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Fail, None))), 1);
        assert_eq!(next_fail_count(Some(&prior(RunStatus::Fail, Some(u32::MAX)))), u32::MAX);
    }

    #[test]
    fn test_notify_schedule_threshold_five() {
        let sent: Vec<(u32, NotifyDecision)> = (1..=502)
            .map(|n| (n, decide_notify(n, threshold(5))))
            .filter(|(_, d)| *d != NotifyDecision::Skip)
            .collect();

        assert_eq!(&sent[..3], &[
            (5, NotifyDecision::Send),
            (10, NotifyDecision::Send),
            (15, NotifyDecision::Send),
        ]);
        assert_eq!(sent.last(), Some(&(500, NotifyDecision::SendFinal)));
        assert_eq!(sent.len(), 100);
        assert_eq!(decide_notify(501, threshold(5)), NotifyDecision::Skip);
    }

    #[test]
    fn test_early_warning_ignores_threshold() {
        assert_eq!(decide_notify(10, threshold(7)), NotifyDecision::Send);
        assert_eq!(decide_notify(7, threshold(7)), NotifyDecision::Send);
        assert_eq!(decide_notify(9, threshold(7)), NotifyDecision::Skip);
        assert_eq!(decide_notify(10, threshold(1000)), NotifyDecision::Send);
        assert_eq!(decide_notify(500, threshold(1000)), NotifyDecision::SendFinal);
    }

    #[test]
    fn test_compose_message() {
        let escalator = FailureEscalator::new(EscalationConfig::new("prod", threshold(5)), vec![]);
        let lineage = Lineage::new("pg").with_agent("line_1").with_record_type("bet");

        let message = escalator.compose_message(&lineage, 5, Some("timeout"), NotifyDecision::Send);

        assert_eq!(
            message,
            "[prod] grabber fail\nvendor: pg\nagent: line_1\nrecord type: bet\nfail count: 5\nerror: timeout"
        );
    }

    #[test]
    fn test_compose_message_truncates_error_and_announces_cap() {
        let escalator = FailureEscalator::disabled();
        let lineage = Lineage::new("pg").with_operator_code("op");
        let error = "é".repeat(400);

        let message =
            escalator.compose_message(&lineage, 500, Some(&error), NotifyDecision::SendFinal);

        let error_line = message.lines().find(|l| l.starts_with("error: ")).unwrap();
        assert_eq!(error_line.trim_start_matches("error: ").chars().count(), 300);
        assert!(message.contains("operator: op"));
        assert!(!message.contains("record type"));
        assert!(message.ends_with("escalate manually"));
    }

    #[tokio::test]
    async fn test_escalate_skips_below_threshold() {
        let channel = Arc::new(RecordingNotifier::default());
        let escalator = FailureEscalator::new(
            EscalationConfig::new("prod", threshold(5)),
            vec![channel.clone()],
        );

        assert!(escalator.escalate(&Lineage::new("pg"), 3, None).is_none());
        assert!(channel.messages().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_escapes_per_channel() {
        let channel = Arc::new(RecordingNotifier::default());
        let escalator = FailureEscalator::new(
            EscalationConfig::new("prod", threshold(5)),
            vec![channel.clone()],
        );

        let dispatch = escalator
            .escalate(&Lineage::new("pg").with_agent("line_1"), 5, None)
            .unwrap();
        assert_eq!(dispatch.len(), 1);
        dispatch.join().await;

        let messages = channel.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("agent: line\\_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_isolates_channels() {
        let recording = Arc::new(RecordingNotifier::default());
        let channels: Vec<Arc<dyn Notifier>> = vec![
            Arc::new(HangingNotifier),
            Arc::new(FailingNotifier),
            recording.clone(),
        ];
        let escalator = FailureEscalator::new(
            EscalationConfig::new("prod", threshold(5))
                .with_dispatch_timeout(Duration::from_secs(1)),
            channels,
        );

        let dispatch = escalator.dispatch("hello");
        assert_eq!(dispatch.len(), 3);
        dispatch.join().await;

        assert_eq!(recording.messages(), vec!["hello".to_string()]);
    }

    // === Property-Based Tests ===

    proptest! {
        // Nothing is sent past the ceiling.
        #[test]
        fn silent_past_ceiling(count in 501u32..u32::MAX, t in 1u32..1000) {
            prop_assert_eq!(decide_notify(count, threshold(t)), NotifyDecision::Skip);
        }

        // Below the ceiling, alerts follow the threshold and the early warning.
        #[test]
        fn alerts_follow_threshold(count in 1u32..500, t in 1u32..1000) {
            let expected = count % t == 0 || count == 10;
            prop_assert_eq!(
                decide_notify(count, threshold(t)) == NotifyDecision::Send,
                expected
            );
        }

        // The ceiling always alerts.
        #[test]
        fn ceiling_always_alerts(t in 1u32..1000) {
            prop_assert_eq!(decide_notify(500, threshold(t)), NotifyDecision::SendFinal);
        }
    }
}
