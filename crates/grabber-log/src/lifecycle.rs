//! Per-lineage run handle.
//!
//! A [`GrabberLog`] binds one lineage to a store and an escalator. Each grab
//! attempt opens a record with [`GrabberLog::running`] and closes it exactly
//! once with [`GrabberLog::complete`] or [`GrabberLog::fail`].
//!
//! Only one scheduler should drive a lineage at a time: the "read last record,
//! then decide" steps are not atomic across processes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_COLLECTION, Dispatch, FailureEscalator, GrabberError, Lineage, NewRunRecord, RunExtra,
    RunFilter, RunLogStore, RunPatch, RunRecord, RunStatus, Window, WindowConfig, compute_window,
    next_fail_count,
};

/// A computed window together with the record it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct NextWindow {
    pub window: Window,
    /// The record read to compute the window; pass it to
    /// [`FailOptions::with_prior`] to skip a second read when failing.
    pub last_record: Option<RunRecord>,
}

/// Where `fail` gets the record preceding the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PriorRecord {
    /// Read the lineage's latest record other than the current one.
    ///
    /// The streak is counted across the whole lineage, ignoring any
    /// `last_log_filter` used for windows. Passing `Known(next.last_record)`
    /// instead counts from the narrower record the window was derived from.
    #[default]
    Fetch,
    /// Use a record already read in this tick.
    Known(Option<RunRecord>),
}

/// Options for [`GrabberLog::fail`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailOptions {
    /// Operator-initiated pause: record the failure without counting or alerting.
    pub maintain: bool,
    pub prior: PriorRecord,
}

impl FailOptions {
    pub fn maintenance() -> Self {
        Self {
            maintain: true,
            ..Self::default()
        }
    }

    pub fn with_prior(mut self, prior: Option<RunRecord>) -> Self {
        self.prior = PriorRecord::Known(prior);
        self
    }
}

/// Result of a recorded failure.
#[derive(Debug, Default)]
pub struct FailOutcome {
    /// Consecutive failure count written to the record, when escalation ran.
    pub fail_count: Option<u32>,
    /// Alert sends in flight, when this failure triggered one.
    pub dispatch: Option<Dispatch>,
}

/// Run handle for one lineage.
pub struct GrabberLog {
    store: Arc<dyn RunLogStore>,
    escalator: Arc<FailureEscalator>,
    collection: String,
    lineage: Lineage,
    run_id: Option<String>,
}

impl GrabberLog {
    pub fn new(
        store: Arc<dyn RunLogStore>,
        escalator: Arc<FailureEscalator>,
        lineage: Lineage,
    ) -> Self {
        Self {
            store,
            escalator,
            collection: DEFAULT_COLLECTION.to_string(),
            lineage,
            run_id: None,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Id of the open record, if any.
    pub fn id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Bind to a record opened elsewhere, e.g. by a previous process.
    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.run_id = Some(id.into());
        self
    }

    /// Latest record of the lineage, optionally narrowed further.
    pub async fn last_record(
        &self,
        narrow: Option<&RunFilter>,
    ) -> Result<Option<RunRecord>, GrabberError> {
        let mut filter = self.lineage.filter();
        if let Some(narrow) = narrow {
            filter = filter.merged(narrow);
        }
        self.store.query_latest(&self.collection, &filter).await
    }

    /// Next window to fetch, as of now.
    pub async fn next_window(&self, config: &WindowConfig) -> Result<NextWindow, GrabberError> {
        self.next_window_at(Utc::now(), config).await
    }

    /// Next window to fetch, as of `now`.
    #[tracing::instrument(skip(self, now, config), fields(lineage = %self.lineage))]
    pub async fn next_window_at(
        &self,
        now: DateTime<Utc>,
        config: &WindowConfig,
    ) -> Result<NextWindow, GrabberError> {
        config.validate()?;
        let last_record = self.last_record(config.last_log_filter.as_ref()).await?;
        let window = compute_window(now, config, last_record.as_ref())?;
        Ok(NextWindow {
            window,
            last_record,
        })
    }

    /// Open a record for a new attempt and bind to it.
    #[tracing::instrument(skip(self, start, extra), fields(lineage = %self.lineage))]
    pub async fn running(
        &mut self,
        start: impl Into<String>,
        extra: RunExtra,
    ) -> Result<String, GrabberError> {
        if let Some(open) = &self.run_id {
            warn!(open_id = %open, "opening a new run while another is still bound");
        }

        let id = self
            .store
            .insert(
                &self.collection,
                NewRunRecord {
                    lineage: self.lineage.clone(),
                    status: RunStatus::Running,
                    start: start.into(),
                    extra,
                },
            )
            .await?;

        debug!(id = %id, "run started");
        self.run_id = Some(id.clone());
        Ok(id)
    }

    /// Close the open record as complete.
    #[tracing::instrument(skip(self, extra), fields(lineage = %self.lineage, id = ?self.run_id))]
    pub async fn complete(&mut self, extra: RunExtra) -> Result<(), GrabberError> {
        let id = self.run_id.clone().ok_or(GrabberError::NoOpenRun)?;

        self.store
            .update_by_id(
                &self.collection,
                &id,
                RunPatch {
                    status: RunStatus::Complete,
                    fail_count: None,
                    extra,
                },
            )
            .await?;

        debug!(id = %id, "run completed");
        self.run_id = None;
        Ok(())
    }

    /// Close the open record as failed, escalating unless in maintenance.
    ///
    /// Alerts are spawned after the record is written and are never awaited
    /// here; see [`FailOutcome::dispatch`].
    #[tracing::instrument(skip(self, extra, options), fields(lineage = %self.lineage, id = ?self.run_id, maintain = options.maintain))]
    pub async fn fail(
        &mut self,
        extra: RunExtra,
        options: FailOptions,
    ) -> Result<FailOutcome, GrabberError> {
        let id = self.run_id.clone().ok_or(GrabberError::NoOpenRun)?;

        let fail_count = if options.maintain {
            info!(id = %id, "failure recorded in maintenance mode");
            None
        } else if !self.escalator.is_enabled() {
            None
        } else {
            let prior = match options.prior {
                PriorRecord::Known(prior) => prior,
                PriorRecord::Fetch => {
                    let filter = self.lineage.filter().excluding(id.clone());
                    self.store.query_latest(&self.collection, &filter).await?
                }
            };
            Some(next_fail_count(prior.as_ref()))
        };
        let error = extra.error.clone();

        self.store
            .update_by_id(
                &self.collection,
                &id,
                RunPatch {
                    status: RunStatus::Fail,
                    fail_count,
                    extra,
                },
            )
            .await?;

        // Alert only once the failure is on record.
        let dispatch = fail_count
            .and_then(|count| self.escalator.escalate(&self.lineage, count, error.as_deref()));

        warn!(id = %id, fail_count = ?fail_count, "run failed");
        self.run_id = None;
        Ok(FailOutcome {
            fail_count,
            dispatch,
        })
    }
}
