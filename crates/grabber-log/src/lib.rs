//! Run log and failure escalation for incremental vendor grabs.
//!
//! This crate provides the decision logic behind repeated "grab" jobs:
//! - Computes the next time window to pull from the lineage's run history
//! - Records each attempt as a run record (`running` -> `complete` | `fail`)
//! - Escalates consecutive failures to the configured notification channels
//!
//! Persistence and notification transports are consumed through the
//! [`RunLogStore`] and [`Notifier`] traits.

mod error;
mod escalation;
mod lifecycle;
pub mod notify;
pub mod store;
mod types;
mod window;

pub use error::GrabberError;
pub use escalation::{
    Dispatch, EscalationConfig, FailureEscalator, MAX_NOTIFY_FAIL_COUNT, NotifyDecision,
    decide_notify, next_fail_count,
};
pub use lifecycle::{FailOptions, FailOutcome, GrabberLog, NextWindow, PriorRecord};
pub use notify::{NotifyError, Notifier};
pub use store::{FileRunLogStore, MemoryRunLogStore, RunLogStore};
pub use types::{
    DEFAULT_COLLECTION, Lineage, NewRunRecord, RECORD_TIME_FORMAT, RESERVED_FIELDS, RunExtra,
    RunFilter, RunPatch, RunRecord, RunStatus, default_zone, format_record_time,
    parse_record_time,
};
pub use window::{DEFAULT_COVER_TIME_RANGE_MINUTES, Window, WindowConfig, compute_window};
