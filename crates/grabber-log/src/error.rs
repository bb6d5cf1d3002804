//! Error types for the grabber log.

use thiserror::Error;

/// Errors that can occur in run log operations.
#[derive(Debug, Error)]
pub enum GrabberError {
    /// Invalid window or escalation configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A prior run record lacks a field the calculation needs.
    #[error("run record {id} is missing `{field}`")]
    MissingField { id: String, field: &'static str },

    /// A prior run record carries a timestamp that does not parse.
    #[error("run record {id} has malformed `{field}`: {value:?}")]
    MalformedTimestamp {
        id: String,
        field: &'static str,
        value: String,
    },

    /// `complete` or `fail` was called without a bound run id.
    #[error("no open run: call `running` or `set_id` first")]
    NoOpenRun,

    /// Update targeted a record the store does not have.
    #[error("run record not found: {collection}/{id}")]
    RecordNotFound { collection: String, id: String },

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Filesystem error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
