//! Notification channel seam.

use async_trait::async_trait;
use thiserror::Error;

/// Errors a notification channel can report. They are logged, never raised
/// past the escalator.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The channel answered with a non-success status.
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl NotifyError {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// Best-effort delivery of a text message to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short channel name used in logs.
    fn name(&self) -> &str;

    /// Escape characters that are significant to this channel's markup.
    fn escape(&self, text: &str) -> String {
        text.to_string()
    }

    /// Deliver an already-escaped message.
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}
