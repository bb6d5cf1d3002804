//! Shared HTTP plumbing for the channels.

use std::time::Duration;

use grabber_log::NotifyError;
use reqwest::{Client, Response};

/// Build the client a channel sends with.
pub(crate) fn client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

/// Map a send failure, dropping the URL: it can carry a credential.
pub(crate) fn transport(err: reqwest::Error) -> NotifyError {
    NotifyError::transport(err.without_url())
}

/// Map a non-success response to [`NotifyError::Rejected`].
pub(crate) async fn check(response: Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}
