//! Shared HTTP client.

use crate::error::{OpamError, Result};
use crate::version::user_agent;
use reqwest::{Client, Response};
use std::time::Duration;

/// Build the client used for the archive index and package downloads.
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(300))
        .user_agent(user_agent())
        .build()
        .map_err(|e| OpamError::Http {
            url: String::new(),
            status: None,
            message: format!("Failed to create HTTP client: {e}"),
        })
}

/// Turn a non-success status into [`OpamError::Http`].
pub(crate) fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(OpamError::Http {
        url: response.url().to_string(),
        status: Some(status.as_u16()),
        message: format!("server returned status {status}"),
    })
}
