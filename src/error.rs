use std::time::Duration;
use thiserror::Error;

/// Failure kinds surfaced by the client. They travel inside `anyhow::Error`,
/// so callers match on them with `err.downcast_ref::<ClientError>()`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("remote API error at {endpoint}: {message}")]
    Remote { endpoint: String, message: String },

    #[error("timed out waiting for {label} after {attempts} attempts ({elapsed:?})")]
    Timeout {
        label: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl ClientError {
    pub fn remote(endpoint: &str, message: impl Into<String>) -> Self {
        ClientError::Remote {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}

/// Returns the `ClientError` carried by an `anyhow::Error`, if any.
pub fn client_error(err: &anyhow::Error) -> Option<&ClientError> {
    err.downcast_ref::<ClientError>()
}
