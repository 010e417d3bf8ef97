//! Error types for the client crate.

use rendezvous_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the backend.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A swipe on this target is already being processed.
    #[error("Swipe already in progress for {0}")]
    SwipeInProgress(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ClientError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify the error for retry policy.  Local store failures are
    /// permanent from the network's point of view.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) | Self::Task(_) => ApiRetryClass::Retryable,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
            Self::Store(_)
            | Self::Json(_)
            | Self::NotConfigured(_)
            | Self::InvalidRequest(_)
            | Self::SwipeInProgress(_) => ApiRetryClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_require_reauth() {
        assert_eq!(
            ClientError::api(401, "unauthorized").retry_class(),
            ApiRetryClass::ReauthRequired
        );
    }

    #[test]
    fn server_errors_are_retryable() {
        assert_eq!(ClientError::api(503, "down").retry_class(), ApiRetryClass::Retryable);
        assert_eq!(ClientError::api(422, "bad").retry_class(), ApiRetryClass::Permanent);
        assert_eq!(ClientError::api(503, "down").status_code(), Some(503));
    }
}
