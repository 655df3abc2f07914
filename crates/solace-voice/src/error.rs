use std::time::Duration;
use thiserror::Error;

/// Faults raised by the external service adapters.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{service} call timed out after {} ms", .timeout.as_millis())]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    /// Connection failure, HTTP 5xx or 429 from the provider.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// The provider refused the payload (HTTP 4xx, malformed input).
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    #[error("generated reply failed the content-safety check")]
    SafetyRejected,

    #[error("audio storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { .. } | Self::Io(_)
        )
    }

    pub(crate) fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            service,
            message: message.into(),
        }
    }
}
