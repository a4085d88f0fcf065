use std::time::Duration;

use thiserror::Error;

/// Failure delivering a batch to the ingest endpoint.
#[derive(Clone, Debug, Error)]
pub enum DeliveryError {
    /// Connection-level failure before any response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success status.
    #[error("server rejected batch with status {status}: {body}")]
    Server { status: u16, body: String },

    /// HTTP 429. The batch must be retried later, never dropped.
    #[error("rate limited by ingest endpoint")]
    RateLimited,

    /// No response within the configured deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A response arrived but could not be understood.
    #[error("invalid response from ingest endpoint: {0}")]
    InvalidResponse(String),
}

impl DeliveryError {
    /// Map an HTTP status to the matching error variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            429 => Self::RateLimited,
            _ => Self::Server {
                status,
                body: body.into(),
            },
        }
    }

    /// Stable label for logs and counters. Every failure kind is handled
    /// the same way by the pipeline (requeue and back off); the label only
    /// distinguishes them in diagnostics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Server { .. } => "server",
            Self::RateLimited => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}
