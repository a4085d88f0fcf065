use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::DeliveryError;
use crate::ids::SessionId;
use crate::record::EventRecord;

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

impl From<&str> for ApiKey {
    fn from(raw: &str) -> Self {
        Self(SecretString::from(raw))
    }
}

impl From<String> for ApiKey {
    fn from(raw: String) -> Self {
        Self(SecretString::from(raw))
    }
}

/// Result of posting one batch. Delivery is all-or-nothing per batch; a
/// failed batch goes back to the queue in its entirety.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Abstraction over the ingest endpoint. The pipeline never touches HTTP
/// directly, which keeps the flush logic testable with scripted transports.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Post one session's batch. Must not panic; every failure mode maps to
    /// a `DeliveryOutcome::Failed`.
    async fn post_event_batch(
        &self,
        session_id: &SessionId,
        events: &[EventRecord],
    ) -> DeliveryOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn api_key_debug_redacted() {
        let key = ApiKey::from("pk-live-12345");
        let debug = format!("{:?}", key);
        assert!(!debug.contains("pk-live"), "key leaked in debug: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn api_key_expose_secret() {
        let key = ApiKey::from("pk-live-12345");
        assert_eq!(key.0.expose_secret(), "pk-live-12345");
    }

    #[test]
    fn outcome_is_delivered() {
        assert!(DeliveryOutcome::Delivered.is_delivered());
        assert!(!DeliveryOutcome::Failed(DeliveryError::RateLimited).is_delivered());
    }
}
