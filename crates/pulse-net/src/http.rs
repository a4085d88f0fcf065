use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use pulse_core::{ApiKey, DeliveryError, DeliveryOutcome, EventRecord, EventTransport, SessionId};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reqwest-backed ingest transport. One POST per session bucket.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: ApiKey,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    session_id: &'a str,
    events: &'a [EventRecord],
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    #[instrument(skip(self, events), fields(session_id = %session_id, batch = events.len()))]
    async fn post_event_batch(
        &self,
        session_id: &SessionId,
        events: &[EventRecord],
    ) -> DeliveryOutcome {
        let body = BatchRequest {
            session_id: session_id.as_str(),
            events,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.0.expose_secret())
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!("batch post timed out");
                return DeliveryOutcome::Failed(DeliveryError::Timeout(REQUEST_TIMEOUT));
            }
            Err(e) => {
                warn!(error = %e, "batch post failed before a response arrived");
                return DeliveryOutcome::Failed(DeliveryError::Network(e.to_string()));
            }
        };

        let status = resp.status();
        if status.is_success() {
            debug!(batch = events.len(), "batch accepted");
            DeliveryOutcome::Delivered
        } else {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "batch rejected");
            DeliveryOutcome::Failed(DeliveryError::from_status(status.as_u16(), body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::record::KIND_GOAL_ACHIEVED;

    #[test]
    fn batch_body_shape() {
        let events = vec![EventRecord::new(KIND_GOAL_ACHIEVED, true).with_value(1u64)];
        let body = BatchRequest {
            session_id: "S1",
            events: &events,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["session_id"], "S1");
        assert_eq!(json["events"].as_array().unwrap().len(), 1);
        assert_eq!(json["events"][0]["kind"], "goalAchieved");
    }

    #[test]
    fn debug_hides_api_key() {
        let transport = HttpTransport::new(
            "https://ingest.example.com/v1/batch",
            ApiKey::from("pk-live-secret"),
        );
        let debug = format!("{transport:?}");
        assert!(debug.contains("ingest.example.com"));
        assert!(!debug.contains("pk-live-secret"));
    }

    #[test]
    fn timeout_constants() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(30));
        assert_eq!(REQUEST_TIMEOUT, Duration::from_secs(30));
    }
}
