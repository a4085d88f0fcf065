//! Pulse — the event durability and delivery pipeline of an embedded
//! analytics SDK.
//!
//! Tracked events are persisted to a bounded local SQLite queue, grouped by
//! session, and delivered to an ingest endpoint with exponential backoff.
//! A failed delivery puts the batch back in the queue; a process death loses
//! nothing that reached the store. The host app talks to one [`Analytics`]
//! handle; everything behind it runs on a single serialized worker task.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use pulse_core::record::{
    KIND_ERROR, KIND_EXTERNAL, KIND_GOAL_ACHIEVED, KIND_VIEW_APPEARED, KIND_VIEW_DISAPPEARED,
};
use pulse_net::HttpTransport;
use pulse_pipeline::{PipelineHandle, PipelineWorker};
use pulse_store::{
    load_or_create_key, CipherCodec, Database, EventQueue, PlainCodec, RecordCodec,
};
use pulse_telemetry::PipelineStats;

pub use pulse_core::{
    resolve_session, ApiKey, ConfigLoadState, DeliveryError, DeliveryOutcome, EventFilter,
    EventRecord, EventTransport, EventValue, RemoteConfig, SessionId, StaticConfig,
};
pub use pulse_net::MockTransport;
pub use pulse_pipeline::{BackoffConfig, PipelineConfig, PipelineError};
pub use pulse_store::{QueueConfig, StoreError};
pub use pulse_telemetry::{init_telemetry, StatsSnapshot, TelemetryConfig, TelemetryGuard};

/// Default serialized-metadata cap per event.
pub const DEFAULT_METADATA_CAP_BYTES: usize = 50 * 1024;

/// How the SDK is wired at startup.
#[derive(Clone, Debug)]
pub struct AnalyticsConfig {
    /// Ingest endpoint for event batches.
    pub endpoint: String,
    /// Where the durable queue lives. `None` keeps it in memory, which
    /// trades crash durability away; useful for tests and previews.
    pub storage_path: Option<PathBuf>,
    /// When set, records are encrypted at rest with a key stored (or
    /// created) at this path.
    pub key_path: Option<PathBuf>,
    /// Serialized metadata larger than this is dropped from the event.
    pub metadata_cap_bytes: usize,
    pub queue: QueueConfig,
    pub pipeline: PipelineConfig,
    /// Startup option: wipe any events left over from previous runs.
    pub clear_on_start: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://ingest.pulse-analytics.io/v1/events".to_string(),
            storage_path: None,
            key_path: None,
            metadata_cap_bytes: DEFAULT_METADATA_CAP_BYTES,
            queue: QueueConfig::default(),
            pipeline: PipelineConfig::default(),
            clear_on_start: false,
        }
    }
}

/// The SDK entry point held by the host app.
///
/// All tracking calls are fire-and-forget: they stamp a session, apply
/// server-pushed suppression, and hand the record to the pipeline worker.
/// Only [`flush`](Analytics::flush) waits for anything.
#[derive(Clone)]
pub struct Analytics {
    handle: PipelineHandle,
    remote: Arc<dyn RemoteConfig>,
    metadata_cap: usize,
}

impl Analytics {
    /// Wire up the SDK against the production HTTP transport.
    pub fn new(
        config: AnalyticsConfig,
        api_key: ApiKey,
        remote: Arc<dyn RemoteConfig>,
    ) -> Result<Self, PipelineError> {
        let transport = Arc::new(HttpTransport::new(config.endpoint.clone(), api_key));
        Self::with_transport(config, remote, transport)
    }

    /// Wire up the SDK with a caller-supplied transport. Tests pair this
    /// with [`MockTransport`].
    pub fn with_transport(
        config: AnalyticsConfig,
        remote: Arc<dyn RemoteConfig>,
        transport: Arc<dyn EventTransport>,
    ) -> Result<Self, PipelineError> {
        let db = match &config.storage_path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory()?,
        };
        let codec: Arc<dyn RecordCodec> = match &config.key_path {
            Some(path) => Arc::new(CipherCodec::new(load_or_create_key(path)?)),
            None => Arc::new(PlainCodec),
        };

        let queue = EventQueue::with_config(db, codec, config.queue);
        if config.clear_on_start {
            queue.clear()?;
        }

        let handle = PipelineWorker::spawn(
            queue,
            Arc::clone(&remote),
            transport,
            Arc::new(PipelineStats::new()),
            config.pipeline,
        );

        Ok(Self {
            handle,
            remote,
            metadata_cap: config.metadata_cap_bytes,
        })
    }

    fn base_record(&self, kind: &str) -> EventRecord {
        EventRecord::new(kind, !self.remote.is_live_mode())
            .with_session(resolve_session(self.remote.as_ref()))
    }

    /// Track a named goal event.
    pub fn track(
        &self,
        name: &str,
        value: Option<EventValue>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut record = self.base_record(KIND_GOAL_ACHIEVED).with_goal(name);
        if let Some(value) = value {
            record = record.with_value(value);
        }
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata, self.metadata_cap);
        }
        self.handle.track(record);
    }

    /// Track an error. Repeated identical messages collapse into a single
    /// counted event per flush window. With `send_to_server` false the
    /// error is surfaced through the log layer only and never persisted.
    pub fn track_error(&self, message: &str, detail: Option<&str>, send_to_server: bool) {
        if !send_to_server {
            warn!(
                error_message = message,
                detail = detail.unwrap_or(""),
                "error tracked with delivery disabled"
            );
            return;
        }
        let mut metadata = serde_json::json!({ "message": message });
        if let Some(detail) = detail {
            metadata["detail"] = serde_json::Value::String(detail.to_string());
        }
        let record = self
            .base_record(KIND_ERROR)
            .with_metadata(metadata, self.metadata_cap);
        self.handle.track(record);
    }

    /// Track an event forwarded from another analytics SDK.
    pub fn track_from_source(
        &self,
        source: &str,
        name: &str,
        value: Option<EventValue>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                "source".to_string(),
                serde_json::Value::String(source.to_string()),
            );
        }
        let mut record = self.base_record(KIND_EXTERNAL).with_goal(name);
        if let Some(value) = value {
            record = record.with_value(value);
        }
        record = record.with_metadata(metadata, self.metadata_cap);
        self.handle.track(record);
    }

    /// Track a view becoming visible. The value carries the capture time.
    pub fn track_view_appeared(&self, view: &str) {
        self.track_view(KIND_VIEW_APPEARED, view);
    }

    /// Track a view leaving the screen.
    pub fn track_view_disappeared(&self, view: &str) {
        self.track_view(KIND_VIEW_DISAPPEARED, view);
    }

    fn track_view(&self, kind: &str, view: &str) {
        let record = self.base_record(kind).with_goal(view);
        let stamp = record.timestamp.to_rfc3339();
        self.handle.track(record.with_value(stamp));
    }

    /// Deliver everything pending now. Resolves with the cycle's aggregate
    /// outcome: true only if every session bucket was accepted.
    pub async fn flush(&self) -> bool {
        self.handle.flush().await
    }

    /// Wipe the durable queue. Returns the number of events removed.
    pub async fn clear_all(&self) -> Result<usize, PipelineError> {
        self.handle.clear_all().await
    }

    /// Tell the pipeline the app came to the foreground, resetting delivery
    /// backoff.
    pub fn app_became_active(&self) {
        self.handle.app_became_active();
    }

    pub async fn pending_count(&self) -> Result<u64, PipelineError> {
        self.handle.pending_count().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    /// Stop the pipeline worker. Undelivered events stay in the store for
    /// the next launch.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sdk(remote: Arc<StaticConfig>, transport: Arc<MockTransport>) -> Analytics {
        Analytics::with_transport(AnalyticsConfig::default(), remote, transport).unwrap()
    }

    fn loaded() -> Arc<StaticConfig> {
        Arc::new(StaticConfig::loaded(SessionId::from_raw("S1")))
    }

    #[tokio::test]
    async fn track_and_flush_end_to_end() {
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(loaded(), Arc::clone(&transport));

        analytics.track("signup", Some(EventValue::from(1u64)), None);
        analytics.track("checkout", None, Some(json!({ "cart_size": 3 })));
        assert!(analytics.flush().await);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].session_id.as_str(), "S1");
        assert_eq!(calls[0].events.len(), 2);
        assert_eq!(calls[0].events[0].kind, "goalAchieved");
        assert_eq!(calls[0].events[0].goal_name.as_deref(), Some("signup"));
        assert_eq!(
            calls[0].events[1].metadata.as_ref().unwrap()["cart_size"],
            3
        );
        assert_eq!(analytics.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_errors_deliver_once_with_count() {
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(loaded(), Arc::clone(&transport));

        for _ in 0..5 {
            analytics.track_error("payment declined", Some("card expired"), true);
        }
        assert!(analytics.flush().await);

        let posted = transport.posted_events();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].kind, "error");
        assert_eq!(posted[0].value, Some(EventValue::Number(5.0)));
        assert_eq!(
            posted[0].metadata.as_ref().unwrap()["detail"],
            "card expired"
        );
    }

    #[tokio::test]
    async fn local_only_errors_never_persisted_or_delivered() {
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(loaded(), Arc::clone(&transport));

        analytics.track_error("debug overlay glitch", None, false);
        assert_eq!(analytics.pending_count().await.unwrap(), 0);

        assert!(analytics.flush().await);
        assert_eq!(transport.call_count(), 0);
        assert_eq!(analytics.stats().tracked, 0);
    }

    #[tokio::test]
    async fn view_events_carry_capture_time_value() {
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(loaded(), Arc::clone(&transport));

        analytics.track_view_appeared("CheckoutScreen");
        analytics.track_view_disappeared("CheckoutScreen");
        assert!(analytics.flush().await);

        let posted = transport.posted_events();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].kind, "viewAppeared");
        assert_eq!(posted[1].kind, "viewDisappeared");
        for event in &posted {
            assert_eq!(event.goal_name.as_deref(), Some("CheckoutScreen"));
            match &event.value {
                Some(EventValue::Text(stamp)) => {
                    chrono_parse_ok(stamp);
                }
                other => panic!("expected timestamp value, got {other:?}"),
            }
        }
    }

    fn chrono_parse_ok(stamp: &str) {
        assert!(
            chrono::DateTime::parse_from_rfc3339(stamp).is_ok(),
            "bad timestamp value: {stamp}"
        );
    }

    #[tokio::test]
    async fn external_source_events_tagged_with_source() {
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(loaded(), Arc::clone(&transport));

        analytics.track_from_source(
            "firebase",
            "level_complete",
            Some(EventValue::from(12u64)),
            Some(json!({ "level": "12" })),
        );
        assert!(analytics.flush().await);

        let posted = transport.posted_events();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].kind, "externalEvent");
        assert_eq!(posted[0].goal_name.as_deref(), Some("level_complete"));
        let meta = posted[0].metadata.as_ref().unwrap();
        assert_eq!(meta["source"], "firebase");
        assert_eq!(meta["level"], "12");
    }

    #[tokio::test]
    async fn live_mode_marks_events_non_production() {
        let remote = loaded();
        remote.set_live_mode(true);
        let transport = Arc::new(MockTransport::delivering());
        let analytics = sdk(remote, Arc::clone(&transport));

        analytics.track("signup", None, None);
        assert!(analytics.flush().await);
        assert!(!transport.posted_events()[0].is_production);
    }

    #[tokio::test]
    async fn clear_on_start_wipes_previous_run() {
        let dir = std::env::temp_dir().join(format!(
            "pulse-sdk-test-{}",
            uuid::Uuid::now_v7()
        ));
        let config = AnalyticsConfig {
            storage_path: Some(dir.join("events.db")),
            ..AnalyticsConfig::default()
        };

        let transport = Arc::new(MockTransport::delivering());
        let first = Analytics::with_transport(
            config.clone(),
            loaded(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        )
        .unwrap();
        first.track("signup", None, None);
        assert_eq!(first.pending_count().await.unwrap(), 1);
        first.shutdown().await;

        let second = Analytics::with_transport(
            AnalyticsConfig {
                clear_on_start: true,
                ..config
            },
            loaded(),
            transport,
        )
        .unwrap();
        assert_eq!(second.pending_count().await.unwrap(), 0);
        second.shutdown().await;

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn encrypted_store_round_trips_events() {
        let dir = std::env::temp_dir().join(format!(
            "pulse-sdk-cipher-test-{}",
            uuid::Uuid::now_v7()
        ));
        let config = AnalyticsConfig {
            storage_path: Some(dir.join("events.db")),
            key_path: Some(dir.join("at_rest_key")),
            ..AnalyticsConfig::default()
        };

        let transport = Arc::new(MockTransport::delivering());
        let analytics =
            Analytics::with_transport(config, loaded(), Arc::clone(&transport) as _).unwrap();

        analytics.track("signup", None, Some(json!({ "plan": "pro" })));
        assert!(analytics.flush().await);

        let posted = transport.posted_events();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].metadata.as_ref().unwrap()["plan"], "pro");

        analytics.shutdown().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
