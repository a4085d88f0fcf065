use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ids::{EventId, SessionId};

/// Event kind tags understood by the backend.
pub const KIND_GOAL_ACHIEVED: &str = "goalAchieved";
pub const KIND_ERROR: &str = "error";
pub const KIND_VIEW_APPEARED: &str = "viewAppeared";
pub const KIND_VIEW_DISAPPEARED: &str = "viewDisappeared";
pub const KIND_EXTERNAL: &str = "externalEvent";

/// Metadata key that overrides the capture timestamp. Accepts an RFC 3339
/// string or an epoch-milliseconds number; anything else is ignored.
pub const TIMESTAMP_OVERRIDE_KEY: &str = "timestamp";

/// Scalar payload attached to an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Number(f64),
    Text(String),
}

impl EventValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl From<f64> for EventValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<u64> for EventValue {
    fn from(n: u64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for EventValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for EventValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A single tracked event, as persisted and as delivered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<EventValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub is_production: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_name: Option<String>,
}

impl EventRecord {
    pub fn new(kind: impl Into<String>, is_production: bool) -> Self {
        Self {
            id: EventId::new(),
            kind: kind.into(),
            timestamp: Utc::now(),
            value: None,
            metadata: None,
            session_id: None,
            is_production,
            goal_name: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<EventValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_goal(mut self, name: impl Into<String>) -> Self {
        self.goal_name = Some(name.into());
        self
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Attach caller metadata. Honors the timestamp override key, and drops
    /// the whole map when its serialized form exceeds `cap_bytes` — the event
    /// itself is always kept.
    pub fn with_metadata(mut self, metadata: serde_json::Value, cap_bytes: usize) -> Self {
        if let Some(ts) = timestamp_override(&metadata) {
            self.timestamp = ts;
        }

        let serialized_len = serde_json::to_string(&metadata).map(|s| s.len()).unwrap_or(0);
        if serialized_len > cap_bytes {
            warn!(
                kind = %self.kind,
                bytes = serialized_len,
                cap = cap_bytes,
                "event metadata over size cap, dropping metadata"
            );
            return self;
        }

        self.metadata = Some(metadata);
        self
    }
}

/// Extract a timestamp override from metadata, if present and parseable.
fn timestamp_override(metadata: &serde_json::Value) -> Option<DateTime<Utc>> {
    match metadata.get(TIMESTAMP_OVERRIDE_KEY)? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}
