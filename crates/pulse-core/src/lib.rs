pub mod config;
pub mod errors;
pub mod ids;
pub mod record;
pub mod transport;

pub use config::{resolve_session, ConfigLoadState, EventFilter, RemoteConfig, StaticConfig};
pub use errors::DeliveryError;
pub use ids::{EventId, SessionId};
pub use record::{EventRecord, EventValue};
pub use transport::{ApiKey, DeliveryOutcome, EventTransport};
