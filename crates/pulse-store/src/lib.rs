//! Durable storage for pending analytics events.
//!
//! Events are encoded to opaque strings (plain JSON or encrypted) and held
//! in a bounded SQLite-backed FIFO until the pipeline delivers them.

pub mod codec;
pub mod database;
pub mod error;
pub mod queue;
pub mod schema;

pub use codec::{generate_key, load_or_create_key, CipherCodec, PlainCodec, RecordCodec};
pub use database::Database;
pub use error::StoreError;
pub use queue::{EventQueue, QueueConfig, DEFAULT_EVICT_TO, DEFAULT_MAX_PENDING};
