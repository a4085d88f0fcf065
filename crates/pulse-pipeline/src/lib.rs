//! The flush pipeline: a single worker task that owns the durable queue and
//! drives the drain → bucket → deliver → requeue cycle under backoff.

pub mod backoff;
pub mod bucket;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod worker;

pub use backoff::{BackoffConfig, BackoffController};
pub use bucket::{bucket_by_session, Buckets};
pub use dedup::{ErrorDeduper, Observation};
pub use error::PipelineError;
pub use gate::PendingGate;
pub use worker::{PipelineConfig, PipelineHandle, PipelineWorker, DEFAULT_DRAIN_BATCH};
