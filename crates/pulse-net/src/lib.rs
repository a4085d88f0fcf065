//! Ingest transports: the reqwest-backed HTTP transport used in production
//! and a scripted mock for pipeline tests.

pub mod http;
pub mod mock;

pub use http::HttpTransport;
pub use mock::{MockOutcome, MockTransport, RecordedCall};
