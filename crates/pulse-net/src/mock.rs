use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pulse_core::{DeliveryError, DeliveryOutcome, EventRecord, EventTransport, SessionId};

/// Pre-programmed outcomes for deterministic testing without a server.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Accept the batch.
    Deliver,
    /// Reject the batch with the given error.
    Fail(DeliveryError),
    /// Wait a duration, then resolve to the inner outcome.
    Delay(Duration, Box<MockOutcome>),
}

impl MockOutcome {
    pub fn fail_network() -> Self {
        Self::Fail(DeliveryError::Network("connection reset".into()))
    }

    pub fn fail_server(status: u16) -> Self {
        Self::Fail(DeliveryError::from_status(status, "mock rejection"))
    }

    pub fn delayed(delay: Duration, inner: MockOutcome) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One observed delivery call.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub session_id: SessionId,
    pub events: Vec<EventRecord>,
}

/// Transport double that consumes scripted outcomes in order and records
/// every call. When the script runs out, batches are accepted.
pub struct MockTransport {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// A transport that accepts everything.
    pub fn delivering() -> Self {
        Self::new(Vec::new())
    }

    /// Extend the script after construction.
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Every event posted so far, across all calls, in dispatch order.
    pub fn posted_events(&self) -> Vec<EventRecord> {
        self.calls
            .lock()
            .iter()
            .flat_map(|call| call.events.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl EventTransport for MockTransport {
    async fn post_event_batch(
        &self,
        session_id: &SessionId,
        events: &[EventRecord],
    ) -> DeliveryOutcome {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            session_id: session_id.clone(),
            events: events.to_vec(),
        });

        let mut outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Deliver);

        loop {
            match outcome {
                MockOutcome::Deliver => return DeliveryOutcome::Delivered,
                MockOutcome::Fail(error) => return DeliveryOutcome::Failed(error),
                MockOutcome::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    outcome = *inner;
                }
            }
        }
    }
}
