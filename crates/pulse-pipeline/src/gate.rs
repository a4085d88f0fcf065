use pulse_core::EventRecord;

/// In-memory holding area for events tracked before the remote config has
/// settled. Owned by the pipeline worker; nothing here is durable until the
/// gate releases into the store.
#[derive(Debug, Default)]
pub struct PendingGate {
    buffer: Vec<EventRecord>,
    armed: bool,
}

impl PendingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EventRecord) {
        self.buffer.push(record);
    }

    /// Returns true exactly once per wait: the caller should spawn the
    /// release listener on true and do nothing on false.
    pub fn arm(&mut self) -> bool {
        if self.armed {
            return false;
        }
        self.armed = true;
        true
    }

    /// Take everything buffered, in arrival order, and disarm.
    pub fn release(&mut self) -> Vec<EventRecord> {
        self.armed = false;
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
