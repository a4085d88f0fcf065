use std::collections::HashMap;

/// Dedup verdict for one error record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// First occurrence in this window: forward the record for delivery.
    Deliver,
    /// A prior instance is still pending; the repeat was counted and the
    /// record itself should be discarded.
    Suppress,
}

#[derive(Debug, Default)]
struct Slot {
    pending: bool,
    count: u64,
}

/// Collapses repeated identical error messages into one counted record per
/// flush window. The map lives only in memory; a process death while a
/// message is pending resets its count, which the delivery contract accepts.
#[derive(Debug, Default)]
pub struct ErrorDeduper {
    slots: HashMap<String, Slot>,
}

impl ErrorDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one error record. `prior_count` carries the accumulated count
    /// of a record that was already tagged once and then requeued after a
    /// failed delivery, so the tally survives the retry.
    pub fn observe(&mut self, message: &str, prior_count: Option<u64>) -> Observation {
        let slot = self.slots.entry(message.to_owned()).or_default();
        if slot.pending {
            slot.count += 1;
            Observation::Suppress
        } else {
            slot.pending = true;
            slot.count = prior_count.unwrap_or(1).max(1);
            Observation::Deliver
        }
    }

    /// Consume the accumulated count for a message being placed into a send
    /// batch. Clears the pending mark so the next occurrence opens a fresh
    /// window.
    pub fn take_count(&mut self, message: &str) -> u64 {
        match self.slots.remove(message) {
            Some(slot) => slot.count.max(1),
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_delivers() {
        let mut dedup = ErrorDeduper::new();
        assert_eq!(dedup.observe("boom", None), Observation::Deliver);
        assert_eq!(dedup.take_count("boom"), 1);
    }

    #[test]
    fn repeats_suppressed_and_counted() {
        let mut dedup = ErrorDeduper::new();
        assert_eq!(dedup.observe("boom", None), Observation::Deliver);
        for _ in 0..4 {
            assert_eq!(dedup.observe("boom", None), Observation::Suppress);
        }
        assert_eq!(dedup.take_count("boom"), 5);
    }

    #[test]
    fn take_opens_a_fresh_window() {
        let mut dedup = ErrorDeduper::new();
        dedup.observe("boom", None);
        dedup.observe("boom", None);
        assert_eq!(dedup.take_count("boom"), 2);

        // After the batch went out, the same message starts over.
        assert_eq!(dedup.observe("boom", None), Observation::Deliver);
        assert_eq!(dedup.take_count("boom"), 1);
    }

    #[test]
    fn distinct_messages_tracked_independently() {
        let mut dedup = ErrorDeduper::new();
        assert_eq!(dedup.observe("boom", None), Observation::Deliver);
        assert_eq!(dedup.observe("crash", None), Observation::Deliver);
        assert_eq!(dedup.observe("boom", None), Observation::Suppress);

        assert_eq!(dedup.take_count("boom"), 2);
        assert_eq!(dedup.take_count("crash"), 1);
    }

    #[test]
    fn prior_count_seeds_requeued_record() {
        let mut dedup = ErrorDeduper::new();
        // A record tagged 5 on a cycle that failed delivery comes back.
        assert_eq!(dedup.observe("boom", Some(5)), Observation::Deliver);
        assert_eq!(dedup.observe("boom", None), Observation::Suppress);
        assert_eq!(dedup.take_count("boom"), 6);
    }

    #[test]
    fn take_without_observe_is_one() {
        let mut dedup = ErrorDeduper::new();
        assert_eq!(dedup.take_count("never seen"), 1);
    }
}
