use pulse_core::{EventRecord, SessionId};

/// One drained batch grouped for delivery.
#[derive(Debug, Default)]
pub struct Buckets {
    /// One entry per session, in order of first appearance; records keep
    /// their drain order within an entry.
    pub by_session: Vec<(SessionId, Vec<EventRecord>)>,
    /// Records with no session while one may still arrive. These go back
    /// into the store instead of a bucket.
    pub requeue: Vec<EventRecord>,
    /// Records with no session after the session load timed out. The one
    /// intentional data-loss path.
    pub dropped: Vec<EventRecord>,
}

impl Buckets {
    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

/// Group records by the session id stamped at write time. A record that
/// never got a session is requeued until the remote config definitively
/// reports the session load timed out, after which it is dropped.
pub fn bucket_by_session(records: Vec<EventRecord>, session_timed_out: bool) -> Buckets {
    let mut buckets = Buckets::default();

    for record in records {
        let Some(session) = record.session_id.clone() else {
            if session_timed_out {
                buckets.dropped.push(record);
            } else {
                buckets.requeue.push(record);
            }
            continue;
        };

        match buckets.by_session.iter_mut().find(|(s, _)| *s == session) {
            Some((_, bucket)) => bucket.push(record),
            None => buckets.by_session.push((session, vec![record])),
        }
    }

    buckets
}
