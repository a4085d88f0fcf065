use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use pulse_core::EventRecord;

use crate::codec::RecordCodec;
use crate::database::Database;
use crate::error::StoreError;

/// Hard cap on pending records.
pub const DEFAULT_MAX_PENDING: usize = 1000;
/// Count the store is trimmed to when the cap is reached. Evicting in a
/// batch of 50 keeps the boundary from triggering a delete on every append.
pub const DEFAULT_EVICT_TO: usize = 950;

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub max_pending: usize,
    pub evict_to: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            evict_to: DEFAULT_EVICT_TO,
        }
    }
}

/// Durable FIFO of events awaiting delivery. Rows are opaque encoded strings
/// sorted by capture time, with the rowid sequence breaking ties so batch
/// re-appends keep their original order.
pub struct EventQueue {
    db: Database,
    codec: Arc<dyn RecordCodec>,
    config: QueueConfig,
}

impl EventQueue {
    pub fn new(db: Database, codec: Arc<dyn RecordCodec>) -> Self {
        Self::with_config(db, codec, QueueConfig::default())
    }

    pub fn with_config(db: Database, codec: Arc<dyn RecordCodec>, config: QueueConfig) -> Self {
        Self { db, codec, config }
    }

    /// Append one record, evicting the oldest `count - evict_to` rows first
    /// when the store is at capacity.
    #[instrument(skip(self, record), fields(kind = %record.kind))]
    pub fn append(&self, record: &EventRecord) -> Result<(), StoreError> {
        let body = self.codec.encode(record)?;
        let captured_at = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let mut count = current_count(conn)?;
            self.insert_locked(conn, &captured_at, &body, &mut count)
        })
    }

    /// Append a batch in order, under one lock hold. Used when the gate
    /// releases buffered events and when a failed bucket is requeued.
    #[instrument(skip(self, records), fields(batch = records.len()))]
    pub fn append_all(&self, records: &[EventRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut bodies = Vec::with_capacity(records.len());
        for record in records {
            bodies.push(self.codec.encode(record)?);
        }
        let captured_at = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let mut count = current_count(conn)?;
            for body in &bodies {
                self.insert_locked(conn, &captured_at, body, &mut count)?;
            }
            Ok(())
        })
    }

    /// Read up to `max_batch` oldest records and remove exactly the rows
    /// read. Undecodable rows are skipped and removed with the rest, so a
    /// corrupt row can never wedge the queue.
    #[instrument(skip(self))]
    pub fn drain(&self, max_batch: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, body FROM pending_events
                 ORDER BY captured_at ASC, seq ASC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query([max_batch as i64])?;

            let mut seqs: Vec<i64> = Vec::new();
            let mut records = Vec::new();
            let mut skipped = 0usize;
            while let Some(row) = rows.next()? {
                let seq: i64 = row.get(0)?;
                let body: String = row.get(1)?;
                seqs.push(seq);
                match self.codec.decode(&body) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        skipped += 1;
                        warn!(seq, error = %e, "skipping undecodable pending event");
                    }
                }
            }
            drop(rows);
            drop(stmt);

            if !seqs.is_empty() {
                let placeholders = vec!["?"; seqs.len()].join(", ");
                let sql = format!("DELETE FROM pending_events WHERE seq IN ({placeholders})");
                conn.execute(&sql, rusqlite::params_from_iter(seqs.iter()))?;
            }
            if skipped > 0 {
                debug!(drained = records.len(), skipped, "drain dropped undecodable rows");
            }
            Ok(records)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(current_count)
    }

    /// Administrative wipe. Returns the number of rows removed.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM pending_events", [])?;
            info!(deleted, "cleared pending event store");
            Ok(deleted)
        })
    }

    fn insert_locked(
        &self,
        conn: &Connection,
        captured_at: &str,
        body: &str,
        count: &mut i64,
    ) -> Result<(), StoreError> {
        if *count >= self.config.max_pending as i64 {
            let excess = *count - self.config.evict_to as i64;
            let evicted = conn.execute(
                "DELETE FROM pending_events WHERE seq IN (
                     SELECT seq FROM pending_events
                     ORDER BY captured_at ASC, seq ASC
                     LIMIT ?1)",
                [excess],
            )?;
            *count -= evicted as i64;
            warn!(evicted, pending = *count, "pending event cap reached, evicted oldest");
        }
        conn.execute(
            "INSERT INTO pending_events (captured_at, body) VALUES (?1, ?2)",
            rusqlite::params![captured_at, body],
        )?;
        *count += 1;
        Ok(())
    }
}

fn current_count(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_events", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{generate_key, CipherCodec, PlainCodec};
    use pulse_core::record::KIND_GOAL_ACHIEVED;
    use pulse_core::SessionId;

    fn queue() -> EventQueue {
        EventQueue::new(Database::in_memory().unwrap(), Arc::new(PlainCodec))
    }

    fn numbered(n: usize) -> EventRecord {
        EventRecord::new(KIND_GOAL_ACHIEVED, true)
            .with_goal(n.to_string())
            .with_session(Some(SessionId::from_raw("S1")))
    }

    fn goal(record: &EventRecord) -> usize {
        record.goal_name.as_ref().unwrap().parse().unwrap()
    }

    #[test]
    fn append_and_count() {
        let q = queue();
        assert_eq!(q.count().unwrap(), 0);
        q.append(&numbered(0)).unwrap();
        q.append(&numbered(1)).unwrap();
        assert_eq!(q.count().unwrap(), 2);
    }

    #[test]
    fn drain_returns_original_order_then_exhausts() {
        let q = queue();
        for n in 0..3 {
            q.append(&numbered(n)).unwrap();
        }

        let drained = q.drain(100).unwrap();
        assert_eq!(drained.len(), 3);
        for (i, record) in drained.iter().enumerate() {
            assert_eq!(goal(record), i);
            assert_eq!(record.session_id.as_ref().unwrap().as_str(), "S1");
        }

        assert!(q.drain(100).unwrap().is_empty());
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn drain_respects_batch_limit() {
        let q = queue();
        for n in 0..5 {
            q.append(&numbered(n)).unwrap();
        }

        let first = q.drain(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(goal(&first[0]), 0);
        assert_eq!(goal(&first[1]), 1);
        assert_eq!(q.count().unwrap(), 3);

        let rest = q.drain(100).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(goal(&rest[0]), 2);
    }

    #[test]
    fn cap_evicts_oldest_in_batches() {
        let q = EventQueue::with_config(
            Database::in_memory().unwrap(),
            Arc::new(PlainCodec),
            QueueConfig {
                max_pending: 5,
                evict_to: 3,
            },
        );

        for n in 0..6 {
            q.append(&numbered(n)).unwrap();
        }

        // Sixth append found the store full: 0 and 1 were evicted first.
        assert_eq!(q.count().unwrap(), 4);
        let drained = q.drain(100).unwrap();
        let goals: Vec<usize> = drained.iter().map(goal).collect();
        assert_eq!(goals, vec![2, 3, 4, 5]);
    }

    #[test]
    fn default_cap_leaves_951_after_1001_appends() {
        let q = queue();
        for n in 0..1001 {
            q.append(&numbered(n)).unwrap();
        }

        assert_eq!(q.count().unwrap(), 951);
        // Records 0..=49 were evicted, oldest first.
        let oldest = q.drain(1).unwrap();
        assert_eq!(goal(&oldest[0]), 50);
    }

    #[test]
    fn append_all_preserves_order_through_drain() {
        let q = queue();
        q.append(&numbered(0)).unwrap();

        let batch: Vec<EventRecord> = (1..4).map(numbered).collect();
        q.append_all(&batch).unwrap();

        let drained = q.drain(100).unwrap();
        let goals: Vec<usize> = drained.iter().map(goal).collect();
        assert_eq!(goals, vec![0, 1, 2, 3]);
    }

    #[test]
    fn append_all_empty_is_noop() {
        let q = queue();
        q.append_all(&[]).unwrap();
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn malformed_row_skipped_and_removed() {
        let q = queue();
        q.append(&numbered(0)).unwrap();

        // Corrupt row wedged between two good ones.
        q.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO pending_events (captured_at, body) VALUES (?1, 'not json')",
                    [Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .unwrap();
        q.append(&numbered(1)).unwrap();

        let drained = q.drain(100).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(goal(&drained[0]), 0);
        assert_eq!(goal(&drained[1]), 1);

        // The corrupt row left the store with the batch.
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn cipher_queue_roundtrip() {
        let q = EventQueue::new(
            Database::in_memory().unwrap(),
            Arc::new(CipherCodec::new(generate_key())),
        );
        q.append(&numbered(7)).unwrap();

        let drained = q.drain(100).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(goal(&drained[0]), 7);
    }

    #[test]
    fn cipher_queue_drains_rows_written_plain() {
        let db = Database::in_memory().unwrap();
        let plain = EventQueue::new(db.clone(), Arc::new(PlainCodec));
        plain.append(&numbered(3)).unwrap();

        // Same database reopened with encryption turned on.
        let ciphered = EventQueue::new(db, Arc::new(CipherCodec::new(generate_key())));
        let drained = ciphered.drain(100).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(goal(&drained[0]), 3);
    }

    #[test]
    fn clear_removes_everything() {
        let q = queue();
        for n in 0..4 {
            q.append(&numbered(n)).unwrap();
        }
        assert_eq!(q.clear().unwrap(), 4);
        assert_eq!(q.count().unwrap(), 0);
        assert!(q.drain(100).unwrap().is_empty());
    }
}
