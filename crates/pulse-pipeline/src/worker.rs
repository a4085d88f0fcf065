use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pulse_core::record::KIND_ERROR;
use pulse_core::{
    resolve_session, ConfigLoadState, DeliveryOutcome, EventRecord, EventTransport, EventValue,
    RemoteConfig,
};
use pulse_store::EventQueue;
use pulse_telemetry::{PipelineStats, StatsSnapshot};

use crate::backoff::{BackoffConfig, BackoffController};
use crate::bucket::bucket_by_session;
use crate::dedup::{ErrorDeduper, Observation};
use crate::error::PipelineError;
use crate::gate::PendingGate;

/// Records taken from the store per flush cycle.
pub const DEFAULT_DRAIN_BATCH: usize = 100;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub drain_batch: usize,
    pub backoff: BackoffConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_batch: DEFAULT_DRAIN_BATCH,
            backoff: BackoffConfig::default(),
        }
    }
}

enum Command {
    Track(EventRecord),
    Flush(Option<oneshot::Sender<bool>>),
    TimerFired(u64),
    GateReleased,
    BucketDone {
        records: Vec<EventRecord>,
        delivered: bool,
    },
    AppBecameActive,
    PendingCount(oneshot::Sender<Result<u64, PipelineError>>),
    ClearAll(oneshot::Sender<Result<usize, PipelineError>>),
    Shutdown(oneshot::Sender<()>),
}

/// One in-flight flush: how many buckets are still out, whether any failed,
/// and who to tell when the last one reports.
struct FlushCycle {
    in_flight: usize,
    all_delivered: bool,
    notifiers: Vec<oneshot::Sender<bool>>,
}

enum FlushState {
    Idle,
    Scheduled,
    Flushing(FlushCycle),
}

/// Caller-side handle to the pipeline worker. Cheap to clone; every method
/// submits a command to the single serialized worker task rather than
/// touching pipeline state directly.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Hand one event to the pipeline. Never blocks; a closed worker means
    /// shutdown already ran and the event is discarded with a warning.
    pub fn track(&self, record: EventRecord) {
        if self.tx.send(Command::Track(record)).is_err() {
            warn!("event tracked after pipeline shutdown, discarding");
        }
    }

    /// Trigger a flush and wait for the cycle's aggregate outcome. A flush
    /// already in flight is joined, not duplicated.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(Some(done_tx))).is_err() {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    pub async fn pending_count(&self) -> Result<u64, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::PendingCount(reply_tx))
            .map_err(|_| PipelineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }

    /// Administrative wipe of the durable store. Returns the removed count.
    pub async fn clear_all(&self) -> Result<usize, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::ClearAll(reply_tx))
            .map_err(|_| PipelineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }

    /// App-foreground lifecycle signal: resets the delivery failure counter.
    pub fn app_became_active(&self) {
        let _ = self.tx.send(Command::AppBecameActive);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the worker. Pending events stay in the durable store for the
    /// next launch; that is the point of persisting them.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// The single serialized worker owning all mutable pipeline state: the
/// durable queue, the dedup map, the backoff counter, the pending gate, and
/// the flush state machine. Commands execute strictly in submission order;
/// network completions re-enter the queue as commands, so store reads and
/// writes never interleave.
pub struct PipelineWorker {
    queue: EventQueue,
    remote: Arc<dyn RemoteConfig>,
    transport: Arc<dyn EventTransport>,
    stats: Arc<PipelineStats>,
    config: PipelineConfig,
    tx: mpsc::UnboundedSender<Command>,

    state: FlushState,
    backoff: BackoffController,
    deduper: ErrorDeduper,
    gate: PendingGate,
    timer: Option<CancellationToken>,
    timer_generation: u64,
}

impl PipelineWorker {
    /// Spawn the worker task and return its handle.
    pub fn spawn(
        queue: EventQueue,
        remote: Arc<dyn RemoteConfig>,
        transport: Arc<dyn EventTransport>,
        stats: Arc<PipelineStats>,
        config: PipelineConfig,
    ) -> PipelineHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Self {
            queue,
            remote,
            transport,
            stats: Arc::clone(&stats),
            backoff: BackoffController::new(config.backoff.clone()),
            config,
            tx: tx.clone(),
            state: FlushState::Idle,
            deduper: ErrorDeduper::new(),
            gate: PendingGate::new(),
            timer: None,
            timer_generation: 0,
        };
        tokio::spawn(worker.run(rx));

        PipelineHandle { tx, stats }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Track(record) => self.handle_track(record),
                Command::Flush(notifier) => self.handle_flush(notifier),
                Command::TimerFired(generation) => self.handle_timer_fired(generation),
                Command::GateReleased => self.handle_gate_released(),
                Command::BucketDone { records, delivered } => {
                    self.handle_bucket_done(records, delivered)
                }
                Command::AppBecameActive => self.backoff.reset(),
                Command::PendingCount(reply) => {
                    let count = self.queue.count().map(|n| n.max(0) as u64);
                    let _ = reply.send(count.map_err(PipelineError::from));
                }
                Command::ClearAll(reply) => {
                    let _ = reply.send(self.queue.clear().map_err(PipelineError::from));
                }
                Command::Shutdown(ack) => {
                    self.cancel_timer();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("pipeline worker stopped");
    }

    fn handle_track(&mut self, record: EventRecord) {
        let filters = self.remote.disabled_filters(&record.kind);
        if filters.iter().any(|f| f.matches(record.metadata.as_ref())) {
            self.stats.record_suppressed();
            debug!(kind = %record.kind, "event suppressed by server filter");
            return;
        }
        self.stats.record_tracked();

        // Config not settled yet: hold the event in memory and arm the gate
        // listener (once) to move everything to the store when it settles.
        if self.remote.load_state() == ConfigLoadState::Pending {
            self.gate.push(record);
            if self.gate.arm() {
                let remote = Arc::clone(&self.remote);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    remote.wait_until_settled().await;
                    let _ = tx.send(Command::GateReleased);
                });
            }
            return;
        }

        if let Err(e) = self.queue.append(&record) {
            warn!(error = %e, kind = %record.kind, "failed to persist event");
            return;
        }
        if matches!(self.state, FlushState::Idle) {
            self.ensure_scheduled();
        }
    }

    fn handle_flush(&mut self, notifier: Option<oneshot::Sender<bool>>) {
        match &mut self.state {
            // At most one flush in flight: the trigger joins the running
            // cycle's completion set and no second drain starts.
            FlushState::Flushing(cycle) => {
                debug!("flush requested while a cycle is in flight, joining it");
                if let Some(tx) = notifier {
                    cycle.notifiers.push(tx);
                }
            }
            FlushState::Idle | FlushState::Scheduled => {
                self.cancel_timer();
                self.start_flush(notifier.into_iter().collect());
            }
        }
    }

    fn handle_timer_fired(&mut self, generation: u64) {
        if generation != self.timer_generation {
            debug!(generation, "stale flush timer fired, ignoring");
            return;
        }
        self.timer = None;
        if matches!(self.state, FlushState::Flushing(_)) {
            return;
        }
        self.start_flush(Vec::new());
    }

    fn handle_gate_released(&mut self) {
        let mut records = self.gate.release();
        if records.is_empty() {
            return;
        }
        debug!(count = records.len(), "config settled, persisting gated events");

        // The session may only have become known while these sat in memory.
        for record in &mut records {
            if record.session_id.is_none() {
                record.session_id = resolve_session(self.remote.as_ref());
            }
        }

        if let Err(e) = self.queue.append_all(&records) {
            warn!(error = %e, lost = records.len(), "failed to persist gated events");
            return;
        }
        if matches!(self.state, FlushState::Idle) {
            self.ensure_scheduled();
        }
    }

    fn start_flush(&mut self, notifiers: Vec<oneshot::Sender<bool>>) {
        self.stats.record_flush_attempt();

        let drained = match self.queue.drain(self.config.drain_batch) {
            Ok(drained) => drained,
            Err(e) => {
                warn!(error = %e, "drain failed, will retry on the next cycle");
                for tx in notifiers {
                    let _ = tx.send(false);
                }
                self.state = FlushState::Idle;
                self.ensure_scheduled();
                return;
            }
        };

        // Collapse repeated error messages, then tag each surviving error
        // record with its accumulated count. Two passes so repeats later in
        // the batch land on the survivor's tally.
        let mut survivors = Vec::with_capacity(drained.len());
        for record in drained {
            if let Some(message) = error_message_key(&record) {
                let prior = record
                    .value
                    .as_ref()
                    .and_then(EventValue::as_number)
                    .map(|n| n as u64);
                if self.deduper.observe(&message, prior) == Observation::Suppress {
                    self.stats.record_deduplicated();
                    continue;
                }
            }
            survivors.push(record);
        }
        for record in &mut survivors {
            if let Some(message) = error_message_key(record) {
                let count = self.deduper.take_count(&message);
                record.value = Some(EventValue::Number(count as f64));
            }
        }

        let timed_out = self.remote.load_state() == ConfigLoadState::TimedOut;
        let buckets = bucket_by_session(survivors, timed_out);

        if !buckets.dropped.is_empty() {
            self.stats.record_dropped(buckets.dropped.len() as u64);
            warn!(
                dropped = buckets.dropped.len(),
                "dropping sessionless events after session load timeout"
            );
        }
        if !buckets.requeue.is_empty() {
            debug!(
                requeued = buckets.requeue.len(),
                "sessionless events written back until a session arrives"
            );
            if let Err(e) = self.queue.append_all(&buckets.requeue) {
                warn!(error = %e, lost = buckets.requeue.len(), "failed to requeue sessionless events");
            }
        }

        if buckets.is_empty() {
            // Nothing to deliver: short-circuit the cycle with success.
            self.state = FlushState::Flushing(FlushCycle {
                in_flight: 0,
                all_delivered: true,
                notifiers,
            });
            self.complete_cycle();
            return;
        }

        self.state = FlushState::Flushing(FlushCycle {
            in_flight: buckets.by_session.len(),
            all_delivered: true,
            notifiers,
        });

        // One concurrent delivery per session; outcomes re-enter the worker
        // as commands in whatever order they resolve.
        for (session, records) in buckets.by_session {
            let transport = Arc::clone(&self.transport);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let outcome = transport.post_event_batch(&session, &records).await;
                let delivered = outcome.is_delivered();
                if let DeliveryOutcome::Failed(error) = &outcome {
                    warn!(
                        session = %session,
                        kind = error.error_kind(),
                        error = %error,
                        batch = records.len(),
                        "bucket delivery failed"
                    );
                }
                let _ = tx.send(Command::BucketDone { records, delivered });
            });
        }
    }

    fn handle_bucket_done(&mut self, records: Vec<EventRecord>, delivered: bool) {
        let cycle_done = match &mut self.state {
            FlushState::Flushing(cycle) => {
                if !delivered {
                    cycle.all_delivered = false;
                }
                cycle.in_flight -= 1;
                cycle.in_flight == 0
            }
            _ => {
                warn!("bucket outcome arrived outside a flush cycle, ignoring");
                return;
            }
        };

        if delivered {
            self.backoff.record_success();
            self.stats.record_delivered(records.len() as u64);
        } else {
            self.backoff.record_failure();
            self.stats.record_requeued(records.len() as u64);
            // Failed sends go back to the store; the events are only ever
            // duplicated by a retry, never lost.
            if let Err(e) = self.queue.append_all(&records) {
                self.stats.record_dropped(records.len() as u64);
                warn!(error = %e, lost = records.len(), "failed to requeue undelivered bucket");
            }
        }

        if cycle_done {
            self.complete_cycle();
        }
    }

    fn complete_cycle(&mut self) {
        let cycle = match std::mem::replace(&mut self.state, FlushState::Idle) {
            FlushState::Flushing(cycle) => cycle,
            other => {
                self.state = other;
                return;
            }
        };

        if !cycle.all_delivered {
            self.stats.record_flush_failure();
        }
        for tx in cycle.notifiers {
            let _ = tx.send(cycle.all_delivered);
        }

        match self.queue.count() {
            Ok(pending) if pending > 0 => {
                debug!(pending, "events still pending after flush, rescheduling");
                self.ensure_scheduled();
            }
            Ok(_) => debug!("flush cycle complete, store empty"),
            Err(e) => {
                warn!(error = %e, "could not read pending count after flush");
                self.ensure_scheduled();
            }
        }
    }

    /// Arm the next-flush timer. A pending timer is the canonical marker of
    /// the next flush; scheduling over one is a no-op.
    fn ensure_scheduled(&mut self) {
        if self.timer.is_some() || matches!(self.state, FlushState::Flushing(_)) {
            return;
        }

        let delay = self
            .backoff
            .delay(self.remote.is_live_mode(), self.remote.reporting_interval());
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::TimerFired(generation));
                }
            }
        });

        self.timer = Some(token);
        self.state = FlushState::Scheduled;
        debug!(
            delay_ms = delay.as_millis() as u64,
            failures = self.backoff.failures(),
            "next flush scheduled"
        );
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
        // A fire already in the command queue carries the old generation.
        self.timer_generation += 1;
    }
}

/// Error records are keyed by the message in their metadata; everything
/// else is exempt from dedup.
fn error_message_key(record: &EventRecord) -> Option<String> {
    if record.kind != KIND_ERROR {
        return None;
    }
    record
        .metadata
        .as_ref()?
        .get("message")?
        .as_str()
        .map(str::to_owned)
}
