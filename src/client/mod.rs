//! Per-camera event delivery.
//!
//! The pipeline hands events to an `EventSink` (bounded, never blocks). A flush
//! thread groups them into `EventBatch`es every `flush_interval` or as soon as
//! `max_batch` events are waiting, and a `Dispatcher` delivers each batch or
//! spills it to the durable `BatchStore`. A heartbeat thread reports liveness
//! on its own schedule; a successful heartbeat cuts the delivery backoff short.
//!
//! Ordering: once anything is buffered, or a backoff wait is pending, new
//! batches go to the back of the buffer and replay drains it oldest first, so
//! the collector sees batches in generation order.

mod backoff;
mod buffer;

pub use backoff::{Backoff, BackoffPolicy};
pub use buffer::{BatchStore, BufferedBatch, InMemoryBatchStore, SqliteBatchStore};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::event::{Event, EventBatch};
use crate::fault::Fault;
use crate::status::CameraStatus;
use crate::transport::{Collector, Heartbeat};
use crate::join_within;

/// Upper bound on how long the flush thread waits before re-checking stop and replay.
const TICK: Duration = Duration::from_millis(100);

const LEASE_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub struct DeliverySettings {
    pub flush_interval: Duration,
    pub max_batch: usize,
    /// Capacity of the pipeline -> client handoff queue, in events.
    pub handoff_capacity: usize,
    pub backoff: BackoffPolicy,
    /// Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    pub max_buffered_batches: u64,
    /// Buffered batches replayed per flush tick.
    pub replay_burst: usize,
    pub shutdown_grace: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            max_batch: 500,
            handoff_capacity: 10_000,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(10),
            max_buffered_batches: 20_000,
            replay_burst: 50,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Handoff
// ----------------------------------------------------------------------------

/// Pipeline-side handle of the handoff queue.
#[derive(Clone)]
pub struct EventSink {
    camera_id: Arc<str>,
    tx: SyncSender<Event>,
    status: Option<Arc<CameraStatus>>,
}

/// Bounded handoff queue without a client attached, for tests and tools.
pub fn event_channel(camera_id: &str, capacity: usize) -> (EventSink, Receiver<Event>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        EventSink {
            camera_id: Arc::from(camera_id),
            tx,
            status: None,
        },
        rx,
    )
}

impl EventSink {
    fn with_status(mut self, status: Arc<CameraStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Non-blocking handoff. Returns `false` if the event was dropped.
    pub fn submit(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                if let Some(status) = &self.status {
                    status.record_events_emitted(1);
                }
                true
            }
            Err(TrySendError::Full(event)) => {
                log::warn!(
                    "[{}] handoff queue full, dropped {} event {}",
                    self.camera_id,
                    event.kind(),
                    event.event_id()
                );
                self.record_drop();
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                log::warn!(
                    "[{}] event client stopped, dropped {} event {}",
                    self.camera_id,
                    event.kind(),
                    event.event_id()
                );
                self.record_drop();
                false
            }
        }
    }

    fn record_drop(&self) {
        if let Some(status) = &self.status {
            status.record_event_dropped();
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatcher: delivery state machine
// ----------------------------------------------------------------------------

/// Delivers batches in order, buffering on failure.
///
/// All decisions take the current `Instant` as a parameter; the flush thread
/// is the only caller in production.
pub struct Dispatcher {
    camera_id: String,
    store: Box<dyn BatchStore>,
    collector: Arc<dyn Collector>,
    backoff: Backoff,
    max_buffered: u64,
    status: Arc<CameraStatus>,
}

impl Dispatcher {
    pub fn new(
        camera_id: &str,
        store: Box<dyn BatchStore>,
        collector: Arc<dyn Collector>,
        policy: BackoffPolicy,
        max_buffered: u64,
        status: Arc<CameraStatus>,
    ) -> Result<Self> {
        let mut dispatcher = Self {
            camera_id: camera_id.to_string(),
            store,
            collector,
            backoff: Backoff::new(policy),
            max_buffered: max_buffered.max(1),
            status,
        };
        let buffered = dispatcher.store.len()?;
        if buffered > 0 {
            log::info!(
                "[{}] {} buffered batch(es) from a previous run will be replayed",
                dispatcher.camera_id,
                buffered
            );
        }
        dispatcher.status.set_buffered_batches(buffered);
        Ok(dispatcher)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn buffered(&mut self) -> Result<u64> {
        self.store.len()
    }

    /// Sends a new batch, or appends it to the buffer when delivery must wait.
    pub fn dispatch(&mut self, batch: &EventBatch, now: Instant) -> Result<()> {
        let payload = batch.to_json()?;
        if self.store.is_empty()? && self.backoff.ready(now) {
            match self.collector.post_events(&payload) {
                Ok(()) => {
                    self.delivered();
                    log::debug!(
                        "[{}] delivered batch of {} event(s)",
                        self.camera_id,
                        batch.events.len()
                    );
                    return Ok(());
                }
                Err(err) => self.failed(&err, now),
            }
        }
        self.persist_payload(&payload, batch)
    }

    /// Appends a batch to the buffer without trying to send it.
    pub fn persist(&mut self, batch: &EventBatch) -> Result<()> {
        let payload = batch.to_json()?;
        self.persist_payload(&payload, batch)
    }

    fn persist_payload(&mut self, payload: &str, batch: &EventBatch) -> Result<()> {
        self.store
            .append(payload, batch.device_ts)
            .with_context(|| format!("[{}] buffer batch", self.camera_id))?;
        let evicted = self.store.evict_to(self.max_buffered)?;
        if evicted > 0 {
            log::warn!(
                "{}",
                Fault::BufferExhaustion {
                    camera_id: self.camera_id.clone(),
                    evicted,
                }
            );
            self.status.record_evictions(evicted);
        }
        self.status.set_buffered_batches(self.store.len()?);
        Ok(())
    }

    /// Replays up to `limit` buffered batches, oldest first, while the backoff allows.
    pub fn replay(&mut self, now: Instant, limit: usize) -> Result<usize> {
        let mut delivered = 0;
        while delivered < limit && self.backoff.ready(now) {
            let Some(batch) = self.store.oldest()? else {
                break;
            };
            match self.collector.post_events(&batch.payload) {
                Ok(()) => {
                    self.store.remove(batch.seq)?;
                    self.delivered();
                    delivered += 1;
                }
                Err(err) => {
                    self.failed(&err, now);
                    break;
                }
            }
        }
        if delivered > 0 {
            let remaining = self.store.len()?;
            self.status.set_buffered_batches(remaining);
            log::info!(
                "[{}] replayed {} buffered batch(es), {} remaining",
                self.camera_id,
                delivered,
                remaining
            );
        }
        Ok(delivered)
    }

    /// Replays the oldest buffered batch if it can be delivered before `deadline`.
    ///
    /// Returns `false` when the buffer is empty, time is up or the post failed.
    pub fn replay_one_before(&mut self, deadline: Instant) -> Result<bool> {
        let now = Instant::now();
        if now >= deadline || !self.backoff.ready(now) {
            return Ok(false);
        }
        let Some(batch) = self.store.oldest()? else {
            return Ok(false);
        };
        match self
            .collector
            .post_events_within(&batch.payload, deadline - now)
        {
            Ok(()) => {
                self.store.remove(batch.seq)?;
                self.delivered();
                self.status.set_buffered_batches(self.store.len()?);
                Ok(true)
            }
            Err(err) => {
                self.failed(&err, Instant::now());
                Ok(false)
            }
        }
    }

    /// Collector is reachable again: skip the rest of the backoff wait.
    pub fn connectivity_restored(&mut self) {
        if self.backoff.is_backing_off() {
            log::info!("[{}] connectivity restored, resuming delivery", self.camera_id);
            self.backoff.force_ready();
        }
    }

    fn delivered(&mut self) {
        self.backoff.on_success();
        self.status.record_batch_sent();
        self.status.set_collector_reachable(true);
    }

    fn failed(&mut self, err: &anyhow::Error, now: Instant) {
        let delay = self.backoff.on_failure(now);
        self.status.set_collector_reachable(false);
        log::warn!(
            "{} (attempt {}, retry in {:?})",
            Fault::Delivery {
                camera_id: self.camera_id.clone(),
                reason: format!("{:#}", err),
            },
            self.backoff.attempts(),
            delay
        );
    }
}

// ----------------------------------------------------------------------------
// Client threads
// ----------------------------------------------------------------------------

/// Identity and settings of one camera's event client.
#[derive(Clone, Debug)]
pub struct EventClient {
    pub org_id: String,
    pub store_id: String,
    pub camera_id: String,
    pub settings: DeliverySettings,
}

impl EventClient {
    /// Starts the flush and heartbeat threads.
    pub fn spawn(
        self,
        store: Box<dyn BatchStore>,
        collector: Arc<dyn Collector>,
        clock: Arc<dyn Clock>,
        status: Arc<CameraStatus>,
    ) -> Result<(EventSink, ClientHandle)> {
        let (sink, rx) = event_channel(&self.camera_id, self.settings.handoff_capacity);
        let sink = sink.with_status(status.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let connectivity = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher::new(
            &self.camera_id,
            store,
            collector.clone(),
            self.settings.backoff.clone(),
            self.settings.max_buffered_batches,
            status.clone(),
        )?;

        let lease = Arc::new(());
        let buffer_lease = BufferLease(Arc::downgrade(&lease));
        let flush_worker = FlushWorker {
            client: self.clone(),
            _lease: lease,
            rx,
            dispatcher,
            clock: clock.clone(),
            stop: stop.clone(),
            connectivity: connectivity.clone(),
            pending: Vec::new(),
        };
        let flush = std::thread::Builder::new()
            .name(format!("flush-{}", self.camera_id))
            .spawn(move || flush_worker.run())
            .context("spawn flush thread")?;

        let heartbeat = if self.settings.heartbeat_interval.is_zero() {
            None
        } else {
            let worker = HeartbeatWorker {
                client: self.clone(),
                collector,
                clock,
                status,
                backoff: Backoff::new(self.settings.backoff.clone()),
                stop: stop.clone(),
                connectivity,
            };
            Some(
                std::thread::Builder::new()
                    .name(format!("heartbeat-{}", self.camera_id))
                    .spawn(move || worker.run())
                    .context("spawn heartbeat thread")?,
            )
        };

        log::info!(
            "[{}] event client started (flush {:?}, max batch {})",
            self.camera_id,
            self.settings.flush_interval,
            self.settings.max_batch
        );

        Ok((
            sink,
            ClientHandle {
                camera_id: self.camera_id,
                grace: self.settings.shutdown_grace,
                lease: buffer_lease,
                stop,
                flush: Some(flush),
                heartbeat,
            },
        ))
    }
}

struct FlushWorker {
    client: EventClient,
    /// Released when the worker is dropped, wherever the thread ends.
    _lease: Arc<()>,
    rx: Receiver<Event>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    connectivity: Arc<AtomicBool>,
    pending: Vec<Event>,
}

impl FlushWorker {
    fn run(mut self) {
        let settings = self.client.settings.clone();
        let max_batch = settings.max_batch.max(1);
        let mut last_flush = Instant::now();
        loop {
            let wait = settings
                .flush_interval
                .saturating_sub(last_flush.elapsed())
                .clamp(Duration::from_millis(1), TICK);
            let disconnected = match self.rx.recv_timeout(wait) {
                Ok(event) => {
                    self.pending.push(event);
                    while self.pending.len() < max_batch {
                        match self.rx.try_recv() {
                            Ok(event) => self.pending.push(event),
                            Err(_) => break,
                        }
                    }
                    false
                }
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => true,
            };
            if self.stop.load(Ordering::SeqCst) || disconnected {
                break;
            }

            if self.pending.len() >= max_batch {
                self.flush_pending(false);
            }
            if last_flush.elapsed() >= settings.flush_interval {
                self.flush_pending(false);
                last_flush = Instant::now();
            }
            if self.connectivity.swap(false, Ordering::SeqCst) {
                self.dispatcher.connectivity_restored();
            }
            if let Err(err) = self.dispatcher.replay(Instant::now(), settings.replay_burst) {
                log::error!("[{}] buffer replay failed: {:#}", self.client.camera_id, err);
            }
        }
        self.drain(settings.shutdown_grace);
    }

    fn flush_pending(&mut self, persist_only: bool) {
        let max_batch = self.client.settings.max_batch.max(1);
        while !self.pending.is_empty() {
            let take = self.pending.len().min(max_batch);
            let batch = EventBatch {
                org_id: self.client.org_id.clone(),
                store_id: self.client.store_id.clone(),
                camera_id: self.client.camera_id.clone(),
                device_ts: self.clock.now(),
                events: self.pending.drain(..take).collect(),
            };
            let result = if persist_only {
                self.dispatcher.persist(&batch)
            } else {
                self.dispatcher.dispatch(&batch, Instant::now())
            };
            if let Err(err) = result {
                log::error!(
                    "[{}] lost batch of {} event(s): {:#}",
                    self.client.camera_id,
                    batch.events.len(),
                    err
                );
            }
        }
    }

    /// Persists everything still queued, then replays until empty or out of time.
    fn drain(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while let Ok(event) = self.rx.try_recv() {
            self.pending.push(event);
        }
        self.flush_pending(true);
        self.dispatcher.connectivity_restored();
        let mut replayed = 0;
        loop {
            match self.dispatcher.replay_one_before(deadline) {
                Ok(true) => replayed += 1,
                Ok(false) => break,
                Err(err) => {
                    log::error!("[{}] buffer replay failed: {:#}", self.client.camera_id, err);
                    break;
                }
            }
        }
        if replayed > 0 {
            log::info!(
                "[{}] replayed {} buffered batch(es) while stopping",
                self.client.camera_id,
                replayed
            );
        }
        match self.dispatcher.buffered() {
            Ok(0) => log::info!("[{}] event client stopped, buffer empty", self.client.camera_id),
            Ok(left) => log::info!(
                "[{}] event client stopped, {} batch(es) kept for next start",
                self.client.camera_id,
                left
            ),
            Err(err) => log::warn!("[{}] event client stopped: {:#}", self.client.camera_id, err),
        }
    }
}

struct HeartbeatWorker {
    client: EventClient,
    collector: Arc<dyn Collector>,
    clock: Arc<dyn Clock>,
    status: Arc<CameraStatus>,
    backoff: Backoff,
    stop: Arc<AtomicBool>,
    connectivity: Arc<AtomicBool>,
}

impl HeartbeatWorker {
    fn run(mut self) {
        let interval = self.client.settings.heartbeat_interval;
        loop {
            let now = Instant::now();
            let heartbeat = Heartbeat {
                org_id: self.client.org_id.clone(),
                store_id: self.client.store_id.clone(),
                camera_id: self.client.camera_id.clone(),
                ts: self.clock.now(),
                status: self.status.snapshot(),
            };
            let wait = match self.collector.post_heartbeat(&heartbeat) {
                Ok(()) => {
                    if self.backoff.is_backing_off() {
                        log::info!("[{}] heartbeat succeeded, collector reachable", self.client.camera_id);
                    }
                    self.backoff.on_success();
                    self.status.set_collector_reachable(true);
                    self.connectivity.store(true, Ordering::SeqCst);
                    interval
                }
                Err(err) => {
                    // Failed heartbeats back off, but never probe less often than the interval.
                    let delay = self.backoff.on_failure(now).min(interval);
                    self.status.set_collector_reachable(false);
                    log::warn!(
                        "[{}] heartbeat failed (attempt {}, retry in {:?}): {:#}",
                        self.client.camera_id,
                        self.backoff.attempts(),
                        delay,
                        err
                    );
                    delay
                }
            };
            let deadline = now + wait;
            if !crate::sleep_unless_stopped(&self.stop, deadline.saturating_duration_since(Instant::now())) {
                break;
            }
        }
    }
}

/// Ownership of one camera's batch buffer, held by its flush thread.
///
/// A buffer must have a single writer: a new client for the same camera
/// waits until the previous one has released its lease.
#[derive(Clone, Debug)]
pub struct BufferLease(Weak<()>);

impl BufferLease {
    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }

    /// Waits for the flush thread to let go. Returns `false` at `deadline`.
    pub fn wait_released(&self, deadline: Instant) -> bool {
        while !self.is_released() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(LEASE_POLL);
        }
        true
    }
}

/// Owner-side handle of a running event client.
pub struct ClientHandle {
    camera_id: String,
    grace: Duration,
    lease: BufferLease,
    stop: Arc<AtomicBool>,
    flush: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ClientHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Released once the flush thread has finished, even if it was abandoned.
    pub fn buffer_lease(&self) -> BufferLease {
        self.lease.clone()
    }

    /// Signals both threads to stop without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stops both threads, letting the flush thread drain within the grace period.
    ///
    /// Returns `false` if a thread had to be abandoned. Anything it had not
    /// delivered is already in the durable buffer.
    pub fn shutdown(mut self) -> bool {
        self.request_stop();
        // Allow for the TICK it takes the flush thread to notice the stop flag.
        let deadline = Instant::now() + self.grace + TICK * 2;
        let mut clean = true;
        if let Some(flush) = self.flush.take() {
            if !join_within(flush, deadline) {
                log::warn!(
                    "[{}] flush thread exceeded shutdown grace of {:?}, abandoning it",
                    self.camera_id,
                    self.grace
                );
                clean = false;
            }
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            if !join_within(heartbeat, deadline) {
                log::warn!("[{}] heartbeat thread still busy, abandoning it", self.camera_id);
                clean = false;
            }
        }
        clean
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
