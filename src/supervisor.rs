//! Per-camera pipeline supervision.
//!
//! Each camera gets a pipeline thread and an event client. The pipeline
//! thread runs sessions in a loop: build source and detector, run, and on
//! error or panic log, back off, and start a fresh session. The event client
//! outlives sessions so its buffer and ordering carry across restarts.
//!
//! `apply` diffs a new camera list against the running set by id and only
//! touches cameras that were added, changed or removed.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use crate::camera::CameraSpec;
use crate::client::{
    Backoff, BackoffPolicy, BatchStore, BufferLease, ClientHandle, DeliverySettings, EventClient,
    EventSink, InMemoryBatchStore, SqliteBatchStore,
};
use crate::clock::{Clock, Timestamp};
use crate::detect::{BackendRegistry, DetectorSettings};
use crate::ingest::SourceFactory;
use crate::join_within;
use crate::pipeline::{CameraPipeline, PipelineContext, PipelineSettings};
use crate::sleep_unless_stopped;
use crate::status::StatusBoard;
use crate::tracker::TrackerConfig;
use crate::transport::{Collector, CollectorSettings, HttpCollector};

/// A session that ran this long resets the restart backoff.
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Extra time allowed for a pipeline thread to notice its stop flag.
const PIPELINE_STOP_GRACE: Duration = Duration::from_secs(5);

pub type CollectorFactory = Arc<dyn Fn(&CameraSpec) -> Result<Arc<dyn Collector>> + Send + Sync>;
pub type StoreFactory = Arc<dyn Fn(&CameraSpec) -> Result<Box<dyn BatchStore>> + Send + Sync>;

/// Settings shared by every camera.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeSettings {
    pub org_id: String,
    pub store_id: String,
    pub delivery: DeliverySettings,
    pub pipeline: PipelineSettings,
    pub tracker: TrackerConfig,
    pub detector: DetectorSettings,
}

/// Injected collaborators.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub detectors: BackendRegistry,
    pub sources: SourceFactory,
    pub collectors: CollectorFactory,
    pub stores: StoreFactory,
    pub clock: Arc<dyn Clock>,
    pub status: Arc<StatusBoard>,
}

/// HTTP collector per camera, carrying that camera's bearer credential.
pub fn http_collector_factory(settings: CollectorSettings) -> CollectorFactory {
    Arc::new(move |spec: &CameraSpec| {
        Ok(Arc::new(HttpCollector::new(&settings, &spec.api_key)?) as Arc<dyn Collector>)
    })
}

/// SQLite buffer under `<buffer_dir>/<camera_id>/`, or memory when no directory is set.
pub fn batch_store_factory(buffer_dir: Option<PathBuf>) -> StoreFactory {
    Arc::new(move |spec: &CameraSpec| match &buffer_dir {
        Some(dir) => Ok(
            Box::new(SqliteBatchStore::open_for_camera(dir, &spec.camera_id)?)
                as Box<dyn BatchStore>,
        ),
        None => {
            warn!(
                "[{}] no buffer directory configured, undelivered batches will not survive a restart",
                spec.camera_id
            );
            Ok(Box::new(InMemoryBatchStore::new()) as Box<dyn BatchStore>)
        }
    })
}

/// Outcome of `Supervisor::apply`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplySummary {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

struct CameraSlot {
    spec: Arc<CameraSpec>,
    stop: Arc<AtomicBool>,
    pipeline: JoinHandle<()>,
    client: ClientHandle,
}

/// Everything a pipeline thread needs to build sessions.
struct CameraRuntime {
    spec: Arc<CameraSpec>,
    detector: DetectorSettings,
    restart: BackoffPolicy,
    detectors: BackendRegistry,
    sources: SourceFactory,
    sink: EventSink,
    ctx: PipelineContext,
}

pub struct Supervisor {
    settings: RuntimeSettings,
    deps: SupervisorDeps,
    cameras: BTreeMap<String, CameraSlot>,
    /// Buffers still held by abandoned flush threads of stopped cameras.
    draining: BTreeMap<String, BufferLease>,
}

impl Supervisor {
    pub fn new(settings: RuntimeSettings, deps: SupervisorDeps) -> Self {
        Self {
            settings,
            deps,
            cameras: BTreeMap::new(),
            draining: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.deps.status)
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        self.cameras
            .get(camera_id)
            .map_or(false, |slot| !slot.pipeline.is_finished())
    }

    /// Starts a camera that is not running yet.
    pub fn start_camera(&mut self, spec: CameraSpec) -> Result<()> {
        if self.cameras.contains_key(&spec.camera_id) {
            return Err(anyhow!("camera '{}' is already running", spec.camera_id));
        }
        spec.validate()?;
        self.claim_buffer(&spec.camera_id)?;
        let camera_id = spec.camera_id.clone();
        let spec = Arc::new(spec);
        let store = (self.deps.stores)(&spec)
            .with_context(|| format!("[{}] open batch buffer", camera_id))?;
        let collector = (self.deps.collectors)(&spec)
            .with_context(|| format!("[{}] build collector", camera_id))?;

        let status = self.deps.status.register(&camera_id);
        let spawned = EventClient {
            org_id: self.settings.org_id.clone(),
            store_id: self.settings.store_id.clone(),
            camera_id: camera_id.clone(),
            settings: self.settings.delivery.clone(),
        }
        .spawn(store, collector, Arc::clone(&self.deps.clock), Arc::clone(&status));
        let (sink, client) = match spawned {
            Ok(parts) => parts,
            Err(err) => {
                self.deps.status.remove(&camera_id);
                return Err(err);
            }
        };

        let runtime = CameraRuntime {
            spec: Arc::clone(&spec),
            detector: self.settings.detector.clone(),
            restart: self.settings.pipeline.restart.clone(),
            detectors: self.deps.detectors.clone(),
            sources: Arc::clone(&self.deps.sources),
            sink,
            ctx: PipelineContext {
                settings: self.settings.pipeline.clone(),
                tracker: self.settings.tracker.clone(),
                clock: Arc::clone(&self.deps.clock),
                status,
            },
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let pipeline = match std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || supervise(runtime, &thread_stop))
        {
            Ok(handle) => handle,
            Err(err) => {
                client.shutdown();
                self.deps.status.remove(&camera_id);
                return Err(err).context("spawn pipeline thread");
            }
        };

        info!("[{}] camera started ({} regions)", camera_id, spec.regions.len());
        self.cameras.insert(
            camera_id,
            CameraSlot {
                spec,
                stop,
                pipeline,
                client,
            },
        );
        Ok(())
    }

    /// Stops one camera: pipeline first (closing its occupancies), then its client.
    pub fn stop_camera(&mut self, camera_id: &str) -> bool {
        match self.cameras.remove(camera_id) {
            Some(slot) => {
                slot.stop.store(true, Ordering::SeqCst);
                let lease = slot.client.buffer_lease();
                stop_slot(slot);
                if !lease.is_released() {
                    self.draining.insert(camera_id.to_string(), lease);
                }
                self.deps.status.remove(camera_id);
                true
            }
            None => false,
        }
    }

    /// Waits for a previous flush thread of `camera_id` to release its buffer.
    fn claim_buffer(&mut self, camera_id: &str) -> Result<()> {
        let Some(lease) = self.draining.get(camera_id).cloned() else {
            return Ok(());
        };
        info!("[{}] waiting for the previous event client to release its buffer", camera_id);
        let deadline = Instant::now() + self.settings.delivery.shutdown_grace;
        if !lease.wait_released(deadline) {
            return Err(anyhow!(
                "camera '{}' buffer is still owned by a previous event client",
                camera_id
            ));
        }
        self.draining.remove(camera_id);
        Ok(())
    }

    /// Reconciles the running cameras with `cameras`.
    pub fn apply(&mut self, cameras: Vec<CameraSpec>) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let wanted: BTreeSet<String> = cameras.iter().map(|c| c.camera_id.clone()).collect();

        for camera_id in self.camera_ids() {
            if !wanted.contains(&camera_id) {
                info!("[{}] camera removed from configuration", camera_id);
                self.stop_camera(&camera_id);
                summary.removed.push(camera_id);
            }
        }

        for spec in cameras {
            let camera_id = spec.camera_id.clone();
            let existed = match self.cameras.get(&camera_id) {
                Some(slot) if *slot.spec == spec => {
                    summary.unchanged.push(camera_id);
                    continue;
                }
                Some(_) => {
                    info!("[{}] configuration changed, restarting", camera_id);
                    self.stop_camera(&camera_id);
                    true
                }
                None => false,
            };
            match self.start_camera(spec) {
                Ok(()) if existed => summary.changed.push(camera_id),
                Ok(()) => summary.added.push(camera_id),
                Err(err) => {
                    error!("[{}] failed to start camera: {:#}", camera_id, err);
                    summary.failed.push(camera_id);
                }
            }
        }
        summary
    }

    /// Stops every camera. Pipelines stop together, then clients drain together.
    pub fn shutdown(&mut self) {
        if self.cameras.is_empty() {
            return;
        }
        info!("stopping {} camera(s)", self.cameras.len());
        let slots: Vec<CameraSlot> = std::mem::take(&mut self.cameras).into_values().collect();
        for slot in &slots {
            slot.stop.store(true, Ordering::SeqCst);
        }
        let mut clients = Vec::with_capacity(slots.len());
        for slot in slots {
            join_pipeline(&slot.spec.camera_id, slot.pipeline);
            slot.client.request_stop();
            clients.push(slot.client);
        }
        for client in clients {
            let camera_id = client.camera_id().to_string();
            client.shutdown();
            self.deps.status.remove(&camera_id);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_slot(slot: CameraSlot) {
    join_pipeline(&slot.spec.camera_id, slot.pipeline);
    slot.client.shutdown();
}

fn join_pipeline(camera_id: &str, pipeline: JoinHandle<()>) {
    if !join_within(pipeline, Instant::now() + PIPELINE_STOP_GRACE) {
        warn!(
            "[{}] pipeline thread did not stop within {:?}, abandoning it",
            camera_id, PIPELINE_STOP_GRACE
        );
    }
}

/// Pipeline thread body: run sessions until stopped.
fn supervise(runtime: CameraRuntime, stop: &AtomicBool) {
    let camera_id = runtime.spec.camera_id.clone();
    let mut restart = Backoff::new(runtime.restart.clone());
    let mut last_session = i64::MIN;
    while !stop.load(Ordering::SeqCst) {
        let session = next_session(runtime.ctx.clock.now(), last_session);
        last_session = session;

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_session(&runtime, session, stop)));
        let reason = match outcome {
            Ok(Ok(())) => break,
            Ok(Err(err)) => format!("{:#}", err),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };
        if started.elapsed() >= STABLE_SESSION {
            restart.on_success();
        }
        let delay = restart.on_failure(Instant::now());
        error!(
            "[{}] pipeline session {} failed: {} (restart {} in {:?})",
            camera_id,
            session,
            reason,
            restart.attempts(),
            delay
        );
        runtime.ctx.status.record_restart(&reason);
        if !sleep_unless_stopped(stop, delay) {
            break;
        }
    }
    info!("[{}] pipeline stopped", camera_id);
}

/// Session number: start time in milliseconds, strictly after `last`.
///
/// Person keys must never repeat across sessions, even when a session fails
/// right after starting or the process restarts within the same second.
fn next_session(now: Timestamp, last: i64) -> i64 {
    now.as_micros()
        .div_euclid(1_000)
        .max(last.saturating_add(1))
}

fn run_session(runtime: &CameraRuntime, session: i64, stop: &AtomicBool) -> Result<()> {
    let source = (runtime.sources)(&runtime.spec).context("open stream source")?;
    let detector = runtime
        .detectors
        .create(&runtime.detector, &runtime.spec)
        .context("create detector")?;
    let mut pipeline = CameraPipeline::new(
        Arc::clone(&runtime.spec),
        session,
        source,
        detector,
        runtime.sink.clone(),
        &runtime.ctx,
    );
    pipeline.run(stop)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_millisecond_start_times_and_never_repeat() {
        let start = Timestamp::from_secs(1_700_000_000);
        let first = next_session(start, i64::MIN);
        assert_eq!(first, 1_700_000_000_000);

        let again = next_session(start, first);
        assert_eq!(again, first + 1, "restart within the same millisecond");

        let later = next_session(Timestamp::from_secs(1_700_000_001), again);
        assert_eq!(later, 1_700_000_001_000);
    }
}
