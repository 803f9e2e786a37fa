//! Footfall edge pipeline
//!
//! This crate turns live store camera streams into typed occupancy events and
//! delivers them to a remote collector.
//!
//! # Architecture
//!
//! Every configured camera runs its own pipeline:
//!
//! 1. **Ingest**: a `FrameSource` yields decoded frames (RTSP or `stub://`).
//! 2. **Detect**: a `DetectorBackend` returns person bounding boxes per frame.
//! 3. **Track**: the `Tracker` keeps per-camera identities across frames.
//! 4. **Evaluate**: the `RegionEvaluator` runs one state machine per
//!    (track, region) pair and emits `Event`s on transitions.
//! 5. **Deliver**: the per-camera `EventClient` batches events, posts them to
//!    the collector, and spills to a durable SQLite buffer when offline.
//!
//! The `Supervisor` owns all camera pipelines and restarts any one of them
//! without disturbing the others.
//!
//! # Module Structure
//!
//! - `geometry`, `region`, `camera`: pure geometry and immutable camera config
//! - `tracker`, `zones`: identity tracking and region state machines
//! - `event`, `client`, `transport`: event model and resilient delivery
//! - `pipeline`, `supervisor`: per-camera loop and orchestration
//! - `config`, `status`, `api`: configuration, status board, local status API

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod api;
pub mod camera;
pub mod client;
pub mod clock;
pub mod config;
pub mod detect;
pub mod event;
pub mod fault;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod region;
pub mod status;
pub mod supervisor;
pub mod tracker;
pub mod transport;
pub mod zones;

pub use camera::{Capability, CameraSpec};
pub use client::{
    event_channel, BackoffPolicy, BatchStore, ClientHandle, DeliverySettings, EventClient,
    EventSink, InMemoryBatchStore, SqliteBatchStore,
};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::EdgeConfig;
pub use detect::{AnchorPoint, BackendRegistry, BoundingBox, Detection, DetectorBackend};
pub use event::{Event, EventBatch};
pub use fault::Fault;
pub use frame::Frame;
pub use geometry::{Direction, Line, Point, Side, Size};
pub use ingest::{FrameSource, RtspConfig, RtspSource};
pub use pipeline::{CameraPipeline, PipelineSettings};
pub use region::{LineRegion, PolygonKind, PolygonRegion, Region};
pub use status::{CameraStatus, StatusBoard, StatusSnapshot};
pub use supervisor::Supervisor;
pub use tracker::{Track, Tracker, TrackerConfig};
pub use transport::{Collector, CollectorSettings, Heartbeat, HttpCollector};
pub use zones::RegionEvaluator;

const STOP_POLL: Duration = Duration::from_millis(50);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Sleeps for `duration`, waking early when `stop` is raised.
///
/// Returns `false` when the sleep was cut short by a stop request.
pub fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}

/// Joins `handle` if it finishes before `deadline`; otherwise leaves it detached.
///
/// Returns `false` if the thread was abandoned or had panicked.
pub(crate) fn join_within(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    handle.join().is_ok()
}
