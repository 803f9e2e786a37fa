//! One camera's processing loop: read -> detect -> track -> evaluate -> emit.
//!
//! Stream faults close the source and reconnect with backoff for as long as
//! the pipeline runs. Detector errors skip the frame without aging the
//! tracker; more than `detector_failure_threshold` in a row return a
//! `Fault::Detector` so the supervisor restarts the pipeline. Every exit path,
//! panics included, force-closes open occupancies first.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::camera::CameraSpec;
use crate::client::{Backoff, BackoffPolicy, EventSink};
use crate::clock::Clock;
use crate::detect::{Detection, DetectorBackend};
use crate::fault::Fault;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::sleep_unless_stopped;
use crate::status::CameraStatus;
use crate::tracker::{Tracker, TrackerConfig};
use crate::zones::RegionEvaluator;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Consecutive detector failures tolerated before the pipeline restarts.
    pub detector_failure_threshold: u32,
    /// Run detection on every Nth frame.
    pub frame_stride: u32,
    /// Detections below this confidence are discarded before tracking.
    pub min_confidence: f32,
    pub reconnect: BackoffPolicy,
    pub restart: BackoffPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detector_failure_threshold: 5,
            frame_stride: 1,
            min_confidence: 0.3,
            reconnect: BackoffPolicy {
                initial: Duration::from_secs(1),
                factor: 2.0,
                max: Duration::from_secs(30),
                jitter: 0.2,
            },
            restart: BackoffPolicy {
                initial: Duration::from_secs(2),
                factor: 2.0,
                max: Duration::from_secs(60),
                jitter: 0.2,
            },
        }
    }
}

/// Shared pieces every pipeline session of a camera is built from.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: PipelineSettings,
    pub tracker: TrackerConfig,
    pub clock: Arc<dyn Clock>,
    pub status: Arc<CameraStatus>,
}

pub struct CameraPipeline {
    spec: Arc<CameraSpec>,
    settings: PipelineSettings,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    tracker: Tracker,
    evaluator: RegionEvaluator,
    sink: EventSink,
    clock: Arc<dyn Clock>,
    status: Arc<CameraStatus>,
    frames_seen: u64,
    detector_failures: u32,
}

impl CameraPipeline {
    pub fn new(
        spec: Arc<CameraSpec>,
        session: i64,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        sink: EventSink,
        ctx: &PipelineContext,
    ) -> Self {
        Self {
            evaluator: RegionEvaluator::new(&spec, session),
            tracker: Tracker::new(ctx.tracker.clone()),
            settings: ctx.settings.clone(),
            clock: Arc::clone(&ctx.clock),
            status: Arc::clone(&ctx.status),
            spec,
            source,
            detector,
            sink,
            frames_seen: 0,
            detector_failures: 0,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.spec.camera_id
    }

    pub fn session(&self) -> i64 {
        self.evaluator.session()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn open_occupancies(&self) -> usize {
        self.evaluator.open_occupancies()
    }

    /// Runs until `stop` is raised (`Ok`) or the detector gives up (`Err`).
    ///
    /// A panic inside the loop still closes open occupancies before it
    /// propagates to the supervisor.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!(
            "[{}] pipeline session {} running with detector '{}'",
            self.camera_id(),
            self.session(),
            self.detector.name()
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_until_stopped(stop)));
        self.source.close();
        self.status.set_stream_connected(false);
        match outcome {
            Ok(result) => {
                self.close_all("pipeline stopping");
                result
            }
            Err(payload) => {
                self.close_all("pipeline panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    fn run_until_stopped(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut reconnect = Backoff::new(self.settings.reconnect.clone());
        'connect: while !stop.load(Ordering::SeqCst) {
            if let Err(err) = self.source.connect() {
                self.stream_fault(err, &mut reconnect, stop);
                continue;
            }
            info!("[{}] stream connected", self.camera_id());
            self.status.set_stream_connected(true);

            while !stop.load(Ordering::SeqCst) {
                let frame = match self.source.next_frame() {
                    Ok(frame) if frame.width > 0 && frame.height > 0 => frame,
                    Ok(frame) => {
                        self.source.close();
                        let err =
                            anyhow!("decoded an empty {}x{} frame", frame.width, frame.height);
                        self.stream_fault(err, &mut reconnect, stop);
                        continue 'connect;
                    }
                    Err(err) => {
                        self.source.close();
                        self.stream_fault(err, &mut reconnect, stop);
                        continue 'connect;
                    }
                };
                reconnect.on_success();
                self.process_frame(&frame)?;
            }
        }
        Ok(())
    }

    fn stream_fault(&mut self, err: anyhow::Error, reconnect: &mut Backoff, stop: &AtomicBool) {
        let fault = Fault::Stream {
            camera_id: self.spec.camera_id.clone(),
            reason: format!("{:#}", err),
        };
        self.status.set_stream_connected(false);
        self.status.record_stream_fault(&fault.to_string());
        // Identities do not survive a gap in the stream.
        self.close_all("stream lost");
        let delay = reconnect.on_failure(Instant::now());
        warn!("{} (reconnect in {:?})", fault, delay);
        sleep_unless_stopped(stop, delay);
    }

    /// Processes one decoded frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames_seen += 1;
        self.status.record_frame();
        let stride = u64::from(self.settings.frame_stride.max(1));
        if (self.frames_seen - 1) % stride != 0 {
            return Ok(());
        }

        let now = self.clock.now();
        let detections = match self.detector.detect(frame) {
            Ok(detections) => {
                self.detector_failures = 0;
                detections
            }
            Err(err) => return self.detector_failed(frame, err),
        };
        let detections: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.confidence >= self.settings.min_confidence)
            .collect();

        let retired = self.tracker.update(&detections, now);
        let mut events = Vec::new();
        for track in &retired {
            debug!("[{}] track {} retired", self.camera_id(), track.id());
            events.extend(self.evaluator.close_track(track.id(), now));
        }
        events.extend(
            self.evaluator
                .evaluate(self.tracker.visible_tracks(), frame.size(), now)?,
        );
        self.status
            .set_tracking(self.tracker.len(), self.evaluator.open_occupancies());
        for event in events {
            self.sink.submit(event);
        }
        Ok(())
    }

    fn detector_failed(&mut self, frame: &Frame, err: anyhow::Error) -> Result<()> {
        self.detector_failures += 1;
        let reason = format!("{:#}", err);
        self.status.record_detector_failure(&reason);
        if self.detector_failures > self.settings.detector_failure_threshold {
            return Err(Fault::Detector {
                camera_id: self.spec.camera_id.clone(),
                consecutive: self.detector_failures,
                reason,
            }
            .into());
        }
        warn!(
            "[{}] detector failed on frame {} ({}/{}), skipping: {}",
            self.camera_id(),
            frame.seq,
            self.detector_failures,
            self.settings.detector_failure_threshold,
            reason
        );
        Ok(())
    }

    fn close_all(&mut self, reason: &str) {
        let now = self.clock.now();
        self.tracker.drain();
        let events = self.evaluator.close_all(now);
        if !events.is_empty() {
            info!(
                "[{}] {}: closed {} open occupancies",
                self.camera_id(),
                reason,
                events.len()
            );
        }
        for event in events {
            self.sink.submit(event);
        }
        self.status.set_tracking(0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Capability;
    use crate::client::event_channel;
    use crate::clock::{ManualClock, Timestamp};
    use crate::detect::{AnchorPoint, BoundingBox, ScriptStep, ScriptedBackend};
    use crate::event::Event;
    use crate::geometry::{Point, Size};
    use crate::ingest::{ScriptedSource, SourceStep};
    use crate::region::{PolygonKind, PolygonRegion, Region};
    use std::sync::mpsc::Receiver;

    fn spec() -> Arc<CameraSpec> {
        let zone = PolygonRegion::new(
            "z1",
            "Front",
            PolygonKind::Zone,
            vec![
                Point::new(100.0, 100.0),
                Point::new(300.0, 100.0),
                Point::new(300.0, 300.0),
                Point::new(100.0, 300.0),
            ],
        )
        .expect("zone");
        Arc::new(CameraSpec {
            camera_id: "cam-1".into(),
            stream: "stub://t".into(),
            api_key: "k".into(),
            reference_size: Size::new(640.0, 480.0),
            frame_size: None,
            capabilities: Capability::ALL.iter().copied().collect(),
            regions: vec![Region::Polygon(zone)],
        })
    }

    fn person(x: f64, y: f64) -> Detection {
        Detection::new(BoundingBox::new(x - 5.0, y - 5.0, x + 5.0, y + 5.0), 0.9)
    }

    fn context(clock: &ManualClock) -> PipelineContext {
        PipelineContext {
            settings: PipelineSettings {
                detector_failure_threshold: 3,
                reconnect: BackoffPolicy {
                    initial: Duration::from_millis(1),
                    factor: 1.0,
                    max: Duration::from_millis(1),
                    jitter: 0.0,
                },
                ..PipelineSettings::default()
            },
            tracker: TrackerConfig {
                anchor: AnchorPoint::Center,
                ..TrackerConfig::default()
            },
            clock: Arc::new(clock.clone()),
            status: Arc::new(CameraStatus::new("cam-1")),
        }
    }

    fn pipeline(
        steps: Vec<ScriptStep>,
        source: ScriptedSource,
        clock: &ManualClock,
    ) -> (CameraPipeline, Receiver<Event>) {
        let (sink, rx) = event_channel("cam-1", 64);
        let pipeline = CameraPipeline::new(
            spec(),
            1_700_000_000,
            Box::new(source),
            Box::new(ScriptedBackend::new(steps)),
            sink,
            &context(clock),
        );
        (pipeline, rx)
    }

    fn ids(pipeline: &CameraPipeline) -> Vec<u64> {
        pipeline.tracker().tracks().map(|t| t.id()).collect()
    }

    #[test]
    fn detector_failures_below_threshold_keep_identities() -> Result<()> {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let steps = vec![
            ScriptStep::Detections(vec![person(200.0, 200.0)]),
            ScriptStep::Fail("timeout".into()),
            ScriptStep::Fail("timeout".into()),
            ScriptStep::Fail("timeout".into()),
            ScriptStep::Detections(vec![person(205.0, 200.0)]),
        ];
        let (mut p, _rx) = pipeline(steps, ScriptedSource::frames(640, 480, 0), &clock);
        for seq in 1..=5 {
            p.process_frame(&Frame::blank(640, 480, seq))?;
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(ids(&p), vec![1]);
        let track = p.tracker().tracks().next().expect("track");
        assert_eq!(track.missed(), 0, "failed frames do not age tracks");
        assert_eq!(p.open_occupancies(), 1);
        Ok(())
    }

    #[test]
    fn detector_failures_past_threshold_escalate() {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let steps = (0..4).map(|_| ScriptStep::Fail("model crashed".into())).collect();
        let (mut p, _rx) = pipeline(steps, ScriptedSource::frames(640, 480, 0), &clock);
        for seq in 1..=3 {
            assert!(p.process_frame(&Frame::blank(640, 480, seq)).is_ok());
        }
        let err = p
            .process_frame(&Frame::blank(640, 480, 4))
            .expect_err("fourth failure escalates");
        match err.downcast_ref::<Fault>() {
            Some(Fault::Detector { consecutive, .. }) => assert_eq!(*consecutive, 4),
            other => panic!("unexpected fault: {:?}", other),
        }
    }

    #[test]
    fn low_confidence_and_strided_frames_are_skipped() -> Result<()> {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let weak = Detection::new(BoundingBox::new(195.0, 195.0, 205.0, 205.0), 0.1);
        let (sink, _rx) = event_channel("cam-1", 8);
        let mut ctx = context(&clock);
        ctx.settings.frame_stride = 2;
        let mut p = CameraPipeline::new(
            spec(),
            1,
            Box::new(ScriptedSource::frames(640, 480, 0)),
            Box::new(ScriptedBackend::new(vec![
                ScriptStep::Detections(vec![weak]),
                ScriptStep::Detections(vec![person(50.0, 50.0)]),
            ])),
            sink,
            &ctx,
        );
        for seq in 1..=4 {
            p.process_frame(&Frame::blank(640, 480, seq))?;
        }
        assert_eq!(ids(&p), vec![1], "weak detection ignored, frames 2 and 4 skipped");
        assert_eq!(ctx.status.snapshot().frames, 4);
        Ok(())
    }

    #[test]
    fn orderly_stop_closes_open_occupancies() -> Result<()> {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let stop = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource::frames(640, 480, 3)
            .advancing(clock.clone(), Duration::from_secs(1))
            .stop_when_exhausted(Arc::clone(&stop));
        let steps = (0..3)
            .map(|_| ScriptStep::Detections(vec![person(200.0, 200.0)]))
            .collect();
        let (mut p, rx) = pipeline(steps, source, &clock);
        p.run(&stop)?;

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        let (enter, exit, dwell) = events[0].interval().expect("presence event");
        assert_eq!(enter, Timestamp::from_secs(11));
        assert_eq!(exit, Timestamp::from_secs(13));
        assert_eq!(dwell, 2.0);
        assert_eq!(events[0].person_key(), "cam-1_s1700000000_t1");
        assert_eq!(p.open_occupancies(), 0);
        Ok(())
    }

    #[test]
    fn detector_panic_closes_open_occupancies() {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let stop = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource::frames(640, 480, 5)
            .advancing(clock.clone(), Duration::from_secs(1))
            .stop_when_exhausted(Arc::clone(&stop));
        let steps = vec![
            ScriptStep::Detections(vec![person(200.0, 200.0)]),
            ScriptStep::Detections(vec![person(202.0, 200.0)]),
            ScriptStep::Panic("model crashed".into()),
        ];
        let (mut p, rx) = pipeline(steps, source, &clock);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| p.run(&stop)));
        assert!(outcome.is_err(), "the panic still reaches the caller");
        assert_eq!(p.open_occupancies(), 0);
        assert!(p.tracker().is_empty());

        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 1, "exactly one exit for the track inside z1");
        let (enter, exit, _) = events[0].interval().expect("presence event");
        assert_eq!(enter, Timestamp::from_secs(11));
        assert_eq!(exit, Timestamp::from_secs(13));
        assert_eq!(events[0].person_key(), "cam-1_s1700000000_t1");
    }

    #[test]
    fn stream_faults_reconnect_and_close_occupancies() -> Result<()> {
        let clock = ManualClock::starting_at(Timestamp::from_secs(10));
        let stop = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource::new(
            640,
            480,
            vec![
                SourceStep::Refuse("boot".into()),
                SourceStep::Frame,
                SourceStep::Drop("cable".into()),
                SourceStep::Refuse("still down".into()),
                SourceStep::Frame,
            ],
        )
        .advancing(clock.clone(), Duration::from_secs(1))
        .stop_when_exhausted(Arc::clone(&stop));
        let connects = source.connect_counter();
        let steps = (0..2)
            .map(|_| ScriptStep::Detections(vec![person(200.0, 200.0)]))
            .collect();
        let (mut p, rx) = pipeline(steps, source, &clock);
        let status = Arc::clone(&p.status);
        p.run(&stop)?;

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.stream_faults, 4, "refuse, drop, refuse, exhausted");
        assert!(!snapshot.stream_connected);

        let events: Vec<Event> = rx.try_iter().collect();
        let keys: Vec<&str> = events.iter().map(|e| e.person_key()).collect();
        assert_eq!(keys, vec!["cam-1_s1700000000_t1", "cam-1_s1700000000_t2"]);
        Ok(())
    }
}
