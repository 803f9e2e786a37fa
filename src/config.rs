//! Edge configuration: file, defaults, environment overrides, validation.
//!
//! The file is JSON, or TOML when its extension is `.toml`. Global settings
//! that fail validation abort the load. Cameras are parsed and validated one
//! by one: a bad camera is rejected with a `Fault::Config` and the rest load.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::Deserialize;

use crate::camera::{Capability, CameraSpec};
use crate::client::{BackoffPolicy, DeliverySettings};
use crate::detect::{AnchorPoint, DetectorSettings};
use crate::fault::Fault;
use crate::geometry::{Point, Side, Size};
use crate::ingest::StreamSettings;
use crate::pipeline::PipelineSettings;
use crate::region::{LineRegion, PolygonKind, PolygonRegion, Region};
use crate::supervisor::RuntimeSettings;
use crate::tracker::TrackerConfig;
use crate::transport::{validate_api_base, CollectorSettings};

const DEFAULT_BUFFER_DIR: &str = "buffer";
const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:8790";
const ENTRANCE_LINE_ID: &str = "entrance";

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    org_id: Option<String>,
    store_id: Option<String>,
    api_base: Option<String>,
    api_key: Option<String>,
    buffer_dir: Option<PathBuf>,
    status_addr: Option<String>,
    collector: Option<CollectorConfigFile>,
    delivery: Option<DeliveryConfigFile>,
    tracking: Option<TrackingConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    detector: Option<DetectorConfigFile>,
    stream: Option<StreamConfigFile>,
    /// Kept raw so one malformed camera cannot sink the whole file.
    cameras: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectorConfigFile {
    events_path: Option<String>,
    heartbeat_path: Option<String>,
    events_timeout_secs: Option<f64>,
    heartbeat_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    flush_interval_secs: Option<f64>,
    max_batch: Option<usize>,
    handoff_capacity: Option<usize>,
    heartbeat_interval_secs: Option<f64>,
    max_buffered_batches: Option<u64>,
    replay_burst: Option<usize>,
    shutdown_grace_secs: Option<f64>,
    backoff: Option<BackoffConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    initial_secs: Option<f64>,
    factor: Option<f64>,
    max_secs: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    max_distance: Option<f64>,
    max_missed_frames: Option<u32>,
    disappear_after_secs: Option<f64>,
    history_len: Option<usize>,
    anchor: Option<AnchorPoint>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    detector_failure_threshold: Option<u32>,
    frame_stride: Option<u32>,
    min_confidence: Option<f32>,
    reconnect: Option<BackoffConfigFile>,
    restart: Option<BackoffConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    command: Option<Vec<String>>,
    timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    target_fps: Option<u32>,
    connect_timeout_secs: Option<f64>,
    default_width: Option<u32>,
    default_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    camera_id: String,
    #[serde(alias = "rtsp", alias = "rtsp_url")]
    stream: String,
    api_key: Option<String>,
    #[serde(alias = "screenshot_size")]
    reference_size: Option<[f64; 2]>,
    frame_size: Option<[u32; 2]>,
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    regions: Vec<RegionConfigFile>,
    geometry: Option<GeometryConfigFile>,
}

#[derive(Debug, Deserialize)]
struct RegionConfigFile {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    label: Option<String>,
    points: Vec<[f64; 2]>,
    positive_side: Option<Side>,
    tolerance: Option<f64>,
}

/// Compact per-type geometry: `entrance` is a line, the rest map id -> polygon.
#[derive(Debug, Deserialize, Default)]
struct GeometryConfigFile {
    entrance: Option<Vec<[f64; 2]>>,
    zones: Option<BTreeMap<String, Vec<[f64; 2]>>>,
    shelves: Option<BTreeMap<String, Vec<[f64; 2]>>>,
    queue: Option<BTreeMap<String, Vec<[f64; 2]>>>,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub org_id: String,
    pub store_id: String,
    /// Credential for cameras that do not carry their own.
    pub api_key: String,
    pub collector: CollectorSettings,
    pub delivery: DeliverySettings,
    pub tracker: TrackerConfig,
    pub pipeline: PipelineSettings,
    pub detector: DetectorSettings,
    pub stream: StreamSettings,
    pub buffer_dir: PathBuf,
    pub status_addr: String,
    pub cameras: Vec<CameraSpec>,
    /// Cameras dropped during validation.
    pub rejected: Vec<Fault>,
    pub source: Option<PathBuf>,
}

impl EdgeConfig {
    /// Loads the file named by `EDGE_CONFIG`, or defaults plus environment when unset.
    pub fn load() -> Result<Self> {
        match std::env::var("EDGE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::load_from(Path::new(&path)),
            _ => Self::build(EdgeConfigFile::default(), None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file = read_config_file(path)?;
        Self::build(file, Some(path.to_path_buf()))
    }

    /// Parses JSON (or TOML when `toml` is set) config text.
    pub fn parse(raw: &str, toml: bool) -> Result<Self> {
        Self::build(parse_config(raw, toml)?, None)
    }

    fn build(mut file: EdgeConfigFile, source: Option<PathBuf>) -> Result<Self> {
        let raw_cameras = file.cameras.take().unwrap_or_default();
        let mut cfg = Self::from_file(file)?;
        cfg.source = source;
        cfg.apply_env()?;
        cfg.validate()?;
        cfg.load_cameras(raw_cameras)?;
        Ok(cfg)
    }

    fn from_file(file: EdgeConfigFile) -> Result<Self> {
        let collector_file = file.collector.unwrap_or_default();
        let collector_defaults = CollectorSettings::default();
        let collector = CollectorSettings {
            api_base: file.api_base.unwrap_or(collector_defaults.api_base),
            events_path: collector_file
                .events_path
                .unwrap_or(collector_defaults.events_path),
            heartbeat_path: collector_file
                .heartbeat_path
                .unwrap_or(collector_defaults.heartbeat_path),
            events_timeout: secs_or(
                "collector.events_timeout_secs",
                collector_file.events_timeout_secs,
                collector_defaults.events_timeout,
            )?,
            heartbeat_timeout: secs_or(
                "collector.heartbeat_timeout_secs",
                collector_file.heartbeat_timeout_secs,
                collector_defaults.heartbeat_timeout,
            )?,
        };

        let delivery_file = file.delivery.unwrap_or_default();
        let delivery_defaults = DeliverySettings::default();
        let delivery = DeliverySettings {
            flush_interval: secs_or(
                "delivery.flush_interval_secs",
                delivery_file.flush_interval_secs,
                delivery_defaults.flush_interval,
            )?,
            max_batch: delivery_file.max_batch.unwrap_or(delivery_defaults.max_batch),
            handoff_capacity: delivery_file
                .handoff_capacity
                .unwrap_or(delivery_defaults.handoff_capacity),
            backoff: backoff_from(
                "delivery.backoff",
                delivery_file.backoff,
                delivery_defaults.backoff,
            )?,
            heartbeat_interval: secs_or(
                "delivery.heartbeat_interval_secs",
                delivery_file.heartbeat_interval_secs,
                delivery_defaults.heartbeat_interval,
            )?,
            max_buffered_batches: delivery_file
                .max_buffered_batches
                .unwrap_or(delivery_defaults.max_buffered_batches),
            replay_burst: delivery_file
                .replay_burst
                .unwrap_or(delivery_defaults.replay_burst),
            shutdown_grace: secs_or(
                "delivery.shutdown_grace_secs",
                delivery_file.shutdown_grace_secs,
                delivery_defaults.shutdown_grace,
            )?,
        };

        let tracking_file = file.tracking.unwrap_or_default();
        let tracker_defaults = TrackerConfig::default();
        let tracker = TrackerConfig {
            max_distance: tracking_file
                .max_distance
                .unwrap_or(tracker_defaults.max_distance),
            max_missed_frames: tracking_file
                .max_missed_frames
                .unwrap_or(tracker_defaults.max_missed_frames),
            disappear_after: secs_or(
                "tracking.disappear_after_secs",
                tracking_file.disappear_after_secs,
                tracker_defaults.disappear_after,
            )?,
            history_len: tracking_file
                .history_len
                .unwrap_or(tracker_defaults.history_len),
            anchor: tracking_file.anchor.unwrap_or(tracker_defaults.anchor),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline_defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            detector_failure_threshold: pipeline_file
                .detector_failure_threshold
                .unwrap_or(pipeline_defaults.detector_failure_threshold),
            frame_stride: pipeline_file
                .frame_stride
                .unwrap_or(pipeline_defaults.frame_stride),
            min_confidence: pipeline_file
                .min_confidence
                .unwrap_or(pipeline_defaults.min_confidence),
            reconnect: backoff_from(
                "pipeline.reconnect",
                pipeline_file.reconnect,
                pipeline_defaults.reconnect,
            )?,
            restart: backoff_from(
                "pipeline.restart",
                pipeline_file.restart,
                pipeline_defaults.restart,
            )?,
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector_defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(detector_defaults.backend),
            command: detector_file.command.unwrap_or(detector_defaults.command),
            timeout: secs_or(
                "detector.timeout_secs",
                detector_file.timeout_secs,
                detector_defaults.timeout,
            )?,
        };

        let stream_file = file.stream.unwrap_or_default();
        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            target_fps: stream_file.target_fps.unwrap_or(stream_defaults.target_fps),
            connect_timeout: secs_or(
                "stream.connect_timeout_secs",
                stream_file.connect_timeout_secs,
                stream_defaults.connect_timeout,
            )?,
            default_size: (
                stream_file
                    .default_width
                    .unwrap_or(stream_defaults.default_size.0),
                stream_file
                    .default_height
                    .unwrap_or(stream_defaults.default_size.1),
            ),
        };

        Ok(Self {
            org_id: file.org_id.unwrap_or_default(),
            store_id: file.store_id.unwrap_or_default(),
            api_key: file.api_key.unwrap_or_default(),
            collector,
            delivery,
            tracker,
            pipeline,
            detector,
            stream,
            buffer_dir: file
                .buffer_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUFFER_DIR)),
            status_addr: file
                .status_addr
                .unwrap_or_else(|| DEFAULT_STATUS_ADDR.to_string()),
            cameras: Vec::new(),
            rejected: Vec::new(),
            source: None,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(api_base) = env_string("EDGE_API_BASE") {
            self.collector.api_base = api_base;
        }
        if let Some(api_key) = env_string("EDGE_API_KEY") {
            self.api_key = api_key;
        }
        if let Some(org_id) = env_string("ORG_ID") {
            self.org_id = org_id;
        }
        if let Some(store_id) = env_string("STORE_ID") {
            self.store_id = store_id;
        }
        if let Some(dir) = env_string("EDGE_BUFFER_DIR") {
            self.buffer_dir = PathBuf::from(dir);
        }
        if let Some(addr) = env_string("EDGE_STATUS_ADDR") {
            self.status_addr = addr;
        }
        if let Some(seconds) = env_string("BATCH_SECONDS") {
            let seconds: f64 = seconds
                .parse()
                .map_err(|_| anyhow!("BATCH_SECONDS must be a number of seconds"))?;
            self.delivery.flush_interval = duration_from_secs("BATCH_SECONDS", seconds)?;
        }
        if let Some(max_batch) = env_string("MAX_BATCH") {
            self.delivery.max_batch = max_batch
                .parse()
                .map_err(|_| anyhow!("MAX_BATCH must be a positive integer"))?;
        }
        if let Some(factor) = env_string("BACKOFF_BASE") {
            self.delivery.backoff.factor = factor
                .parse()
                .map_err(|_| anyhow!("BACKOFF_BASE must be a number (backoff growth factor)"))?;
        }
        if let Some(seconds) = env_string("BACKOFF_MAX") {
            let seconds: f64 = seconds
                .parse()
                .map_err(|_| anyhow!("BACKOFF_MAX must be a number of seconds"))?;
            self.delivery.backoff.max = duration_from_secs("BACKOFF_MAX", seconds)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let global = |reason: String| anyhow::Error::new(Fault::config(None, reason));

        for (name, value) in [("org_id", &self.org_id), ("store_id", &self.store_id)] {
            if value.trim().is_empty() {
                return Err(global(format!("{} must be set", name)));
            }
        }
        validate_api_base(&self.collector.api_base).map_err(|e| global(format!("{:#}", e)))?;

        if self.delivery.max_batch == 0 {
            return Err(global("max_batch must be greater than zero".into()));
        }
        if self.delivery.flush_interval.is_zero() {
            return Err(global("flush interval must be greater than zero".into()));
        }
        for (name, policy) in [
            ("delivery backoff", &self.delivery.backoff),
            ("reconnect backoff", &self.pipeline.reconnect),
            ("restart backoff", &self.pipeline.restart),
        ] {
            validate_backoff(policy).map_err(|e| global(format!("{}: {}", name, e)))?;
        }
        if self.delivery.max_buffered_batches == 0 {
            return Err(global("max_buffered_batches must be greater than zero".into()));
        }
        if !(self.tracker.max_distance > 0.0 && self.tracker.max_distance.is_finite()) {
            return Err(global("tracking.max_distance must be a positive number".into()));
        }
        if self.tracker.history_len == 0 {
            return Err(global("tracking.history_len must be at least 1".into()));
        }
        if self.pipeline.frame_stride == 0 {
            return Err(global("pipeline.frame_stride must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.pipeline.min_confidence) {
            return Err(global("pipeline.min_confidence must be within [0, 1]".into()));
        }
        if self.detector.backend == "command" && self.detector.command.is_empty() {
            return Err(global("detector.command is required for the command backend".into()));
        }
        self.status_addr
            .parse::<SocketAddr>()
            .map_err(|e| global(format!("invalid status_addr '{}': {}", self.status_addr, e)))?;
        Ok(())
    }

    fn load_cameras(&mut self, raw: Vec<serde_json::Value>) -> Result<()> {
        let mut seen = HashSet::new();
        for (idx, value) in raw.into_iter().enumerate() {
            let label = value
                .get("camera_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match self.build_camera(value) {
                Ok(spec) if !seen.insert(spec.camera_id.clone()) => {
                    self.reject(Fault::config(
                        Some(&spec.camera_id),
                        "duplicate camera_id, keeping the first definition",
                    ));
                }
                Ok(spec) => self.cameras.push(spec),
                Err(err) => {
                    let label = label.unwrap_or_else(|| format!("cameras[{}]", idx));
                    self.reject(Fault::config(Some(&label), format!("{:#}", err)));
                }
            }
        }
        if self.cameras.is_empty() {
            return Err(Fault::config(None, "no valid camera configured").into());
        }
        Ok(())
    }

    fn reject(&mut self, fault: Fault) {
        warn!("{}", fault);
        self.rejected.push(fault);
    }

    fn build_camera(&self, value: serde_json::Value) -> Result<CameraSpec> {
        let file: CameraConfigFile = serde_json::from_value(value).context("malformed camera")?;

        let frame_size = file.frame_size.map(|[w, h]| (w, h));
        let reference_size = match (file.reference_size, frame_size) {
            (Some([w, h]), _) => Size::new(w, h),
            (None, Some((w, h))) => Size::from_pixels(w, h),
            (None, None) => return Err(anyhow!("reference_size is required")),
        };

        let mut regions = Vec::with_capacity(file.regions.len());
        for region in file.regions {
            regions.push(build_region(region)?);
        }
        if let Some(geometry) = file.geometry {
            regions.extend(geometry_regions(geometry)?);
        }

        let capabilities: BTreeSet<Capability> = match file.capabilities {
            Some(names) => names
                .iter()
                .map(|name| {
                    Capability::parse(name).ok_or_else(|| anyhow!("unknown capability '{}'", name))
                })
                .collect::<Result<_>>()?,
            None => regions.iter().map(Capability::for_region).collect(),
        };

        let api_key = file
            .api_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| self.api_key.clone());

        let spec = CameraSpec {
            camera_id: file.camera_id,
            stream: file.stream,
            api_key,
            reference_size,
            frame_size,
            capabilities,
            regions,
        };
        spec.validate()?;
        if spec.active_regions().next().is_none() {
            warn!(
                "[{}] no region is enabled by the camera's capabilities",
                spec.camera_id
            );
        }
        Ok(spec)
    }

    /// Settings shared by every camera's pipeline and client.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            org_id: self.org_id.clone(),
            store_id: self.store_id.clone(),
            delivery: self.delivery.clone(),
            pipeline: self.pipeline.clone(),
            tracker: self.tracker.clone(),
            detector: self.detector.clone(),
        }
    }
}

fn build_region(file: RegionConfigFile) -> Result<Region> {
    let label = file.label.as_deref().unwrap_or(&file.id).to_string();
    let points: Vec<Point> = file.points.iter().copied().map(Point::from).collect();
    if file.kind == "line" {
        if points.len() != 2 {
            return Err(anyhow!(
                "line '{}' needs exactly 2 points, got {}",
                file.id,
                points.len()
            ));
        }
        let positive = file.positive_side.unwrap_or(Side::Left);
        return Ok(Region::Line(LineRegion::new(
            &file.id, &label, points[0], points[1], positive,
        )?));
    }
    let kind = PolygonKind::parse(&file.kind)
        .ok_or_else(|| anyhow!("unknown region type '{}' for '{}'", file.kind, file.id))?;
    let mut polygon = PolygonRegion::new(&file.id, &label, kind, points)?;
    if let Some(tolerance) = file.tolerance {
        if !(tolerance >= 0.0 && tolerance.is_finite()) {
            return Err(anyhow!("tolerance of '{}' must be >= 0", file.id));
        }
        polygon = polygon.with_tolerance(tolerance);
    }
    Ok(Region::Polygon(polygon))
}

fn geometry_regions(geometry: GeometryConfigFile) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    if let Some(points) = geometry.entrance {
        regions.push(build_region(RegionConfigFile {
            kind: "line".into(),
            id: ENTRANCE_LINE_ID.into(),
            label: None,
            points,
            positive_side: None,
            tolerance: None,
        })?);
    }
    for (kind, polygons) in [
        (PolygonKind::Zone, geometry.zones),
        (PolygonKind::Shelf, geometry.shelves),
        (PolygonKind::Queue, geometry.queue),
    ] {
        for (id, points) in polygons.unwrap_or_default() {
            let points = points.into_iter().map(Point::from).collect();
            regions.push(Region::Polygon(PolygonRegion::new(&id, &id, kind, points)?));
        }
    }
    Ok(regions)
}

fn validate_backoff(policy: &BackoffPolicy) -> Result<()> {
    if policy.initial.is_zero() {
        return Err(anyhow!("initial delay must be greater than zero"));
    }
    if !(policy.factor >= 1.0 && policy.factor.is_finite()) {
        return Err(anyhow!("factor must be >= 1, got {}", policy.factor));
    }
    if policy.max < policy.initial {
        return Err(anyhow!(
            "max delay {:?} is below the initial delay {:?}",
            policy.max,
            policy.initial
        ));
    }
    if !(0.0..1.0).contains(&policy.jitter) {
        return Err(anyhow!("jitter must be within [0, 1), got {}", policy.jitter));
    }
    Ok(())
}

fn backoff_from(
    name: &str,
    file: Option<BackoffConfigFile>,
    defaults: BackoffPolicy,
) -> Result<BackoffPolicy> {
    let file = file.unwrap_or_default();
    Ok(BackoffPolicy {
        initial: secs_or(&format!("{}.initial_secs", name), file.initial_secs, defaults.initial)?,
        factor: file.factor.unwrap_or(defaults.factor),
        max: secs_or(&format!("{}.max_secs", name), file.max_secs, defaults.max)?,
        jitter: file.jitter.unwrap_or(defaults.jitter),
    })
}

fn secs_or(name: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        Some(seconds) => duration_from_secs(name, seconds),
        None => Ok(default),
    }
}

fn duration_from_secs(name: &str, seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds, got {}", name, seconds))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_config(raw: &str, toml: bool) -> Result<EdgeConfigFile> {
    if toml {
        Ok(toml::from_str(raw)?)
    } else {
        Ok(serde_json::from_str(raw)?)
    }
}

fn read_config_file(path: &Path) -> Result<EdgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    parse_config(&raw, is_toml)
        .map_err(|e| anyhow!("invalid config file {}: {:#}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(cameras: &str) -> String {
        format!(
            r#"{{
                "org_id": "org-1",
                "store_id": "store-1",
                "api_base": "https://collector.example.com",
                "api_key": "global-key",
                "cameras": {}
            }}"#,
            cameras
        )
    }

    #[test]
    fn regions_and_compact_geometry_build_cameras() -> Result<()> {
        let cfg = EdgeConfig::parse(
            &base(
                r#"[{
                    "camera_id": "cam-a",
                    "rtsp": "stub://a",
                    "reference_size": [1920, 1080],
                    "regions": [
                        {"type": "line", "id": "door", "points": [[0, 500], [1920, 500]], "positive_side": "right"},
                        {"type": "shelf", "id": "s1", "label": "Snacks", "points": [[0,0],[10,0],[10,10]], "tolerance": 5}
                    ],
                    "geometry": {"queue": {"checkout": [[500,300],[700,300],[700,500],[500,500]]}}
                }]"#,
            ),
            false,
        )?;
        let cam = &cfg.cameras[0];
        assert_eq!(cam.api_key, "global-key");
        let kinds: Vec<&str> = cam.regions.iter().map(|r| r.kind_name()).collect();
        assert_eq!(kinds, vec!["line", "shelf", "queue"]);
        let caps: Vec<Capability> = cam.capabilities.iter().copied().collect();
        assert_eq!(
            caps,
            vec![Capability::Entrance, Capability::Shelves, Capability::Queue]
        );
        Ok(())
    }

    #[test]
    fn bad_camera_is_rejected_alone() -> Result<()> {
        let cfg = EdgeConfig::parse(
            &base(
                r#"[
                    {"camera_id": "cam-a", "stream": "stub://a", "reference_size": [640, 480]},
                    {"camera_id": "cam-b", "stream": "stub://b", "reference_size": [640, 480],
                     "regions": [{"type": "zone", "id": "z", "points": [[0,0],[1,1]]}]},
                    {"camera_id": "cam-a", "stream": "stub://dup", "reference_size": [640, 480]},
                    {"stream": "stub://anonymous"}
                ]"#,
            ),
            false,
        )?;
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].stream, "stub://a");
        let rejected: Vec<Option<String>> = cfg
            .rejected
            .iter()
            .map(|f| match f {
                Fault::Config { camera_id, .. } => camera_id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            rejected,
            vec![
                Some("cam-b".to_string()),
                Some("cam-a".to_string()),
                Some("cameras[3]".to_string())
            ]
        );
        Ok(())
    }

    #[test]
    fn no_surviving_camera_fails_the_load() {
        let err = EdgeConfig::parse(
            &base(r#"[{"camera_id": "bad id!", "stream": "stub://a", "reference_size": [1, 1]}]"#),
            false,
        )
        .expect_err("no valid camera");
        assert!(matches!(
            err.downcast_ref::<Fault>(),
            Some(Fault::Config { camera_id: None, .. })
        ));
    }

    #[test]
    fn global_settings_are_validated() {
        let raw = r#"{"org_id": "o", "store_id": "s", "api_base": "ftp://x", "api_key": "k",
                      "cameras": [{"camera_id": "c", "stream": "stub://c", "reference_size": [1, 1]}]}"#;
        assert!(EdgeConfig::parse(raw, false).is_err());

        let raw = r#"{"org_id": "o", "store_id": "s", "api_base": "http://x", "api_key": "k",
                      "delivery": {"backoff": {"factor": 0.5}},
                      "cameras": [{"camera_id": "c", "stream": "stub://c", "reference_size": [1, 1]}]}"#;
        assert!(EdgeConfig::parse(raw, false).is_err());
    }

    #[test]
    fn toml_sections_fill_settings() -> Result<()> {
        let raw = r#"
            org_id = "org-1"
            store_id = "store-1"
            api_base = "http://127.0.0.1:9000"
            api_key = "k"

            [delivery]
            flush_interval_secs = 0.5
            max_batch = 50

            [tracking]
            anchor = "center"
            disappear_after_secs = 4

            [pipeline]
            frame_stride = 5

            [[cameras]]
            camera_id = "cam-t"
            stream = "stub://t"
            frame_size = [640, 480]
            capabilities = ["zones"]

            [cameras.geometry.zones]
            front = [[0, 0], [100, 0], [100, 100], [0, 100]]
        "#;
        let cfg = EdgeConfig::parse(raw, true)?;
        assert_eq!(cfg.delivery.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.delivery.max_batch, 50);
        assert_eq!(cfg.tracker.anchor, AnchorPoint::Center);
        assert_eq!(cfg.tracker.disappear_after, Duration::from_secs(4));
        assert_eq!(cfg.pipeline.frame_stride, 5);
        let cam = &cfg.cameras[0];
        assert_eq!(cam.reference_size, Size::new(640.0, 480.0));
        assert_eq!(cam.regions[0].id(), "front");
        Ok(())
    }
}
