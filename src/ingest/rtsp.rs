//! RTSP frame source.
//!
//! `RtspSource` connects to IP camera streams via GStreamer, with a synthetic
//! fallback for `stub://` URLs. Frames are decoded to packed RGB24.
//!
//! Connect is bounded by `connect_timeout`; a read that yields no frame for
//! several frame intervals is reported as a stalled stream so the pipeline can
//! close and reconnect.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use std::time::{Duration, Instant};

use crate::camera::CameraSpec;
use crate::frame::Frame;
use crate::ingest::{FrameSource, StreamSettings};

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream") or "stub://name".
    pub url: String,
    /// Target frame rate. Synthetic sources pace to it; 0 disables pacing.
    pub target_fps: u32,
    /// Output frame width.
    pub width: u32,
    /// Output frame height.
    pub height: u32,
    /// Whether `width`/`height` force a rescale of the decoded stream.
    pub force_size: bool,
    pub connect_timeout: Duration,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 1280,
            height: 720,
            force_size: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RtspConfig {
    pub fn for_camera(spec: &CameraSpec, settings: &StreamSettings) -> Self {
        let (width, height) = spec.frame_size.unwrap_or(settings.default_size);
        Self {
            url: spec.stream.clone(),
            target_fps: settings.target_fps,
            width,
            height,
            force_size: spec.frame_size.is_some(),
            connect_timeout: settings.connect_timeout,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "stream '{}' requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }
}

/// Statistics for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub reconnects: u64,
    pub url: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    connects: u64,
    connected: bool,
    next_due: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connects: 0,
            connected: false,
            next_due: None,
        }
    }

    /// Synthetic sources always connect.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.connects += 1;
        self.next_due = None;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            anyhow::bail!("synthetic stream {} is not connected", self.config.url);
        }
        self.pace();
        self.frame_count += 1;

        // Flat frame whose shade drifts slowly, enough for external detectors to decode.
        let shade = ((self.frame_count / 10) % 200) as u8 + 28;
        let len = (self.config.width as usize) * (self.config.height as usize) * 3;
        Ok(Frame::new(
            vec![shade; len],
            self.config.width,
            self.config.height,
            self.frame_count,
        ))
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.target_fps as f64);
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + interval);
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            reconnects: self.connects.saturating_sub(1),
            url: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    connects: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert [! videoscale] ! appsink (RGB).
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let scale = if config.force_size {
            format!(
                "videoscale ! video/x-raw,format=RGB,width={},height={}",
                config.width, config.height
            )
        } else {
            "video/x-raw,format=RGB".to_string()
        };
        let timeout_us = config.connect_timeout.as_micros();
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 protocols=tcp timeout={} ! decodebin ! videoconvert ! {} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url, timeout_us, scale
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            connects: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        let wait = gstreamer::ClockTime::from_mseconds(self.config.connect_timeout.as_millis() as u64);
        let (result, current, _pending) = self.pipeline.state(Some(wait));
        result.map_err(|_| anyhow::anyhow!("RTSP connect to {} failed", self.config.url))?;
        if current != gstreamer::State::Playing {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
            anyhow::bail!(
                "RTSP connect to {} timed out after {:?}",
                self.config.url,
                self.config.connect_timeout
            );
        }
        self.connected_at = Some(Instant::now());
        self.connects += 1;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}", err);
        }

        let timeout = self.frame_timeout();
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame::new(pixels, width, height, self.frame_count))
    }

    fn close(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop {}: {:?}", self.config.url, err);
        }
        self.connected_at = None;
        self.last_frame_at = None;
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= self.config.connect_timeout;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            reconnects: self.connects.saturating_sub(1),
            url: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 0,
            width: 64,
            height: 48,
            force_size: true,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.pixels().len(), 64 * 48 * 3);
        assert_eq!(frame.seq, 1);
        assert_eq!(source.next_frame()?.seq, 2);

        Ok(())
    }

    #[test]
    fn synthetic_source_requires_connect() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        assert!(source.next_frame().is_err());
        source.connect()?;
        source.close();
        assert!(!source.is_healthy());
        assert!(source.next_frame().is_err());
        source.connect()?;
        assert!(source.next_frame().is_ok());
        assert_eq!(source.stats().reconnects, 1);
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_needs_feature() {
        let config = RtspConfig {
            url: "rtsp://10.0.0.5/stream".into(),
            ..stub_config()
        };
        assert!(RtspSource::new(config).is_err());
    }
}
