//! Frame ingestion sources.
//!
//! - RTSP streams via GStreamer (feature: rtsp-gstreamer)
//! - `stub://` synthetic streams for demos
//! - `ScriptedSource` for tests
//!
//! Sources are created per camera through a `SourceFactory`, so the
//! supervisor can rebuild a source on every pipeline restart and tests can
//! inject scripted sources.

pub mod rtsp;
mod scripted;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};
pub use scripted::{ScriptedSource, SourceStep};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::camera::CameraSpec;
use crate::frame::Frame;

/// A connectable stream of decoded frames.
pub trait FrameSource: Send {
    /// Open the stream. Must honour the source's connect timeout.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available. Errors are stream faults.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Release the connection; `connect` may be called again afterwards.
    fn close(&mut self) {}

    fn is_healthy(&self) -> bool {
        true
    }
}

pub type SourceFactory = Arc<dyn Fn(&CameraSpec) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Stream settings shared by every camera.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    pub target_fps: u32,
    pub connect_timeout: Duration,
    /// Decode size for cameras that do not declare `frame_size`.
    pub default_size: (u32, u32),
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            target_fps: 10,
            connect_timeout: Duration::from_secs(10),
            default_size: (1280, 720),
        }
    }
}

/// Factory building an `RtspSource` (or synthetic `stub://` source) per camera.
pub fn rtsp_source_factory(settings: StreamSettings) -> SourceFactory {
    Arc::new(move |spec: &CameraSpec| {
        let config = RtspConfig::for_camera(spec, &settings);
        Ok(Box::new(RtspSource::new(config)?) as Box<dyn FrameSource>)
    })
}
