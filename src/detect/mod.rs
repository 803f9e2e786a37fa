mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{CommandBackend, ScriptStep, ScriptedBackend, SimulatedWalkerBackend};
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{AnchorPoint, BoundingBox, Detection};

use std::time::Duration;

/// Detector settings shared by every camera.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    /// Registry name; empty selects the registry default.
    pub backend: String,
    /// Program and arguments for the `command` backend.
    pub command: Vec<String>,
    /// Per-frame reply timeout for the `command` backend.
    pub timeout: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: String::new(),
            command: Vec::new(),
            timeout: Duration::from_secs(2),
        }
    }
}
