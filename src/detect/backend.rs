use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Person detector backend.
///
/// The pipeline calls `detect` once per processed frame and treats any error
/// as a skipped frame. Backends only report the person class.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Boxes are in the frame's pixel coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
