use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Demo backend for `stub://` streams.
///
/// Reports two simulated shoppers whose positions depend only on the frame
/// sequence number: one walks top to bottom through the middle of the frame,
/// the other left to right across its lower half.
pub struct SimulatedWalkerBackend {
    vertical_period: u64,
    horizontal_period: u64,
}

impl SimulatedWalkerBackend {
    pub const NAME: &'static str = "stub";

    pub fn new() -> Self {
        Self {
            vertical_period: 120,
            horizontal_period: 200,
        }
    }
}

impl Default for SimulatedWalkerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Position along a walk in [-0.2, 1.2], so walkers enter and leave the frame.
fn phase(seq: u64, period: u64) -> f64 {
    let t = (seq % period) as f64 / period as f64;
    -0.2 + 1.4 * t
}

impl DetectorBackend for SimulatedWalkerBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (w, h) = (frame.width as f64, frame.height as f64);
        let (box_w, box_h) = (w * 0.08, h * 0.3);

        let walkers = [
            (0.5 * w, phase(frame.seq, self.vertical_period) * h),
            (phase(frame.seq, self.horizontal_period) * w, 0.65 * h),
        ];

        Ok(walkers
            .iter()
            .filter(|(cx, cy)| *cx >= 0.0 && *cx <= w && *cy >= 0.0 && *cy <= h)
            .map(|(cx, cy)| {
                Detection::new(
                    BoundingBox::new(
                        cx - box_w / 2.0,
                        cy - box_h / 2.0,
                        cx + box_w / 2.0,
                        cy + box_h / 2.0,
                    ),
                    0.9,
                )
            })
            .collect())
    }
}
