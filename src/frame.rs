//! Decoded video frames.
//!
//! A `Frame` lives for one pipeline iteration: it is handed to the detector by
//! reference and dropped before the next read. Nothing downstream of the
//! detector sees pixels.

use crate::geometry::Size;
use std::time::Instant;

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-connection sequence number, starting at 1.
    pub seq: u64,
    captured_at: Instant,
}

impl Frame {
    /// Packed RGB24 frame.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            seq,
            captured_at: Instant::now(),
        }
    }

    /// Frame with no pixel payload, used by sources whose detector needs only geometry.
    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self::new(Vec::new(), width, height, seq)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn size(&self) -> Size {
        Size::from_pixels(self.width, self.height)
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("seq", &self.seq)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
