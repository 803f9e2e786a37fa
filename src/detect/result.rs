use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// Axis-aligned box in live frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Horizontal center at knee height, a quarter of the box above its bottom.
    pub fn knee_point(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2 - self.height() / 4.0)
    }

    pub fn anchor(&self, anchor: AnchorPoint) -> Point {
        match anchor {
            AnchorPoint::Center => self.center(),
            AnchorPoint::Knee => self.knee_point(),
        }
    }
}

/// Which point of a person's box stands for their position on the floor plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPoint {
    Center,
    #[default]
    Knee,
}

/// One detected person.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}
