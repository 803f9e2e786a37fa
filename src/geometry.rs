//! Geometry engine: polygon containment, line sides, resolution rescaling.
//!
//! All functions are pure. Coordinates are pixels with the image convention
//! (x right, y down); "left" and "right" are defined by the sign of the 2D
//! cross product, not by how the line looks on screen.

use serde::{Deserialize, Serialize};

/// Distance under which a point counts as lying on a polygon edge.
const EDGE_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<[f64; 2]> for Point {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

/// Width and height of a coordinate space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn from_pixels(width: u32, height: u32) -> Self {
        Self::new(width as f64, height as f64)
    }

    fn is_valid(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.width.is_finite() && self.height.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    On,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Directed line `a -> b` with the side that counts as "inside".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub a: Point,
    pub b: Point,
    pub positive: Side,
}

impl Line {
    pub fn new(a: Point, b: Point, positive: Side) -> Self {
        Self { a, b, positive }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeometryError {
    InvalidDimension { width: f64, height: f64 },
}

impl std::fmt::Display for GeometryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometryError::InvalidDimension { width, height } => {
                write!(f, "invalid dimension {}x{}: both sides must be > 0", width, height)
            }
        }
    }
}

impl std::error::Error for GeometryError {}

/// Rescales a point from `reference` space into `live` space, per axis.
pub fn scale_point(point: Point, reference: Size, live: Size) -> Result<Point, GeometryError> {
    for size in [reference, live] {
        if !size.is_valid() {
            return Err(GeometryError::InvalidDimension {
                width: size.width,
                height: size.height,
            });
        }
    }
    Ok(Point::new(
        point.x * (live.width / reference.width),
        point.y * (live.height / reference.height),
    ))
}

pub fn scale_points(points: &[Point], reference: Size, live: Size) -> Result<Vec<Point>, GeometryError> {
    points
        .iter()
        .map(|p| scale_point(*p, reference, live))
        .collect()
}

/// Even-odd containment test. Points on an edge or vertex are inside.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    point_in_polygon_with_tolerance(point, polygon, 0.0)
}

/// Containment test that also accepts points within `tolerance` pixels of an edge.
pub fn point_in_polygon_with_tolerance(point: Point, polygon: &[Point], tolerance: f64) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let edge_slack = tolerance.max(EDGE_EPSILON);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if distance_to_segment(point, pj, pi) <= edge_slack {
            return true;
        }
        if (pi.y > point.y) != (pj.y > point.y) {
            let x_cross = (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance(Point::new(a.x + t * dx, a.y + t * dy))
}

/// Side of `point` relative to the directed line `a -> b`.
pub fn side_of_line(point: Point, line: &Line) -> Side {
    let cross = (line.b.x - line.a.x) * (point.y - line.a.y)
        - (line.b.y - line.a.y) * (point.x - line.a.x);
    if cross > 0.0 {
        Side::Left
    } else if cross < 0.0 {
        Side::Right
    } else {
        Side::On
    }
}

/// Resolves a move between two sides into a crossing direction.
///
/// `On` at either end, or no change of side, is not a crossing.
pub fn direction_between(from: Side, to: Side, positive: Side) -> Option<Direction> {
    if from == Side::On || to == Side::On || from == to {
        return None;
    }
    if to == positive {
        Some(Direction::In)
    } else {
        Some(Direction::Out)
    }
}

/// Crossing direction for a centroid moving from `prev` to `curr`.
pub fn crossed(prev: Point, curr: Point, line: &Line) -> Option<Direction> {
    direction_between(side_of_line(prev, line), side_of_line(curr, line), line.positive)
}
