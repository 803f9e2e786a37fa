//! Store regions: entrance lines and zone/shelf/queue polygons.
//!
//! Regions are built through validating constructors so that a line always
//! has a definite positive side and a polygon always has at least 3 points.
//! Coordinates live in reference (screenshot) space until `scaled` maps them
//! into a live frame.

use crate::geometry::{scale_point, scale_points, GeometryError, Line, Point, Side, Size};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;

const MAX_ID_LEN: usize = 64;

/// Ids are path and log safe: `^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$`.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$").expect("id regex must compile")
    });
    if id.len() > MAX_ID_LEN || !re.is_match(id) {
        return Err(anyhow!(
            "invalid {} id '{}': must match [A-Za-z0-9][A-Za-z0-9_.:-]{{0,63}}",
            kind,
            id
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolygonKind {
    Zone,
    Shelf,
    Queue,
}

impl PolygonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolygonKind::Zone => "zone",
            PolygonKind::Shelf => "shelf",
            PolygonKind::Queue => "queue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "zone" => Some(PolygonKind::Zone),
            "shelf" => Some(PolygonKind::Shelf),
            "queue" => Some(PolygonKind::Queue),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LineRegion {
    id: String,
    label: String,
    line: Line,
}

impl LineRegion {
    pub fn new(id: &str, label: &str, a: Point, b: Point, positive: Side) -> Result<Self> {
        validate_id("line", id)?;
        if positive == Side::On {
            return Err(anyhow!("line '{}': positive side must be left or right", id));
        }
        if a == b {
            return Err(anyhow!("line '{}': endpoints must differ", id));
        }
        Ok(Self {
            id: id.to_string(),
            label: label.to_string(),
            line: Line::new(a, b, positive),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn line(&self) -> &Line {
        &self.line
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolygonRegion {
    id: String,
    label: String,
    kind: PolygonKind,
    points: Vec<Point>,
    tolerance: f64,
}

impl PolygonRegion {
    pub fn new(id: &str, label: &str, kind: PolygonKind, points: Vec<Point>) -> Result<Self> {
        validate_id(kind.as_str(), id)?;
        if points.len() < 3 {
            return Err(anyhow!(
                "{} '{}': polygon needs at least 3 points, got {}",
                kind.as_str(),
                id,
                points.len()
            ));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(anyhow!("{} '{}': non-finite coordinate", kind.as_str(), id));
        }
        Ok(Self {
            id: id.to_string(),
            label: label.to_string(),
            kind,
            points,
            tolerance: 0.0,
        })
    }

    /// Accept anchors within `tolerance` pixels of an edge (live space).
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.max(0.0);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> PolygonKind {
        self.kind
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Region {
    Line(LineRegion),
    Polygon(PolygonRegion),
}

impl Region {
    pub fn id(&self) -> &str {
        match self {
            Region::Line(line) => line.id(),
            Region::Polygon(poly) => poly.id(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Region::Line(line) => line.label(),
            Region::Polygon(poly) => poly.label(),
        }
    }

    /// Config name of the region type: `line`, `zone`, `shelf` or `queue`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Region::Line(_) => "line",
            Region::Polygon(poly) => poly.kind().as_str(),
        }
    }

    /// Maps the region from `reference` into `live` coordinates.
    pub fn scaled(&self, reference: Size, live: Size) -> Result<Region, GeometryError> {
        match self {
            Region::Line(line) => {
                let mut scaled = line.clone();
                scaled.line.a = scale_point(line.line.a, reference, live)?;
                scaled.line.b = scale_point(line.line.b, reference, live)?;
                Ok(Region::Line(scaled))
            }
            Region::Polygon(poly) => {
                let mut scaled = poly.clone();
                scaled.points = scale_points(&poly.points, reference, live)?;
                Ok(Region::Polygon(scaled))
            }
        }
    }
}
