//! Immutable per-camera configuration.
//!
//! A `CameraSpec` is built once at config load and shared read-only with the
//! pipeline and event client. Changing any field means restarting that
//! camera's pipeline with a fresh spec.

use crate::geometry::{GeometryError, Size};
use crate::region::{validate_id, PolygonKind, Region};
use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashSet};

/// Region types a camera evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Entrance,
    Zones,
    Shelves,
    Queue,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Entrance,
        Capability::Zones,
        Capability::Shelves,
        Capability::Queue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Entrance => "entrance",
            Capability::Zones => "zones",
            Capability::Shelves => "shelves",
            Capability::Queue => "queue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "entrance" => Some(Capability::Entrance),
            "zones" | "zone" => Some(Capability::Zones),
            "shelves" | "shelf" => Some(Capability::Shelves),
            "queue" | "queues" => Some(Capability::Queue),
            _ => None,
        }
    }

    /// Capability that enables evaluation of `region`.
    pub fn for_region(region: &Region) -> Self {
        match region {
            Region::Line(_) => Capability::Entrance,
            Region::Polygon(poly) => match poly.kind() {
                PolygonKind::Zone => Capability::Zones,
                PolygonKind::Shelf => Capability::Shelves,
                PolygonKind::Queue => Capability::Queue,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CameraSpec {
    pub camera_id: String,
    /// `rtsp://...` or `stub://...`.
    pub stream: String,
    /// Bearer credential for this camera's collector requests.
    pub api_key: String,
    /// Resolution the regions were drawn against.
    pub reference_size: Size,
    /// Requested decode resolution; `None` keeps the stream's native size.
    pub frame_size: Option<(u32, u32)>,
    pub capabilities: BTreeSet<Capability>,
    pub regions: Vec<Region>,
}

impl CameraSpec {
    pub fn validate(&self) -> Result<()> {
        validate_id("camera", &self.camera_id)?;
        if self.stream.trim().is_empty() {
            return Err(anyhow!("stream must not be empty"));
        }
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("no api_key configured (set per camera or EDGE_API_KEY)"));
        }
        if !(self.reference_size.width > 0.0 && self.reference_size.height > 0.0) {
            return Err(GeometryError::InvalidDimension {
                width: self.reference_size.width,
                height: self.reference_size.height,
            }
            .into());
        }
        if let Some((w, h)) = self.frame_size {
            if w == 0 || h == 0 {
                return Err(anyhow!("frame_size must be > 0, got {}x{}", w, h));
            }
        }
        let mut seen = HashSet::new();
        for region in &self.regions {
            if !seen.insert((region.kind_name(), region.id())) {
                return Err(anyhow!(
                    "duplicate {} id '{}'",
                    region.kind_name(),
                    region.id()
                ));
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Regions whose type is enabled by the camera's capabilities, in config order.
    pub fn active_regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions
            .iter()
            .filter(|region| self.is_enabled(Capability::for_region(region)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Side};
    use crate::region::{LineRegion, PolygonRegion};

    fn spec(capabilities: &[Capability]) -> Result<CameraSpec> {
        Ok(CameraSpec {
            camera_id: "cam-1".into(),
            stream: "stub://lobby".into(),
            api_key: "secret".into(),
            reference_size: Size::new(1920.0, 1080.0),
            frame_size: None,
            capabilities: capabilities.iter().copied().collect(),
            regions: vec![
                Region::Line(LineRegion::new(
                    "door",
                    "Door",
                    Point::new(0.0, 500.0),
                    Point::new(1920.0, 500.0),
                    Side::Left,
                )?),
                Region::Polygon(PolygonRegion::new(
                    "aisle-3",
                    "Aisle 3",
                    PolygonKind::Zone,
                    vec![
                        Point::new(0.0, 0.0),
                        Point::new(10.0, 0.0),
                        Point::new(10.0, 10.0),
                    ],
                )?),
            ],
        })
    }

    #[test]
    fn capabilities_gate_regions() -> Result<()> {
        let camera = spec(&[Capability::Zones])?;
        let ids: Vec<&str> = camera.active_regions().map(Region::id).collect();
        assert_eq!(ids, vec!["aisle-3"]);
        Ok(())
    }

    #[test]
    fn validate_rejects_missing_key_and_duplicates() -> Result<()> {
        let mut camera = spec(&Capability::ALL)?;
        camera.validate()?;
        camera.api_key.clear();
        assert!(camera.validate().is_err());

        let mut camera = spec(&Capability::ALL)?;
        let dup = camera.regions[1].clone();
        camera.regions.push(dup);
        let err = camera.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate zone id"));
        Ok(())
    }

    #[test]
    fn capability_names_parse() {
        assert_eq!(Capability::parse("Shelves"), Some(Capability::Shelves));
        assert_eq!(Capability::parse("queue"), Some(Capability::Queue));
        assert_eq!(Capability::parse("parking"), None);
    }
}
