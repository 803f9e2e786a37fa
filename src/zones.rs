//! Per-(track, region) state machines.
//!
//! Polygon regions: `outside -> inside` records `enter_ts`; `inside -> outside`
//! (anchor left the polygon, or the track was retired) emits one presence
//! event and drops the occupancy. An occupancy only exists while inside.
//!
//! Line regions: the last definite side of each track is remembered (`On` is
//! skipped), and a change of side emits an `entrance` event at once.
//!
//! Regions are evaluated in config order, tracks in id order, so a frame
//! always produces its events in the same order.

use std::collections::HashMap;

use anyhow::Result;

use crate::camera::CameraSpec;
use crate::clock::Timestamp;
use crate::event::Event;
use crate::geometry::{direction_between, point_in_polygon_with_tolerance, side_of_line, Side, Size};
use crate::region::Region;
use crate::tracker::Track;

/// Stable key of a person within one pipeline session.
pub fn person_key(camera_id: &str, session: i64, track_id: u64) -> String {
    format!("{}_s{}_t{}", camera_id, session, track_id)
}

pub struct RegionEvaluator {
    camera_id: String,
    session: i64,
    reference_size: Size,
    /// Enabled regions in reference coordinates.
    regions: Vec<Region>,
    /// `regions` mapped into the current live frame size.
    live: Vec<Region>,
    live_size: Option<Size>,
    occupancy: HashMap<(u64, usize), Timestamp>,
    line_sides: HashMap<(u64, usize), Side>,
}

impl RegionEvaluator {
    /// Evaluator over the camera's capability-enabled regions.
    pub fn new(spec: &CameraSpec, session: i64) -> Self {
        Self {
            camera_id: spec.camera_id.clone(),
            session,
            reference_size: spec.reference_size,
            regions: spec.active_regions().cloned().collect(),
            live: Vec::new(),
            live_size: None,
            occupancy: HashMap::new(),
            line_sides: HashMap::new(),
        }
    }

    pub fn session(&self) -> i64 {
        self.session
    }

    pub fn person_key(&self, track_id: u64) -> String {
        person_key(&self.camera_id, self.session, track_id)
    }

    /// Number of open polygon occupancies.
    pub fn open_occupancies(&self) -> usize {
        self.occupancy.len()
    }

    fn rescale(&mut self, live_size: Size) -> Result<()> {
        if self.live_size == Some(live_size) {
            return Ok(());
        }
        self.live = self
            .regions
            .iter()
            .map(|r| r.scaled(self.reference_size, live_size))
            .collect::<Result<_, _>>()?;
        if self.live_size.is_some() {
            log::info!(
                "[{}] frame size changed to {}x{}, regions rescaled",
                self.camera_id,
                live_size.width,
                live_size.height
            );
        }
        self.live_size = Some(live_size);
        Ok(())
    }

    /// Runs every state machine for the given tracks at time `now`.
    pub fn evaluate<'a>(
        &mut self,
        tracks: impl IntoIterator<Item = &'a Track>,
        live_size: Size,
        now: Timestamp,
    ) -> Result<Vec<Event>> {
        self.rescale(live_size)?;
        let mut events = Vec::new();
        let mut tracks: Vec<&Track> = tracks.into_iter().collect();
        tracks.sort_by_key(|t| t.id());

        for track in tracks {
            let anchor = track.centroid();
            for (idx, region) in self.live.iter().enumerate() {
                let key = (track.id(), idx);
                match region {
                    Region::Line(line) => {
                        let side = side_of_line(anchor, line.line());
                        if side == Side::On {
                            continue;
                        }
                        if let Some(prev) = self.line_sides.insert(key, side) {
                            if let Some(direction) =
                                direction_between(prev, side, line.line().positive)
                            {
                                events.push(Event::entrance(
                                    &self.camera_id,
                                    &person_key(&self.camera_id, self.session, track.id()),
                                    line.id(),
                                    direction,
                                    now,
                                ));
                            }
                        }
                    }
                    Region::Polygon(poly) => {
                        let inside =
                            point_in_polygon_with_tolerance(anchor, poly.points(), poly.tolerance());
                        match (inside, self.occupancy.get(&key).copied()) {
                            (true, None) => {
                                self.occupancy.insert(key, now);
                            }
                            (false, Some(enter_ts)) => {
                                self.occupancy.remove(&key);
                                events.push(Event::presence(
                                    poly.kind(),
                                    &self.camera_id,
                                    &person_key(&self.camera_id, self.session, track.id()),
                                    poly.id(),
                                    enter_ts,
                                    now,
                                ));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(events)
    }

    /// Force-closes every occupancy of a retired track and forgets its line sides.
    pub fn close_track(&mut self, track_id: u64, now: Timestamp) -> Vec<Event> {
        let mut events = Vec::new();
        for (idx, region) in self.live.iter().enumerate() {
            let key = (track_id, idx);
            self.line_sides.remove(&key);
            if let (Region::Polygon(poly), Some(enter_ts)) = (region, self.occupancy.remove(&key)) {
                events.push(Event::presence(
                    poly.kind(),
                    &self.camera_id,
                    &person_key(&self.camera_id, self.session, track_id),
                    poly.id(),
                    enter_ts,
                    now,
                ));
            }
        }
        events
    }

    /// Force-closes every open occupancy, for orderly pipeline stop.
    pub fn close_all(&mut self, now: Timestamp) -> Vec<Event> {
        let mut track_ids: Vec<u64> = self
            .occupancy
            .keys()
            .chain(self.line_sides.keys())
            .map(|(track_id, _)| *track_id)
            .collect();
        track_ids.sort_unstable();
        track_ids.dedup();
        track_ids
            .into_iter()
            .flat_map(|id| self.close_track(id, now))
            .collect()
    }
}
