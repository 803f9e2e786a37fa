//! Frame-to-frame person tracking.
//!
//! Greedy nearest-anchor association: every (track, detection) pair within
//! `max_distance` is a candidate, candidates are taken in ascending distance
//! order, and each track and detection is used at most once. Unmatched
//! detections open new tracks; unmatched tracks age and are retired after
//! `max_missed_frames` misses or `disappear_after` without a sighting.
//!
//! Retired tracks are returned by `update` so the caller can close their
//! region occupancies before the identity is gone.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::clock::Timestamp;
use crate::detect::{AnchorPoint, BoundingBox, Detection};
use crate::geometry::Point;

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Gate for associating a detection with a track, in live pixels.
    pub max_distance: f64,
    pub max_missed_frames: u32,
    pub disappear_after: Duration,
    /// Centroids kept per track, newest last.
    pub history_len: usize,
    pub anchor: AnchorPoint,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 120.0,
            max_missed_frames: 30,
            disappear_after: Duration::from_secs(10),
            history_len: 32,
            anchor: AnchorPoint::Knee,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Track {
    id: u64,
    centroid: Point,
    bbox: BoundingBox,
    history: VecDeque<Point>,
    first_seen: Timestamp,
    last_seen: Timestamp,
    missed: u32,
}

impl Track {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn centroid(&self) -> Point {
        self.centroid
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Recent centroids, oldest first; the last entry is the current centroid.
    pub fn history(&self) -> impl Iterator<Item = &Point> {
        self.history.iter()
    }

    pub fn first_seen(&self) -> Timestamp {
        self.first_seen
    }

    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    /// Consecutive frames without a matching detection.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    fn observe(&mut self, bbox: BoundingBox, centroid: Point, now: Timestamp, history_len: usize) {
        self.bbox = bbox;
        self.centroid = centroid;
        self.last_seen = now;
        self.missed = 0;
        self.history.push_back(centroid);
        while self.history.len() > history_len.max(1) {
            self.history.pop_front();
        }
    }
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Associates one frame's detections and returns the tracks retired by it.
    pub fn update(&mut self, detections: &[Detection], now: Timestamp) -> Vec<Track> {
        let anchors: Vec<Point> = detections
            .iter()
            .map(|d| d.bbox.anchor(self.config.anchor))
            .collect();

        let mut candidates: Vec<(f64, u64, usize)> = Vec::new();
        for (track_id, track) in &self.tracks {
            for (det_idx, anchor) in anchors.iter().enumerate() {
                let dist = track.centroid.distance(*anchor);
                if dist <= self.config.max_distance {
                    candidates.push((dist, *track_id, det_idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut matched_tracks = Vec::new();
        let mut used_detections = vec![false; detections.len()];
        for (_, track_id, det_idx) in candidates {
            if used_detections[det_idx] || matched_tracks.contains(&track_id) {
                continue;
            }
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.observe(
                    detections[det_idx].bbox,
                    anchors[det_idx],
                    now,
                    self.config.history_len,
                );
                used_detections[det_idx] = true;
                matched_tracks.push(track_id);
            }
        }

        let mut retired_ids = Vec::new();
        for (track_id, track) in self.tracks.iter_mut() {
            if matched_tracks.contains(track_id) {
                continue;
            }
            track.missed += 1;
            let silent_for = now.seconds_since(track.last_seen);
            if track.missed > self.config.max_missed_frames
                || silent_for > self.config.disappear_after.as_secs_f64()
            {
                retired_ids.push(*track_id);
            }
        }
        let retired = retired_ids
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id))
            .collect();

        for (det_idx, used) in used_detections.iter().enumerate() {
            if !used {
                self.spawn(detections[det_idx].bbox, anchors[det_idx], now);
            }
        }

        retired
    }

    fn spawn(&mut self, bbox: BoundingBox, centroid: Point, now: Timestamp) {
        let id = self.next_id;
        self.next_id += 1;
        let mut track = Track {
            id,
            centroid,
            bbox,
            history: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            missed: 0,
        };
        track.history.push_back(centroid);
        self.tracks.insert(id, track);
    }

    /// All live tracks in id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Tracks matched or created by the most recent update.
    pub fn visible_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values().filter(|t| t.missed == 0)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Removes and returns every track, for orderly shutdown.
    pub fn drain(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.tracks).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_at(x: f64, y: f64) -> Detection {
        // Center anchor lands exactly on (x, y).
        Detection::new(BoundingBox::new(x - 10.0, y - 20.0, x + 10.0, y + 20.0), 0.9)
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig {
            max_distance: 50.0,
            max_missed_frames: 2,
            disappear_after: Duration::from_secs(10),
            history_len: 4,
            anchor: AnchorPoint::Center,
        })
    }

    fn ids(tracker: &Tracker) -> Vec<u64> {
        tracker.tracks().map(Track::id).collect()
    }

    #[test]
    fn identities_follow_nearest_detection() {
        let mut t = tracker();
        t.update(&[person_at(100.0, 100.0), person_at(300.0, 100.0)], Timestamp::from_secs(0));
        assert_eq!(ids(&t), vec![1, 2]);

        // Detection order swapped and both moved a little.
        t.update(&[person_at(310.0, 105.0), person_at(105.0, 95.0)], Timestamp::from_secs(1));
        assert_eq!(ids(&t), vec![1, 2]);
        let tracks: Vec<&Track> = t.tracks().collect();
        assert_eq!(tracks[0].centroid(), Point::new(105.0, 95.0));
        assert_eq!(tracks[1].centroid(), Point::new(310.0, 105.0));
    }

    #[test]
    fn greedy_assignment_prefers_closest_pair() {
        let mut t = tracker();
        t.update(&[person_at(100.0, 100.0)], Timestamp::from_secs(0));
        t.update(&[person_at(130.0, 100.0), person_at(110.0, 100.0)], Timestamp::from_secs(1));
        let track = t.tracks().next().expect("track 1");
        assert_eq!(track.id(), 1);
        assert_eq!(track.centroid(), Point::new(110.0, 100.0));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn far_detection_spawns_new_identity() {
        let mut t = tracker();
        t.update(&[person_at(100.0, 100.0)], Timestamp::from_secs(0));
        t.update(&[person_at(400.0, 100.0)], Timestamp::from_secs(1));
        assert_eq!(ids(&t), vec![1, 2]);
        assert_eq!(t.tracks().next().map(Track::missed), Some(1));
    }

    #[test]
    fn retires_after_missed_frames_and_never_reuses_ids() {
        let mut t = tracker();
        t.update(&[person_at(100.0, 100.0)], Timestamp::from_secs(0));
        assert!(t.update(&[], Timestamp::from_secs(1)).is_empty());
        assert!(t.update(&[], Timestamp::from_secs(2)).is_empty());
        let retired = t.update(&[], Timestamp::from_secs(3));
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].id(), 1);
        assert!(t.is_empty());

        t.update(&[person_at(100.0, 100.0)], Timestamp::from_secs(4));
        assert_eq!(ids(&t), vec![2]);
    }

    #[test]
    fn retires_after_disappear_timeout() {
        let mut t = Tracker::new(TrackerConfig {
            max_missed_frames: 1000,
            disappear_after: Duration::from_secs(10),
            anchor: AnchorPoint::Center,
            ..TrackerConfig::default()
        });
        t.update(&[person_at(100.0, 100.0)], Timestamp::from_secs(0));
        assert!(t.update(&[], Timestamp::from_secs(10)).is_empty());
        let retired = t.update(&[], Timestamp::from_secs(11));
        assert_eq!(retired.len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut t = tracker();
        for i in 0..10 {
            t.update(&[person_at(100.0 + i as f64, 100.0)], Timestamp::from_secs(i));
        }
        let track = t.tracks().next().expect("track");
        let history: Vec<Point> = track.history().copied().collect();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last(), Some(&track.centroid()));
    }
}
