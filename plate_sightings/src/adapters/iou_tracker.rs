use opencv::prelude::Mat;
use tracing::debug;

use super::object_detector::BoxDetector;
use super::VehicleTracker;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::types::{BoundingBox, TrackId, VehicleDetection};

#[derive(Debug, Clone, Copy)]
struct Track {
    id: TrackId,
    bbox: BoundingBox,
    missed: u32,
}

/// Assigns ids to detector boxes by greedy IoU matching against the boxes of
/// the previous frames. Ids are never reused.
pub struct IouTracker<D> {
    detector: D,
    tracks: Vec<Track>,
    next_id: TrackId,
    iou_threshold: f32,
    max_missed_frames: u32,
}

impl<D: BoxDetector> IouTracker<D> {
    pub fn new(detector: D, config: &TrackerConfig) -> Self {
        Self {
            detector,
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold: config.iou_threshold,
            max_missed_frames: config.max_missed_frames,
        }
    }

    fn update(&mut self, boxes: Vec<BoundingBox>) -> Vec<VehicleDetection> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (b, bbox) in boxes.iter().enumerate() {
                let iou = track.bbox.intersection_over_union(bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, t, b));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut box_owner: Vec<Option<TrackId>> = vec![None; boxes.len()];
        for (_, t, b) in pairs {
            if track_matched[t] || box_owner[b].is_some() {
                continue;
            }
            track_matched[t] = true;
            box_owner[b] = Some(self.tracks[t].id);
            self.tracks[t].bbox = boxes[b];
            self.tracks[t].missed = 0;
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed_frames;
        self.tracks.retain(|track| {
            let keep = track.missed <= max_missed;
            if !keep {
                debug!("track {} retired", track.id);
            }
            keep
        });

        boxes
            .into_iter()
            .zip(box_owner)
            .map(|(bbox, owner)| {
                let id = owner.unwrap_or_else(|| {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        bbox,
                        missed: 0,
                    });
                    id
                });
                VehicleDetection {
                    track_id: Some(id),
                    bbox,
                }
            })
            .collect()
    }
}

impl<D: BoxDetector> VehicleTracker for IouTracker<D> {
    fn track(&mut self, frame: &Mat) -> Result<Vec<VehicleDetection>> {
        let boxes = self.detector.detect_boxes(frame)?;
        Ok(self.update(boxes))
    }
}
