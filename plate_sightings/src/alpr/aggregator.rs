use opencv::imgproc::{cvt_color, COLOR_BGR2GRAY};
use opencv::prelude::{Mat, MatTraitConst};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::{PlateDetectionEvent, TrackedVehicle};
use super::transient::{TrackLog, TransientStore};
use crate::adapters::{CharacterRecognizer, PlateDetector};
use crate::error::Result;
use crate::metrics;
use crate::types::{BoundingBox, FrameNumber, TrackId};

/// Thresholds a read must meet to be logged as evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    pub min_length: usize,
    pub min_confidence: u8,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_length: 3,
            min_confidence: 50,
        }
    }
}

impl QualityGate {
    pub fn classify(&self, text: &str, confidence: u8) -> ReadTier {
        let length = text.chars().count();
        if length >= self.min_length && confidence >= self.min_confidence {
            ReadTier::Logged
        } else if length >= self.min_length {
            ReadTier::LowConfidence
        } else if length > 0 {
            ReadTier::Partial
        } else {
            ReadTier::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReadTier {
    /// Long and confident enough to be kept.
    Logged,
    /// Long enough, confidence below the gate. Display only.
    LowConfidence,
    /// Too short to be a plate. Display only.
    Partial,
    /// Nothing recognized.
    Unknown,
}

impl ReadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadTier::Logged => "logged",
            ReadTier::LowConfidence => "low_confidence",
            ReadTier::Partial => "partial",
            ReadTier::Unknown => "unknown",
        }
    }
}

/// Upper-cases and keeps only `[0-9A-Z]`.
pub fn normalize_plate_text(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        .collect()
}

/// A recognized string shown live, whatever its tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateRead {
    pub track_id: TrackId,
    pub frame: FrameNumber,
    pub text: String,
    pub confidence: u8,
    pub tier: ReadTier,
    /// Frame coordinates.
    #[serde(skip)]
    pub region: BoundingBox,
}

/// A plate region found on a vehicle this frame, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlateSighting {
    pub bbox: BoundingBox,
    pub recognized: bool,
}

#[derive(Debug, Default)]
pub struct VehicleObservation {
    pub plates: Vec<PlateSighting>,
    pub reads: Vec<PlateRead>,
    pub promoted: bool,
}

/// Feeds plate crops to the recognizer, logs qualifying reads into the
/// vehicle history and keeps per-frame evidence for target vehicles.
#[derive(Debug, Clone)]
pub struct DetectionAggregator {
    gate: QualityGate,
    store: TransientStore,
}

impl DetectionAggregator {
    pub fn new(gate: QualityGate, store: TransientStore) -> Self {
        Self { gate, store }
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn store(&self) -> &TransientStore {
        &self.store
    }

    /// Handles one visible vehicle for one frame. `frame` must be the raw,
    /// un-annotated image; `vehicle_box` the box just passed to `observe`.
    pub fn process_vehicle(
        &self,
        plates: &mut dyn PlateDetector,
        recognizer: &mut dyn CharacterRecognizer,
        vehicle: &mut TrackedVehicle,
        frame_number: FrameNumber,
        frame: &Mat,
        vehicle_box: BoundingBox,
    ) -> Result<VehicleObservation> {
        let mut observation = VehicleObservation::default();
        let Some(visible) = vehicle_box.clamp_to(frame.cols(), frame.rows()) else {
            debug!("{} box is outside the frame", vehicle.key());
            return Ok(observation);
        };

        let vehicle_crop = Mat::roi(frame, visible.to_rect())?.try_clone()?;
        let mut last_plate = None;

        for plate in plates.detect(&vehicle_crop)? {
            let Some(plate) = plate.clamp_to(vehicle_crop.cols(), vehicle_crop.rows()) else {
                continue;
            };
            let plate_in_frame = plate.offset_by(&visible);
            let gray = grayscale(&Mat::roi(&vehicle_crop, plate.to_rect())?)?;
            let candidates = recognizer.recognize(&gray)?;

            let mut recognized = false;
            for candidate in candidates {
                let text = normalize_plate_text(&candidate.text);
                let confidence = candidate.confidence.min(100);
                let tier = self.gate.classify(&text, confidence);
                metrics::PLATE_READS.with_label_values(&[tier.as_str()]).inc();
                if tier == ReadTier::Unknown {
                    continue;
                }
                recognized = true;

                if tier == ReadTier::Logged {
                    let event = PlateDetectionEvent {
                        text: text.clone(),
                        confidence,
                        frame: frame_number,
                    };
                    if let Err(e) = self.store.checkpoint_event(vehicle.key(), &event) {
                        warn!("{}: event checkpoint failed: {}", vehicle.key(), e);
                    }
                    if vehicle.log_event(event)? {
                        metrics::VEHICLES_PROMOTED.inc();
                        observation.promoted = true;
                    }
                }

                observation.reads.push(PlateRead {
                    track_id: vehicle.track_id(),
                    frame: frame_number,
                    text,
                    confidence,
                    tier,
                    region: candidate.region.offset_by(&plate_in_frame),
                });
            }

            if !recognized {
                observation.reads.push(PlateRead {
                    track_id: vehicle.track_id(),
                    frame: frame_number,
                    text: String::new(),
                    confidence: 0,
                    tier: ReadTier::Unknown,
                    region: plate_in_frame,
                });
            }
            observation.plates.push(PlateSighting {
                bbox: plate_in_frame,
                recognized,
            });
            // history is relative to the unclamped tracker box
            last_plate = Some(plate_in_frame.relative_to(&vehicle_box));
        }

        if vehicle.is_target() {
            self.snapshot(vehicle, frame_number, frame, vehicle_box, last_plate)?;
        }
        Ok(observation)
    }

    /// Keeps the evidence of a target vehicle for this frame. Storage
    /// failures only degrade the final artifacts.
    fn snapshot(
        &self,
        vehicle: &mut TrackedVehicle,
        frame_number: FrameNumber,
        frame: &Mat,
        vehicle_box: BoundingBox,
        plate_box: Option<BoundingBox>,
    ) -> Result<()> {
        let key = vehicle.key();
        if let Err(e) = self.store.save_frame(key, frame_number, frame) {
            warn!("{}: frame {} not stored: {}", key, frame_number, e);
        }
        if let Err(e) = self
            .store
            .checkpoint_box(key, TrackLog::Vehicle, frame_number, vehicle_box)
        {
            warn!("{}: vehicle box checkpoint failed: {}", key, e);
        }
        if let Some(plate_box) = plate_box {
            vehicle.record_plate_box(frame_number, plate_box)?;
            if let Err(e) = self
                .store
                .checkpoint_box(key, TrackLog::Plate, frame_number, plate_box)
            {
                warn!("{}: plate box checkpoint failed: {}", key, e);
            }
        }
        Ok(())
    }
}

fn grayscale(image: &Mat) -> Result<Mat> {
    if image.channels() == 1 {
        return Ok(image.try_clone()?);
    }
    let mut gray = Mat::default();
    cvt_color(image, &mut gray, COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}
