//! Detection capabilities the pipeline depends on, and the OpenCV /
//! Tesseract / GStreamer implementations used by the binary.

pub mod iou_tracker;
pub mod object_detector;
pub mod rtp_sink;
pub mod tesseract_ocr;
pub mod video_source;

use opencv::prelude::Mat;

use crate::alpr::session::FrameReport;
use crate::error::Result;
use crate::types::{BoundingBox, FrameNumber, TextCandidate, VehicleDetection};

/// Vehicle boxes plus tracker ids for a full frame.
pub trait VehicleTracker {
    fn track(&mut self, frame: &Mat) -> Result<Vec<VehicleDetection>>;
}

/// Plate regions inside a vehicle crop, in crop coordinates.
pub trait PlateDetector {
    fn detect(&mut self, vehicle_crop: &Mat) -> Result<Vec<BoundingBox>>;
}

/// Text in a grayscale plate crop.
pub trait CharacterRecognizer {
    fn recognize(&mut self, plate: &Mat) -> Result<Vec<TextCandidate>>;
}

/// Frames of one stream session. `Ok(None)` is a clean end of stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<(FrameNumber, Mat)>>;

    /// Frame rate used for rendered clips.
    fn write_fps(&self) -> f64;
}

/// Consumer of annotated frames and their status.
pub trait FrameSink {
    fn publish(&mut self, frame: &Mat, report: &FrameReport) -> Result<()>;
}

/// The three detection capabilities a session runs per frame.
pub struct DetectionAdapter {
    pub tracker: Box<dyn VehicleTracker>,
    pub plates: Box<dyn PlateDetector>,
    pub recognizer: Box<dyn CharacterRecognizer>,
}

impl DetectionAdapter {
    pub fn new(
        tracker: Box<dyn VehicleTracker>,
        plates: Box<dyn PlateDetector>,
        recognizer: Box<dyn CharacterRecognizer>,
    ) -> Self {
        Self {
            tracker,
            plates,
            recognizer,
        }
    }
}
