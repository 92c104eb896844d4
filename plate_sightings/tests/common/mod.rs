#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use opencv::core::{Scalar, CV_8UC3};
use opencv::prelude::{Mat, MatTraitConst};
use tempfile::TempDir;

use plate_sightings::adapters::{
    CharacterRecognizer, DetectionAdapter, PlateDetector, VehicleTracker,
};
use plate_sightings::alpr::session::{FrameReport, ProcessingSession};
use plate_sightings::config::{Config, VideoConfig};
use plate_sightings::types::{BoundingBox, FrameNumber, TextCandidate, TrackId, VehicleDetection};
use plate_sightings::Result;

/// What the fake adapters see for the next frame.
#[derive(Default)]
pub struct Scene {
    pub vehicles: Vec<(TrackId, BoundingBox)>,
    pub reading: Option<(String, u8)>,
}

type SharedScene = Rc<RefCell<Scene>>;

struct SceneTracker(SharedScene);

impl VehicleTracker for SceneTracker {
    fn track(&mut self, _frame: &Mat) -> Result<Vec<VehicleDetection>> {
        Ok(self
            .0
            .borrow()
            .vehicles
            .iter()
            .map(|(id, bbox)| VehicleDetection {
                track_id: Some(*id),
                bbox: *bbox,
            })
            .collect())
    }
}

/// One plate near the bottom of every vehicle crop.
struct FixedPlate;

impl PlateDetector for FixedPlate {
    fn detect(&mut self, vehicle_crop: &Mat) -> Result<Vec<BoundingBox>> {
        let (cols, rows) = (vehicle_crop.cols(), vehicle_crop.rows());
        Ok(vec![BoundingBox::new(
            cols / 4,
            rows * 3 / 5,
            cols * 3 / 4,
            rows * 4 / 5,
        )])
    }
}

struct SceneOcr(SharedScene);

impl CharacterRecognizer for SceneOcr {
    fn recognize(&mut self, plate: &Mat) -> Result<Vec<TextCandidate>> {
        assert_eq!(plate.channels(), 1, "recognizer expects grayscale crops");
        Ok(self
            .0
            .borrow()
            .reading
            .iter()
            .map(|(text, confidence)| TextCandidate {
                text: text.clone(),
                confidence: *confidence,
                region: BoundingBox::new(0, 0, plate.cols(), plate.rows()),
            })
            .collect())
    }
}

pub fn car() -> BoundingBox {
    BoundingBox::new(100, 100, 400, 350)
}

pub fn blank_frame() -> Mat {
    Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(80.0)).unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub session: ProcessingSession,
    scene: SharedScene,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            output_dir: dir.path().join("out"),
            video: VideoConfig::mjpeg(),
            ..Config::default()
        };
        customize(&mut config);

        let scene = SharedScene::default();
        let adapter = DetectionAdapter::new(
            Box::new(SceneTracker(scene.clone())),
            Box::new(FixedPlate),
            Box::new(SceneOcr(scene.clone())),
        );
        let session = ProcessingSession::new(adapter, &config, 10.0).unwrap();
        Self {
            dir,
            config,
            session,
            scene,
        }
    }

    pub fn frame(
        &mut self,
        frame_number: FrameNumber,
        vehicles: &[(TrackId, BoundingBox)],
        reading: Option<(&str, u8)>,
    ) -> FrameReport {
        self.frame_with(frame_number, blank_frame(), vehicles, reading)
    }

    pub fn frame_with(
        &mut self,
        frame_number: FrameNumber,
        mut image: Mat,
        vehicles: &[(TrackId, BoundingBox)],
        reading: Option<(&str, u8)>,
    ) -> FrameReport {
        {
            let mut scene = self.scene.borrow_mut();
            scene.vehicles = vehicles.to_vec();
            scene.reading = reading.map(|(text, confidence)| (text.to_string(), confidence));
        }
        self.session.process_frame(frame_number, &mut image).unwrap()
    }

    pub fn output(&self) -> PathBuf {
        self.config.output_dir.clone()
    }

    /// Vehicle directories currently in this session's transient storage.
    pub fn transient_dirs(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.session.transient_root()) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn record_dirs(&self) -> Vec<PathBuf> {
        record_dirs(&self.output())
    }
}

/// Directories under `<output>/perm`, one per committed record.
pub fn record_dirs(output: &Path) -> Vec<PathBuf> {
    match fs::read_dir(output.join("perm")) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}
