mod common;

use tempfile::TempDir;

use common::{blank_frame, car, record_dirs};
use plate_sightings::alpr::finalize::{FinalizeReport, Finalizer};
use plate_sightings::alpr::index::PlateIndex;
use plate_sightings::alpr::registry::{Eviction, PlateDetectionEvent, VehicleKey, VehicleRegistry};
use plate_sightings::alpr::transient::TransientStore;
use plate_sightings::config::VideoConfig;
use plate_sightings::metrics;
use plate_sightings::types::{BoundingBox, FrameNumber, TrackId};
use plate_sightings::{Error, Result};

const TRACK: TrackId = 3;

/// A finalizer wired to a scratch output directory, fed by hand.
struct Bench {
    dir: TempDir,
    store: TransientStore,
    index: PlateIndex,
    registry: VehicleRegistry,
    finalizer: Finalizer,
}

impl Bench {
    fn new(video: VideoConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = TransientStore::new(dir.path().join("tmp").join("session"), true);
        let index = PlateIndex::in_output_dir(dir.path()).unwrap();
        let finalizer = Finalizer::new(dir.path(), video, 10.0, store.clone(), index.clone());
        Self {
            dir,
            store,
            index,
            registry: VehicleRegistry::new(),
            finalizer,
        }
    }

    /// Shows the vehicle on frames `1..=frames` with a stored image and a
    /// plate box each, logging `read` on every frame when given.
    fn seed(&mut self, frames: FrameNumber, read: Option<&str>) -> VehicleKey {
        let plate = BoundingBox::new(75, 150, 225, 200);
        let mut key = None;
        for frame in 1..=frames {
            let vehicle = self.registry.observe(TRACK, frame, car()).unwrap();
            vehicle.record_plate_box(frame, plate).unwrap();
            if let Some(text) = read {
                vehicle
                    .log_event(PlateDetectionEvent {
                        text: text.to_string(),
                        confidence: 90,
                        frame,
                    })
                    .unwrap();
            }
            self.store
                .save_frame(vehicle.key(), frame, &blank_frame())
                .unwrap();
            key = Some(vehicle.key());
        }
        key.unwrap()
    }

    fn evict(&mut self) -> Result<FinalizeReport> {
        let finalizer = &self.finalizer;
        match self.registry.evict(TRACK, |vehicle| finalizer.finalize(vehicle)) {
            Some(Eviction::Finalized(_, outcome)) => outcome,
            other => panic!("target was not finalized: {other:?}"),
        }
    }
}

#[test]
fn target_without_reads_is_aborted_and_purged() {
    let mut bench = Bench::new(VideoConfig::mjpeg());
    let key = bench.seed(2, None);
    assert!(bench.registry.promote(TRACK).unwrap());
    assert!(bench.store.vehicle_dir(key).exists());

    let outcome = bench.evict();
    assert!(matches!(outcome, Err(Error::EmptyDetectionSet(k)) if k == key));
    assert!(!bench.store.vehicle_dir(key).exists());
    assert!(bench.index.read_all().unwrap().is_empty());
    assert!(record_dirs(bench.dir.path()).is_empty());
    assert!(bench.registry.is_empty());
}

#[test]
fn unusable_codec_keeps_evidence_and_leaves_no_record() {
    let video = VideoConfig {
        fourcc: "MJ".to_string(),
        ..VideoConfig::mjpeg()
    };
    let mut bench = Bench::new(video);
    let key = bench.seed(2, Some("ABC123"));
    let io_failures = metrics::FINALIZE_FAILURES.with_label_values(&["io"]);
    let before = io_failures.get();

    let outcome = bench.evict();
    assert!(matches!(outcome, Err(Error::Io(_))), "{outcome:?}");
    assert!(io_failures.get() > before);

    let vehicle_dir = bench.store.vehicle_dir(key);
    assert!(vehicle_dir.join("frames").join("1.jpg").is_file());
    assert!(record_dirs(bench.dir.path()).is_empty());
    assert!(bench.index.read_all().unwrap().is_empty());
}

#[test]
fn stored_frame_without_vehicle_box_is_reported_as_degraded() {
    let mut bench = Bench::new(VideoConfig::mjpeg());
    let key = bench.seed(2, Some("ABC123"));
    bench.store.save_frame(key, 3, &blank_frame()).unwrap();

    let report = bench.evict().unwrap();
    assert_eq!(report.frames_written, 3);
    assert_eq!(report.consensus.text, "ABC123");
    assert_eq!(report.degraded.len(), 1);
    assert!(matches!(
        report.degraded[0],
        Error::MissingTrackData {
            vehicle,
            frame: 3,
            track: "vehicle",
        } if vehicle == key
    ));

    let video = report.record.video_path.as_ref().unwrap();
    assert!(bench.dir.path().join(video).is_file());
    assert_eq!(record_dirs(bench.dir.path()).len(), 1);
    assert_eq!(bench.index.read("ABC123").unwrap(), vec![report.record.clone()]);
    assert!(!bench.store.vehicle_dir(key).exists());
}
