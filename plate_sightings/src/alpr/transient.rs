use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use opencv::core::Vector;
use opencv::imgcodecs::{imread, imwrite, IMREAD_COLOR};
use opencv::prelude::{Mat, MatTraitConst};
use serde::{Deserialize, Serialize};

use super::registry::{PlateDetectionEvent, TrackedVehicle, VehicleKey};
use crate::error::{Error, Result};
use crate::types::{BoundingBox, FrameNumber};

const FRAMES_DIR: &str = "frames";
const EVENTS_LOG: &str = "plates.jsonl";
const SESSION_META: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackLog {
    Vehicle,
    Plate,
}

impl TrackLog {
    fn file_name(&self) -> &'static str {
        match self {
            TrackLog::Vehicle => "vehicle_track.jsonl",
            TrackLog::Plate => "plate_track.jsonl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxEntry {
    pub frame: FrameNumber,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

/// What a later recovery needs to render clips the way the session would have.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub write_fps: f64,
}

/// Per-vehicle scratch space for one processing session: raw frames of
/// target vehicles and append-only checkpoints of their history.
#[derive(Debug, Clone)]
pub struct TransientStore {
    root: PathBuf,
    checkpoint: bool,
}

impl TransientStore {
    pub fn new(root: impl Into<PathBuf>, checkpoint: bool) -> Self {
        Self {
            root: root.into(),
            checkpoint,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_meta(&self, meta: &SessionMeta) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(SESSION_META), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    pub fn read_meta(&self) -> Result<Option<SessionMeta>> {
        let path = self.root.join(SESSION_META);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }

    /// Vehicles with a directory in this session, ordered by key.
    pub fn vehicle_keys(&self) -> Result<Vec<VehicleKey>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys: Vec<VehicleKey> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| VehicleKey::parse(entry.file_name().to_str()?))
            .collect();
        keys.sort_unstable_by_key(|key| (key.serial, key.track_id));
        Ok(keys)
    }

    /// Rebuilds a target from its checkpoint logs. Stored frames stay on disk
    /// and are read again by the finalizer.
    pub fn restore(&self, key: VehicleKey) -> Result<TrackedVehicle> {
        let boxes = self
            .load_boxes(key, TrackLog::Vehicle)?
            .into_iter()
            .map(|entry| (entry.frame, entry.bbox))
            .collect();
        let plate_boxes = self
            .load_boxes(key, TrackLog::Plate)?
            .into_iter()
            .map(|entry| (entry.frame, entry.bbox))
            .collect();
        Ok(TrackedVehicle::restore(
            key,
            boxes,
            plate_boxes,
            self.load_events(key)?,
        ))
    }

    /// Removes the session directory once no vehicle directory is left in it.
    pub fn remove_if_idle(&self) -> Result<()> {
        if self.root.exists() && self.vehicle_keys()?.is_empty() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    pub fn vehicle_dir(&self, key: VehicleKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    fn frame_path(&self, key: VehicleKey, frame: FrameNumber) -> PathBuf {
        self.vehicle_dir(key)
            .join(FRAMES_DIR)
            .join(format!("{frame}.jpg"))
    }

    /// Writes the raw frame once; later calls for the same frame are no-ops.
    pub fn save_frame(&self, key: VehicleKey, frame: FrameNumber, image: &Mat) -> Result<()> {
        let path = self.frame_path(key, frame);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !imwrite(&path.to_string_lossy(), image, &Vector::new())? {
            return Err(Error::Io(std::io::Error::other(format!(
                "cannot encode {}",
                path.display()
            ))));
        }
        Ok(())
    }

    /// Frame numbers with a stored image, ascending.
    pub fn stored_frames(&self, key: VehicleKey) -> Result<Vec<FrameNumber>> {
        let dir = self.vehicle_dir(key).join(FRAMES_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut frames: Vec<FrameNumber> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
                    return None;
                }
                path.file_stem()?.to_str()?.parse().ok()
            })
            .collect();
        frames.sort_unstable();
        Ok(frames)
    }

    /// `None` when the stored image cannot be decoded.
    pub fn load_frame(&self, key: VehicleKey, frame: FrameNumber) -> Result<Option<Mat>> {
        let path = self.frame_path(key, frame);
        let image = imread(&path.to_string_lossy(), IMREAD_COLOR)?;
        if image.empty() {
            return Ok(None);
        }
        Ok(Some(image))
    }

    pub fn checkpoint_event(&self, key: VehicleKey, event: &PlateDetectionEvent) -> Result<()> {
        if !self.checkpoint {
            return Ok(());
        }
        self.append_line(key, EVENTS_LOG, event)
    }

    pub fn checkpoint_box(
        &self,
        key: VehicleKey,
        log: TrackLog,
        frame: FrameNumber,
        bbox: BoundingBox,
    ) -> Result<()> {
        if !self.checkpoint {
            return Ok(());
        }
        self.append_line(key, log.file_name(), &BoxEntry { frame, bbox })
    }

    fn append_line<T: Serialize>(&self, key: VehicleKey, file: &str, value: &T) -> Result<()> {
        let dir = self.vehicle_dir(key);
        fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))?;
        out.write_all(&line)?;
        Ok(())
    }

    /// Reads back a checkpointed event log. Missing log reads as empty.
    pub fn load_events(&self, key: VehicleKey) -> Result<Vec<PlateDetectionEvent>> {
        self.read_lines(key, EVENTS_LOG)
    }

    pub fn load_boxes(&self, key: VehicleKey, log: TrackLog) -> Result<Vec<BoxEntry>> {
        self.read_lines(key, log.file_name())
    }

    fn read_lines<T: for<'de> Deserialize<'de>>(&self, key: VehicleKey, file: &str) -> Result<Vec<T>> {
        let path = self.vehicle_dir(key).join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut values = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            values.push(serde_json::from_str(&line)?);
        }
        Ok(values)
    }

    pub fn purge(&self, key: VehicleKey) -> Result<()> {
        let dir = self.vehicle_dir(key);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Vehicle directories still present, e.g. preserved by failed finalizes.
    pub fn leftover_dirs(parent: &Path) -> Vec<PathBuf> {
        let Ok(sessions) = fs::read_dir(parent) else {
            return Vec::new();
        };
        sessions
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .flat_map(|session| fs::read_dir(session.path()).into_iter().flatten())
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};
    use tempfile::tempdir;

    fn key() -> VehicleKey {
        VehicleKey {
            track_id: 4,
            serial: 1,
        }
    }

    #[test]
    fn checkpoints_append_and_read_back() {
        let tmp = tempdir().unwrap();
        let store = TransientStore::new(tmp.path(), true);
        for frame in [3, 4] {
            store
                .checkpoint_event(
                    key(),
                    &PlateDetectionEvent {
                        text: "AB123".to_string(),
                        confidence: 70,
                        frame,
                    },
                )
                .unwrap();
            store
                .checkpoint_box(key(), TrackLog::Plate, frame, BoundingBox::new(1, 2, 3, 4))
                .unwrap();
        }
        let events = store.load_events(key()).unwrap();
        assert_eq!(events.iter().map(|e| e.frame).collect::<Vec<_>>(), vec![3, 4]);
        let boxes = store.load_boxes(key(), TrackLog::Plate).unwrap();
        assert_eq!(boxes[1].bbox, BoundingBox::new(1, 2, 3, 4));
        assert!(store.load_boxes(key(), TrackLog::Vehicle).unwrap().is_empty());
    }

    #[test]
    fn restore_reads_every_checkpoint_log() {
        let tmp = tempdir().unwrap();
        let store = TransientStore::new(tmp.path().join("session"), true);
        store.write_meta(&SessionMeta { write_fps: 12.5 }).unwrap();
        for frame in [5, 6] {
            store
                .checkpoint_box(key(), TrackLog::Vehicle, frame, BoundingBox::new(0, 0, 90, 60))
                .unwrap();
        }
        store
            .checkpoint_box(key(), TrackLog::Plate, 6, BoundingBox::new(10, 40, 50, 55))
            .unwrap();
        store
            .checkpoint_event(
                key(),
                &PlateDetectionEvent {
                    text: "KL0099".to_string(),
                    confidence: 64,
                    frame: 6,
                },
            )
            .unwrap();

        assert_eq!(store.vehicle_keys().unwrap(), vec![key()]);
        assert_eq!(store.read_meta().unwrap(), Some(SessionMeta { write_fps: 12.5 }));
        let vehicle = store.restore(key()).unwrap();
        assert!(vehicle.is_target());
        assert_eq!(vehicle.boxes().keys().copied().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(vehicle.plate_boxes().get(&6), Some(&BoundingBox::new(10, 40, 50, 55)));
        assert_eq!(vehicle.events()[0].text, "KL0099");

        store.remove_if_idle().unwrap();
        assert!(store.root().exists());
        store.purge(key()).unwrap();
        store.remove_if_idle().unwrap();
        assert!(!store.root().exists());
    }

    #[test]
    fn checkpointing_can_be_disabled() {
        let tmp = tempdir().unwrap();
        let store = TransientStore::new(tmp.path(), false);
        store
            .checkpoint_box(key(), TrackLog::Vehicle, 1, BoundingBox::new(0, 0, 1, 1))
            .unwrap();
        assert!(!store.vehicle_dir(key()).exists());
    }

    #[test]
    fn frames_are_listed_in_frame_order_and_purged() {
        let tmp = tempdir().unwrap();
        let store = TransientStore::new(tmp.path(), true);
        let image =
            Mat::new_rows_cols_with_default(24, 32, CV_8UC3, Scalar::all(90.0)).unwrap();
        for frame in [12, 9, 100] {
            store.save_frame(key(), frame, &image).unwrap();
        }
        assert_eq!(store.stored_frames(key()).unwrap(), vec![9, 12, 100]);
        let loaded = store.load_frame(key(), 12).unwrap().unwrap();
        assert_eq!(loaded.cols(), 32);

        store.purge(key()).unwrap();
        assert!(store.stored_frames(key()).unwrap().is_empty());
    }
}
