//! Durable plate -> sightings index, stored as a single JSON file that is
//! replaced atomically on every write.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const INDEX_FILE: &str = "all_plates.json";

/// More sightings than this flag a plate as high risk.
pub const HIGH_RISK_SIGHTINGS: usize = 5;

/// One finalized vehicle. Artifact paths are relative to the output root and
/// absent when the artifact could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentRecord {
    pub record_id: Uuid,
    pub plate: String,
    pub date: String,
    pub time: String,
    pub captured_at: DateTime<Local>,
    pub video_path: Option<String>,
    pub vehicle_still_path: Option<String>,
    pub plate_still_path: Option<String>,
}

impl PermanentRecord {
    pub fn new(record_id: Uuid, plate: String, captured_at: DateTime<Local>) -> Self {
        Self {
            record_id,
            plate,
            date: captured_at.format("%m/%d/%Y").to_string(),
            time: captured_at.format("%H:%M").to_string(),
            captured_at,
            video_path: None,
            vehicle_still_path: None,
            plate_still_path: None,
        }
    }

    pub fn has_artifacts(&self) -> bool {
        self.video_path.is_some()
            || self.vehicle_still_path.is_some()
            || self.plate_still_path.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Risk {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlateSummary {
    pub plate: String,
    pub sightings: usize,
    pub first_seen: DateTime<Local>,
    pub last_seen: DateTime<Local>,
    pub risk: Risk,
}

type Entries = BTreeMap<String, Vec<PermanentRecord>>;

#[derive(Debug, Clone)]
pub struct PlateIndex {
    path: PathBuf,
}

impl PlateIndex {
    /// Opens the index at `path`, writing an empty one if none exists. An
    /// existing file that does not parse is reported, never overwritten.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let index = Self { path: path.into() };
        if let Some(parent) = index.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if index.path.exists() {
            index.load()?;
        } else {
            index.store(&Entries::new())?;
        }
        Ok(index)
    }

    /// Index file under `<output>/perm/`.
    pub fn in_output_dir(output_dir: &Path) -> Result<Self> {
        Self::open(output_dir.join("perm").join(INDEX_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Entries> {
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(|source| Error::CorruptIndex {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, entries: &Entries) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, entries)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    /// Adds `record` to the list of its plate, creating the list on the
    /// plate's first sighting.
    pub fn append(&self, record: &PermanentRecord) -> Result<()> {
        let mut entries = self.load()?;
        entries
            .entry(record.plate.clone())
            .or_default()
            .push(record.clone());
        self.store(&entries)?;
        info!("indexed {} under plate {:?}", record.record_id, record.plate);
        Ok(())
    }

    /// Every plate with its sightings in chronological order, plates ordered
    /// by first sighting.
    pub fn read_all(&self) -> Result<Vec<(String, Vec<PermanentRecord>)>> {
        let mut plates: Vec<(String, Vec<PermanentRecord>)> = self
            .load()?
            .into_iter()
            .filter(|(_, records)| !records.is_empty())
            .collect();
        plates.sort_by(|(a_plate, a), (b_plate, b)| {
            a[0].captured_at
                .cmp(&b[0].captured_at)
                .then_with(|| a_plate.cmp(b_plate))
        });
        Ok(plates)
    }

    /// Sightings of `plate`, newest first. Unknown plates have none.
    pub fn read(&self, plate: &str) -> Result<Vec<PermanentRecord>> {
        let mut records = self.load()?.remove(plate).unwrap_or_default();
        records.reverse();
        Ok(records)
    }

    /// Overview rows, one per plate, in first-seen order.
    pub fn summaries(&self) -> Result<Vec<PlateSummary>> {
        Ok(self
            .read_all()?
            .into_iter()
            .map(|(plate, records)| {
                let sightings = records.len();
                PlateSummary {
                    plate,
                    sightings,
                    first_seen: records[0].captured_at,
                    last_seen: records[sightings - 1].captured_at,
                    risk: if sightings > HIGH_RISK_SIGHTINGS {
                        Risk::High
                    } else {
                        Risk::Low
                    },
                }
            })
            .collect())
    }
}
