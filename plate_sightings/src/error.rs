use std::path::PathBuf;

use thiserror::Error;

use crate::alpr::registry::VehicleKey;
use crate::types::{FrameNumber, TrackId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing {track} box for {vehicle} at frame {frame}")]
    MissingTrackData {
        vehicle: VehicleKey,
        frame: FrameNumber,
        track: &'static str,
    },
    #[error("no qualifying plate reads recorded for {0}")]
    EmptyDetectionSet(VehicleKey),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plate index {path} is unreadable: {source}")]
    CorruptIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("atomic replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("detector error: {0}")]
    Detector(String),
    #[error("ocr error: {0}")]
    Ocr(String),
    #[error("preview error: {0}")]
    Preview(String),
    #[error("frame {frame} for {vehicle} is not after frame {last}")]
    FrameOrder {
        vehicle: VehicleKey,
        frame: FrameNumber,
        last: FrameNumber,
    },
    #[error("vehicle {0} is not tracked")]
    UnknownVehicle(TrackId),
}

impl Error {
    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingTrackData { .. } => "missing_track_data",
            Error::EmptyDetectionSet(_) => "empty_detection_set",
            Error::Io(_) => "io",
            Error::CorruptIndex { .. } => "corrupt_index",
            Error::StreamInterrupted(_) => "stream_interrupted",
            Error::OpenCv(_) => "opencv",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Persist(_) => "persist",
            Error::Detector(_) => "detector",
            Error::Ocr(_) => "ocr",
            Error::Preview(_) => "preview",
            Error::FrameOrder { .. } => "frame_order",
            Error::UnknownVehicle(_) => "unknown_vehicle",
        }
    }

    /// Whether a finalize that failed with this error must leave the
    /// vehicle's transient directory on disk for inspection or retry.
    pub fn preserves_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::OpenCv(_)
                | Error::Json(_)
                | Error::Persist(_)
                | Error::CorruptIndex { .. }
        )
    }
}
