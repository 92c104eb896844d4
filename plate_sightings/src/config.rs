use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::alpr::aggregator::QualityGate;
use crate::error::Result;

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceConfig {
    Camera(i32),
    File(PathBuf),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Camera(0)
    }
}

impl std::str::FromStr for SourceConfig {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<i32>() {
            Ok(index) => SourceConfig::Camera(index),
            Err(_) => SourceConfig::File(PathBuf::from(s)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub fourcc: String,
    pub extension: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fourcc: "mp4v".to_string(),
            extension: "mp4".to_string(),
        }
    }
}

impl VideoConfig {
    /// OpenCV's built-in MJPEG writer, available without external codecs.
    pub fn mjpeg() -> Self {
        Self {
            fourcc: "MJPG".to_string(),
            extension: "avi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vehicle_cfg: PathBuf,
    pub vehicle_weights: PathBuf,
    pub plate_onnx: PathBuf,
    pub tessdata: PathBuf,
    pub language: String,
    pub use_gpu: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vehicle_cfg: PathBuf::from("models/yolov3.cfg"),
            vehicle_weights: PathBuf::from("models/yolov3.weights"),
            plate_onnx: PathBuf::from("models/plate_best.onnx"),
            tessdata: PathBuf::from("models"),
            language: "licence".to_string(),
            use_gpu: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub max_missed_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_missed_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub host: String,
    pub port: u16,
    pub fps: usize,
    pub width: i32,
    pub height: i32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            fps: 20,
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilingConfig {
    pub url: String,
    #[serde(default = "default_application")]
    pub application: String,
}

fn default_application() -> String {
    "plate_sightings".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub frame_skip: u32,
    pub fallback_fps: f64,
    pub realtime: bool,
    pub output_dir: PathBuf,
    pub gate: QualityGate,
    pub finalize_on_stream_end: bool,
    pub checkpoint_logs: bool,
    pub video: VideoConfig,
    pub models: ModelConfig,
    pub tracker: TrackerConfig,
    pub preview: Option<PreviewConfig>,
    pub profiling: Option<ProfilingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            frame_skip: 0,
            fallback_fps: 30.0,
            realtime: false,
            output_dir: PathBuf::from("logs"),
            gate: QualityGate::default(),
            finalize_on_stream_end: true,
            checkpoint_logs: true,
            video: VideoConfig::default(),
            models: ModelConfig::default(),
            tracker: TrackerConfig::default(),
            preview: None,
            profiling: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}
