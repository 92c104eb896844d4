use std::time::{Duration, Instant};

use opencv::prelude::{Mat, MatTraitConst, VideoCaptureTrait, VideoCaptureTraitConst};
use opencv::videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS};
use tracing::{info, warn};

use super::FrameSource;
use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::types::FrameNumber;

/// Paces a loop to a target rate.
pub struct FpsLimiter {
    fps_control: Instant,
    fps_wait: Duration,
}

impl FpsLimiter {
    pub fn new(fps: f64) -> Self {
        Self {
            fps_control: Instant::now(),
            fps_wait: Duration::from_secs_f64(1.0 / fps.max(1.0)),
        }
    }

    pub fn wait(&mut self) {
        let elapsed = self.fps_control.elapsed();
        if self.fps_wait > elapsed {
            spin_sleep::sleep(self.fps_wait - elapsed);
        }
        self.fps_control = Instant::now();
    }
}

/// Rate of rendered clips: every `frame_skip`-th source frame is kept.
pub fn write_fps(source_fps: f64, frame_skip: u32) -> f64 {
    if frame_skip == 0 {
        source_fps
    } else {
        source_fps / frame_skip as f64
    }
}

/// Frames from a video file or a camera. Frame numbers count every source
/// frame, including the skipped ones, starting at 1.
pub struct VideoSource {
    capture: VideoCapture,
    frame_skip: u32,
    frame_number: FrameNumber,
    write_fps: f64,
    limiter: Option<FpsLimiter>,
}

impl VideoSource {
    pub fn open(
        source: &SourceConfig,
        frame_skip: u32,
        fallback_fps: f64,
        realtime: bool,
    ) -> Result<Self> {
        let capture = match source {
            SourceConfig::Camera(index) => VideoCapture::new(*index, CAP_ANY)?,
            SourceConfig::File(path) => VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY)?,
        };
        if !capture.is_opened()? {
            return Err(Error::StreamInterrupted(format!("cannot open {source:?}")));
        }

        let reported = capture.get(CAP_PROP_FPS)?;
        let source_fps = if reported > 0.0 {
            reported
        } else {
            warn!("{:?} reports no frame rate, using {}", source, fallback_fps);
            fallback_fps
        };
        let write_fps = write_fps(source_fps, frame_skip);
        info!(
            "opened {:?} at {:.2} fps, keeping every {} frame(s), clips at {:.2} fps",
            source,
            source_fps,
            frame_skip.max(1),
            write_fps
        );

        Ok(Self {
            capture,
            frame_skip,
            frame_number: 0,
            write_fps,
            limiter: realtime.then(|| FpsLimiter::new(source_fps)),
        })
    }

    fn read(&mut self) -> Result<Option<(FrameNumber, Mat)>> {
        if self.frame_number > 0 {
            for _ in 1..self.frame_skip {
                if !self.capture.grab()? {
                    return Ok(None);
                }
                self.frame_number += 1;
            }
        }

        let mut image = Mat::default();
        if !self.capture.read(&mut image)? || image.empty() {
            return Ok(None);
        }
        self.frame_number += 1;
        Ok(Some((self.frame_number, image)))
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<Option<(FrameNumber, Mat)>> {
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.wait();
        }
        self.read().map_err(|e| match e {
            Error::OpenCv(e) => Error::StreamInterrupted(e.to_string()),
            other => other,
        })
    }

    fn write_fps(&self) -> f64 {
        self.write_fps
    }
}
