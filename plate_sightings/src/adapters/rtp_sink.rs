use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use gstreamer::parse_launch;
use gstreamer::prelude::{Cast, ElementExt, GstBinExt, MulDiv};
use gstreamer::{Buffer, Caps, ClockTime};
use gstreamer_video::{VideoCapsBuilder, VideoFormat};
use opencv::core::Size;
use opencv::imgproc::{resize, INTER_LINEAR};
use opencv::prelude::{Mat, MatTraitConstManual};
use tracing::{debug, info};

use super::FrameSink;
use crate::alpr::session::FrameReport;
use crate::config::PreviewConfig;
use crate::error::{Error, Result};

/// Frames waiting for the encoder before new ones are dropped.
const QUEUE_DEPTH: usize = 2;

pub fn create_caps(width: i32, height: i32, fps: usize) -> Caps {
    VideoCapsBuilder::new()
        .width(width)
        .height(height)
        .framerate(gstreamer::Fraction::new(fps as i32, 1))
        .format(VideoFormat::Bgr)
        .build()
}

fn preview_error(e: impl std::fmt::Display) -> Error {
    Error::Preview(e.to_string())
}

/// Streams annotated frames as H.264 over RTP.
pub struct RtpPreview {
    pipeline: gstreamer::Pipeline,
    size: Size,
    duration: ClockTime,
    frames: u64,
    buffer: Buffer,
    buffer_s: Option<Sender<Buffer>>,
}

impl RtpPreview {
    pub fn new(config: &PreviewConfig) -> Result<Self> {
        gstreamer::init().map_err(preview_error)?;
        let pipeline_str = format!(
            "appsrc name=frames ! videoconvert ! x264enc tune=zerolatency bitrate=500 speed-preset=superfast ! rtph264pay ! udpsink host={} port={}",
            config.host, config.port
        );

        let pipeline = parse_launch(&pipeline_str)
            .map_err(|e| Error::Preview(format!("cannot create pipeline {pipeline_str}: {e}")))?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| Error::Preview("launch line is not a pipeline".to_string()))?;

        let app_src = pipeline
            .by_name("frames")
            .ok_or_else(|| Error::Preview("appsrc missing from pipeline".to_string()))?
            .dynamic_cast::<gstreamer_app::AppSrc>()
            .map_err(|_| Error::Preview("frames element is not an appsrc".to_string()))?;

        app_src.set_caps(Some(&create_caps(config.width, config.height, config.fps)));
        app_src.set_format(gstreamer::Format::Time);

        let (buffer_s, buffer_r) = bounded(QUEUE_DEPTH);
        feed(&app_src, buffer_r);

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(preview_error)?;
        info!(
            "preview streaming to {}:{} at {} fps",
            config.host, config.port, config.fps
        );

        let buffer = Buffer::with_size((config.width * config.height * 3) as usize)
            .map_err(preview_error)?;
        let duration = ClockTime::SECOND
            .mul_div_floor(1, config.fps.max(1) as u64)
            .ok_or_else(|| Error::Preview("frame duration overflow".to_string()))?;

        Ok(Self {
            pipeline,
            size: Size::new(config.width, config.height),
            duration,
            frames: 0,
            buffer,
            buffer_s: Some(buffer_s),
        })
    }
}

/// The encoder pulls frames from the queue whenever it needs data.
fn feed(app_src: &gstreamer_app::AppSrc, receiver: Receiver<Buffer>) {
    app_src.set_callbacks(
        gstreamer_app::AppSrcCallbacks::builder()
            .need_data(move |appsrc, _| {
                if let Ok(buffer) = receiver.recv() {
                    if let Err(e) = appsrc.push_buffer(buffer) {
                        debug!("appsrc refused buffer: {:?}", e);
                    }
                }
            })
            .build(),
    );
}

impl FrameSink for RtpPreview {
    fn publish(&mut self, frame: &Mat, _report: &FrameReport) -> Result<()> {
        let Some(buffer_s) = self.buffer_s.as_ref() else {
            return Err(Error::Preview("preview is closed".to_string()));
        };
        let mut resized = Mat::default();
        resize(frame, &mut resized, self.size, 0.0, 0.0, INTER_LINEAR)?;
        let data = resized.data_bytes()?;

        let pts = self.duration * self.frames;
        let buffer = self.buffer.make_mut();
        buffer
            .copy_from_slice(0, data)
            .map_err(|copied| Error::Preview(format!("frame truncated after {copied} bytes")))?;
        buffer.set_duration(self.duration);
        buffer.set_pts(pts);
        buffer.set_dts(pts);

        match buffer_s.try_send(self.buffer.copy()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("preview lagging, frame dropped"),
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::Preview("encoder is gone".to_string()))
            }
        }
        self.frames += 1;
        Ok(())
    }
}

impl Drop for RtpPreview {
    fn drop(&mut self) {
        // unblocks a pending need-data callback
        self.buffer_s.take();
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            debug!("cannot stop preview pipeline: {}", e);
        }
    }
}
