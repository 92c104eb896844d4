use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use opencv::core::Vector;
use opencv::imgcodecs::imwrite;
use opencv::prelude::{Mat, MatTraitConst, VideoWriterTrait, VideoWriterTraitConst};
use opencv::videoio::VideoWriter;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::consensus::ConsensusPlate;
use super::index::{PermanentRecord, PlateIndex};
use super::registry::{TrackedVehicle, VehicleKey};
use super::render;
use super::transient::TransientStore;
use crate::config::VideoConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{BoundingBox, FrameNumber};

const TARGET_LABEL: &str = "Target Vehicle";

#[derive(Debug)]
pub struct FinalizeReport {
    pub record: PermanentRecord,
    pub consensus: ConsensusPlate,
    pub frames_written: usize,
    /// Overlays or stills that could not be produced.
    pub degraded: Vec<Error>,
}

/// Turns a departed target vehicle into its permanent record: clip, stills
/// and an index entry.
#[derive(Debug, Clone)]
pub struct Finalizer {
    output_dir: PathBuf,
    video: VideoConfig,
    write_fps: f64,
    store: TransientStore,
    index: PlateIndex,
}

impl Finalizer {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        video: VideoConfig,
        write_fps: f64,
        store: TransientStore,
        index: PlateIndex,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            video,
            write_fps,
            store,
            index,
        }
    }

    pub fn index(&self) -> &PlateIndex {
        &self.index
    }

    /// Runs to completion for one vehicle. Transient storage is purged unless
    /// the failure left it worth inspecting.
    pub fn finalize(&self, vehicle: &TrackedVehicle) -> Result<FinalizeReport> {
        let timer = metrics::FINALIZE_SECONDS.start_timer();
        let key = vehicle.key();
        let outcome = self.render_and_commit(vehicle);

        match &outcome {
            Ok(report) => {
                metrics::VEHICLES_FINALIZED.inc();
                info!(
                    "{} finalized as {:?} ({} votes, {} frames) -> {}",
                    key,
                    report.consensus.text,
                    report.consensus.votes,
                    report.frames_written,
                    report.record.record_id
                );
                self.purge(key);
            }
            Err(e) if e.preserves_transient() => {
                metrics::FINALIZE_FAILURES
                    .with_label_values(&[e.kind()])
                    .inc();
                error!(
                    "finalize of {} failed: {}; transient data kept at {}",
                    key,
                    e,
                    self.store.vehicle_dir(key).display()
                );
            }
            Err(e) => {
                metrics::FINALIZE_FAILURES
                    .with_label_values(&[e.kind()])
                    .inc();
                error!("finalize of {} aborted: {}", key, e);
                self.purge(key);
            }
        }

        timer.observe_duration();
        outcome
    }

    /// Drops a target's evidence without producing a record.
    pub fn discard(&self, vehicle: &TrackedVehicle) {
        warn!(
            "{} discarded with {} logged reads",
            vehicle.key(),
            vehicle.events().len()
        );
        self.purge(vehicle.key());
    }

    fn purge(&self, key: VehicleKey) {
        if let Err(e) = self.store.purge(key) {
            warn!("cannot purge transient data of {}: {}", key, e);
        }
    }

    /// The record directory only survives together with its index entry.
    fn render_and_commit(&self, vehicle: &TrackedVehicle) -> Result<FinalizeReport> {
        let key = vehicle.key();
        let consensus =
            ConsensusPlate::from_events(vehicle.events()).ok_or(Error::EmptyDetectionSet(key))?;

        let record_id = Uuid::new_v4();
        let relative_dir = format!("perm/{record_id}");
        let record_dir = self.output_dir.join(&relative_dir);
        fs::create_dir_all(&record_dir)?;

        let committed = self
            .render(vehicle, consensus, record_id, &record_dir, &relative_dir)
            .and_then(|report| {
                if !report.record.has_artifacts() {
                    remove_record_dir(&record_dir);
                }
                self.index.append(&report.record)?;
                Ok(report)
            });
        if committed.is_err() {
            remove_record_dir(&record_dir);
        }
        committed
    }

    fn render(
        &self,
        vehicle: &TrackedVehicle,
        consensus: ConsensusPlate,
        record_id: Uuid,
        record_dir: &Path,
        relative_dir: &str,
    ) -> Result<FinalizeReport> {
        let key = vehicle.key();
        let mut record = PermanentRecord::new(record_id, consensus.text.clone(), Local::now());
        let mut degraded = Vec::new();
        let mut writer: Option<VideoWriter> = None;
        let mut stills_taken = false;
        let mut frames_written = 0;

        for frame_number in self.store.stored_frames(key)? {
            let Some(raw) = self.store.load_frame(key, frame_number)? else {
                warn!("{}: stored frame {} is unreadable, skipped", key, frame_number);
                continue;
            };
            let mut image = raw.try_clone()?;
            let vehicle_box = vehicle.boxes().get(&frame_number).copied();
            let plate_box = vehicle.plate_boxes().get(&frame_number).copied();

            match (vehicle_box, plate_box) {
                (Some(vehicle_box), plate_box) => {
                    render::draw_box(&mut image, &vehicle_box, render::red(), 2)?;
                    render::draw_label(&mut image, TARGET_LABEL, &vehicle_box, 0, render::red())?;

                    if let Some(plate_box) = plate_box {
                        let plate_in_frame = plate_box.offset_by(&vehicle_box);
                        render::draw_corners(&mut image, &plate_in_frame, render::white())?;
                        render::draw_label(
                            &mut image,
                            &consensus.text,
                            &plate_in_frame,
                            0,
                            render::white(),
                        )?;

                        if !stills_taken {
                            stills_taken = true;
                            self.save_stills(
                                &raw,
                                &vehicle_box,
                                &plate_in_frame,
                                record_dir,
                                relative_dir,
                                &mut record,
                            )?;
                        }
                    }
                }
                (None, plate_box) => {
                    degraded.push(missing(key, frame_number, "vehicle"));
                    if plate_box.is_some() {
                        degraded.push(missing(key, frame_number, "plate anchor"));
                    }
                }
            }

            if writer.is_none() {
                let file = format!("video.{}", self.video.extension);
                writer = Some(self.open_writer(&record_dir.join(&file), &image)?);
                record.video_path = Some(format!("{relative_dir}/{file}"));
            }
            if let Some(writer) = writer.as_mut() {
                writer.write(&image)?;
                frames_written += 1;
            }
        }

        if let Some(mut writer) = writer {
            writer.release()?;
        } else {
            warn!("{}: no stored frames, clip skipped", key);
        }
        if !stills_taken {
            warn!("{}: no frame with both vehicle and plate box, stills skipped", key);
        }
        for issue in &degraded {
            warn!("{}", issue);
        }

        Ok(FinalizeReport {
            record,
            consensus,
            frames_written,
            degraded,
        })
    }

    fn open_writer(&self, path: &Path, first_frame: &Mat) -> Result<VideoWriter> {
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc(&self.video.fourcc)?,
            self.write_fps,
            first_frame.size()?,
            true,
        )?;
        if !writer.is_opened()? {
            return Err(Error::Io(std::io::Error::other(format!(
                "cannot open video writer for {} ({})",
                path.display(),
                self.video.fourcc
            ))));
        }
        Ok(writer)
    }

    /// Crops from the raw frame so the stills carry no overlay.
    fn save_stills(
        &self,
        raw: &Mat,
        vehicle_box: &BoundingBox,
        plate_box: &BoundingBox,
        record_dir: &Path,
        relative_dir: &str,
        record: &mut PermanentRecord,
    ) -> Result<()> {
        record.vehicle_still_path =
            save_crop(raw, vehicle_box, record_dir, relative_dir, "vehicle.jpg")?;
        record.plate_still_path = save_crop(raw, plate_box, record_dir, relative_dir, "plate.jpg")?;
        Ok(())
    }
}

fn remove_record_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("cannot remove incomplete record {}: {}", dir.display(), e);
    }
}

fn missing(vehicle: VehicleKey, frame: FrameNumber, track: &'static str) -> Error {
    Error::MissingTrackData {
        vehicle,
        frame,
        track,
    }
}

fn save_crop(
    raw: &Mat,
    bbox: &BoundingBox,
    record_dir: &Path,
    relative_dir: &str,
    file: &str,
) -> Result<Option<String>> {
    let Some(visible) = bbox.clamp_to(raw.cols(), raw.rows()) else {
        return Ok(None);
    };
    let crop = Mat::roi(raw, visible.to_rect())?;
    let path = record_dir.join(file);
    if !imwrite(&path.to_string_lossy(), &crop, &Vector::new())? {
        return Err(Error::Io(std::io::Error::other(format!(
            "cannot encode {}",
            path.display()
        ))));
    }
    Ok(Some(format!("{relative_dir}/{file}")))
}

fn fourcc(code: &str) -> Result<i32> {
    let chars: Vec<char> = code.chars().collect();
    let [a, b, c, d] = chars.as_slice() else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("fourcc must be four characters, got {code:?}"),
        )));
    };
    Ok(VideoWriter::fourcc(*a, *b, *c, *d)?)
}
