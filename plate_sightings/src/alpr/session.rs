use chrono::Local;
use opencv::prelude::{Mat, MatTraitConst};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregator::{DetectionAggregator, PlateRead, ReadTier, VehicleObservation};
use super::consensus::ConsensusPlate;
use super::finalize::Finalizer;
use super::index::{PermanentRecord, PlateIndex};
use super::registry::{Eviction, VehicleRegistry};
use super::render;
use super::transient::{SessionMeta, TransientStore};
use crate::adapters::{DetectionAdapter, FrameSink, FrameSource};
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::types::{BoundingBox, FrameNumber, TrackId};

/// Everything the front end needs about one processed frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub frame_number: FrameNumber,
    pub active_ids: Vec<TrackId>,
    pub target_ids: Vec<TrackId>,
    pub reads: Vec<PlateRead>,
    pub consensus: Vec<(TrackId, ConsensusPlate)>,
    pub finalized: Vec<PermanentRecord>,
}

impl FrameReport {
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Target IDs: {:?} / Active IDs: {:?}",
            self.target_ids, self.active_ids
        )];
        for (track_id, plate) in &self.consensus {
            lines.push(format!(
                "Vehicle {track_id} Voted Plate: {} ({})",
                plate.text, plate.votes
            ));
        }
        for read in &self.reads {
            lines.push(match read.tier {
                ReadTier::Unknown => format!("Vehicle {} Active Plate: UNKNOWN", read.track_id),
                _ => format!(
                    "Vehicle {} Active Plate: {} [{}%]",
                    read.track_id, read.text, read.confidence
                ),
            });
        }
        lines
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub frames: u64,
    pub records: Vec<PermanentRecord>,
    /// Set when the source failed instead of ending cleanly.
    pub interrupted: Option<String>,
}

/// One stream session: owns the vehicle registry and the injected detection
/// capabilities, and runs every frame to completion before the next one.
pub struct ProcessingSession {
    registry: VehicleRegistry,
    adapter: DetectionAdapter,
    aggregator: DetectionAggregator,
    finalizer: Finalizer,
    finalize_on_stream_end: bool,
}

impl ProcessingSession {
    /// Prepares a fresh transient directory under `<output>/tmp` and opens
    /// the plate index. `write_fps` is the rate clips are rendered at.
    pub fn new(adapter: DetectionAdapter, config: &Config, write_fps: f64) -> Result<Self> {
        let session_id = format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let store = TransientStore::new(
            config.output_dir.join("tmp").join(&session_id),
            config.checkpoint_logs,
        );
        let index = PlateIndex::in_output_dir(&config.output_dir)?;
        store.write_meta(&SessionMeta { write_fps })?;
        info!(
            "session {} writing to {} at {:.2} fps",
            session_id,
            config.output_dir.display(),
            write_fps
        );

        Ok(Self {
            registry: VehicleRegistry::new(),
            adapter,
            aggregator: DetectionAggregator::new(config.gate, store.clone()),
            finalizer: Finalizer::new(
                &config.output_dir,
                config.video.clone(),
                write_fps,
                store,
                index,
            ),
            finalize_on_stream_end: config.finalize_on_stream_end,
        })
    }

    pub fn registry(&self) -> &VehicleRegistry {
        &self.registry
    }

    pub fn index(&self) -> &PlateIndex {
        self.finalizer.index()
    }

    pub fn transient_root(&self) -> &std::path::Path {
        self.aggregator.store().root()
    }

    /// Tracks, aggregates and finalizes for one frame, then annotates `frame`
    /// in place. Errors of a single vehicle are logged and skipped.
    pub fn process_frame(
        &mut self,
        frame_number: FrameNumber,
        frame: &mut Mat,
    ) -> Result<FrameReport> {
        let raw = frame.try_clone()?;
        let visible: Vec<(TrackId, BoundingBox)> = self
            .adapter
            .tracker
            .track(&raw)?
            .into_iter()
            .filter_map(|d| d.track_id.map(|id| (id, d.bbox)))
            .collect();
        let visible_ids: Vec<TrackId> = visible.iter().map(|(id, _)| *id).collect();

        let mut report = FrameReport {
            frame_number,
            ..Default::default()
        };

        for track_id in self.registry.departed(&visible_ids) {
            if let Some(record) = self.evict(track_id) {
                report.finalized.push(record);
            }
        }

        for (track_id, vehicle_box) in visible {
            let vehicle = match self.registry.observe(track_id, frame_number, vehicle_box) {
                Ok(vehicle) => vehicle,
                Err(e) => {
                    warn!("frame {}: {}", frame_number, e);
                    continue;
                }
            };

            if let Err(e) = draw_vehicle(frame, track_id, &vehicle_box) {
                warn!("frame {}: cannot annotate vehicle {}: {}", frame_number, track_id, e);
            }

            let observation = match self.aggregator.process_vehicle(
                self.adapter.plates.as_mut(),
                self.adapter.recognizer.as_mut(),
                vehicle,
                frame_number,
                &raw,
                vehicle_box,
            ) {
                Ok(observation) => observation,
                Err(e) => {
                    warn!("frame {}: {} skipped: {}", frame_number, vehicle.key(), e);
                    continue;
                }
            };

            let consensus = ConsensusPlate::from_events(vehicle.events());
            let anchor = observation
                .plates
                .last()
                .map(|plate| plate.bbox)
                .unwrap_or(vehicle_box);
            if let Err(e) = draw_observation(frame, &observation, consensus.as_ref(), &anchor) {
                warn!("frame {}: cannot annotate plates of {}: {}", frame_number, vehicle.key(), e);
            }
            if let Some(consensus) = consensus {
                report.consensus.push((track_id, consensus));
            }
            report.reads.extend(observation.reads);
        }

        report.active_ids = self.registry.active_ids();
        report.target_ids = self.registry.target_ids();
        metrics::FRAMES_PROCESSED.inc();
        metrics::ACTIVE_VEHICLES.set(self.registry.len() as i64);
        debug!(
            "frame {}: {} active, {} targets, {} reads",
            frame_number,
            report.active_ids.len(),
            report.target_ids.len(),
            report.reads.len()
        );
        Ok(report)
    }

    fn evict(&mut self, track_id: TrackId) -> Option<PermanentRecord> {
        let finalizer = &self.finalizer;
        match self.registry.evict(track_id, |vehicle| finalizer.finalize(vehicle))? {
            Eviction::Finalized(_, Ok(report)) => Some(report.record),
            // already reported by the finalizer
            Eviction::Finalized(_, Err(_)) | Eviction::Dropped(_) => None,
        }
    }

    /// Shutdown path: targets still in view are finalized, or discarded when
    /// stream-end finalization is off. Everything else is dropped.
    pub fn finish(&mut self) -> Vec<PermanentRecord> {
        let finalizer = &self.finalizer;
        let evictions = if self.finalize_on_stream_end {
            self.registry
                .evict_all(|vehicle| finalizer.finalize(vehicle).ok().map(|r| r.record))
        } else {
            self.registry.evict_all(|vehicle| {
                finalizer.discard(vehicle);
                None
            })
        };
        metrics::ACTIVE_VEHICLES.set(0);
        if let Err(e) = self.aggregator.store().remove_if_idle() {
            warn!("cannot remove session directory: {}", e);
        }

        evictions
            .into_iter()
            .filter_map(|eviction| match eviction {
                Eviction::Finalized(_, record) => record,
                Eviction::Dropped(_) => None,
            })
            .collect()
    }

    /// Drives the session until the source ends or fails, publishing every
    /// annotated frame to `sinks`, then runs the shutdown path.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sinks: &mut [Box<dyn FrameSink>],
    ) -> RunSummary {
        let mut summary = RunSummary::default();

        loop {
            let (frame_number, mut frame) = match source.next_frame() {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!("end of stream after {} frames", summary.frames);
                    break;
                }
                Err(e) => {
                    error!("{}", e);
                    summary.interrupted = Some(e.to_string());
                    break;
                }
            };
            if frame.empty() {
                debug!("frame {} is empty, skipped", frame_number);
                continue;
            }

            let report = match self.process_frame(frame_number, &mut frame) {
                Ok(report) => report,
                Err(e) => {
                    warn!("frame {} dropped: {}", frame_number, e);
                    continue;
                }
            };
            summary.frames += 1;
            for sink in sinks.iter_mut() {
                if let Err(e) = sink.publish(&frame, &report) {
                    warn!("frame {} not published: {}", frame_number, e);
                }
            }
            summary.records.extend(report.finalized);
        }

        let remaining = self.finish();
        if !remaining.is_empty() {
            info!("{} targets finalized at stream end", remaining.len());
        }
        summary.records.extend(remaining);
        summary
    }
}

fn draw_vehicle(frame: &mut Mat, track_id: TrackId, vehicle_box: &BoundingBox) -> Result<()> {
    render::draw_box(frame, vehicle_box, render::blue(), 2)?;
    render::draw_label(
        frame,
        &format!("Vehicle {track_id}"),
        vehicle_box,
        0,
        render::blue(),
    )
}

/// Plate corners, live reads and the running vote, which sits above `anchor`.
fn draw_observation(
    frame: &mut Mat,
    observation: &VehicleObservation,
    consensus: Option<&ConsensusPlate>,
    anchor: &BoundingBox,
) -> Result<()> {
    for plate in &observation.plates {
        if plate.recognized {
            render::draw_corners(frame, &plate.bbox, render::white())?;
        } else {
            render::draw_corners(frame, &plate.bbox, render::red())?;
            render::draw_label(frame, "UNKNOWN", &plate.bbox, 0, render::red())?;
        }
    }
    for read in observation.reads.iter().filter(|r| r.tier != ReadTier::Unknown) {
        render::draw_label(
            frame,
            &format!("Active: {} [{}%]", read.text, read.confidence),
            &read.region,
            0,
            render::tier_color(read.tier),
        )?;
    }
    if let Some(consensus) = consensus {
        render::draw_label(
            frame,
            &format!("Voted: {} ({})", consensus.text, consensus.votes),
            anchor,
            40,
            render::green(),
        )?;
    }
    Ok(())
}

/// Logs the per-frame status through `tracing`.
#[derive(Debug, Default)]
pub struct StatusLogger;

impl FrameSink for StatusLogger {
    fn publish(&mut self, _frame: &Mat, report: &FrameReport) -> Result<()> {
        for line in report.status_lines() {
            debug!("frame {}: {}", report.frame_number, line);
        }
        for record in &report.finalized {
            info!(
                "recorded {} on {} {} ({})",
                record.plate, record.date, record.time, record.record_id
            );
        }
        Ok(())
    }
}
