use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::finalize::Finalizer;
use super::index::{PermanentRecord, PlateIndex};
use super::registry::VehicleKey;
use super::transient::TransientStore;
use crate::config::VideoConfig;
use crate::error::Result;

/// One preserved vehicle directory and what a second finalize made of it.
#[derive(Debug)]
pub struct Recovery {
    pub session: PathBuf,
    pub vehicle: VehicleKey,
    pub outcome: Result<PermanentRecord>,
}

/// Finalizes again every target left under `<output>/tmp` by an earlier
/// failure. Directories without checkpointed reads are left in place.
/// Sessions that predate their metadata file render at `fallback_fps`.
pub fn recover_leftovers(
    output_dir: &Path,
    video: &VideoConfig,
    fallback_fps: f64,
) -> Result<Vec<Recovery>> {
    let index = PlateIndex::in_output_dir(output_dir)?;
    let tmp = output_dir.join("tmp");
    if !tmp.exists() {
        return Ok(Vec::new());
    }

    let mut sessions: Vec<PathBuf> = fs::read_dir(&tmp)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    sessions.sort();

    let mut recovered = Vec::new();
    for session in sessions {
        let store = TransientStore::new(&session, true);
        let write_fps = match store.read_meta() {
            Ok(Some(meta)) => meta.write_fps,
            Ok(None) => fallback_fps,
            Err(e) => {
                warn!("{}: unreadable session metadata: {}", session.display(), e);
                fallback_fps
            }
        };
        let finalizer = Finalizer::new(
            output_dir,
            video.clone(),
            write_fps,
            store.clone(),
            index.clone(),
        );

        for key in store.vehicle_keys()? {
            let vehicle = match store.restore(key) {
                Ok(vehicle) => vehicle,
                Err(e) => {
                    warn!("{} in {}: checkpoints unreadable: {}", key, session.display(), e);
                    continue;
                }
            };
            if vehicle.events().is_empty() {
                warn!(
                    "{} in {} has no checkpointed reads, left in place",
                    key,
                    session.display()
                );
                continue;
            }
            info!("retrying finalize of {} from {}", key, session.display());
            recovered.push(Recovery {
                session: session.clone(),
                vehicle: key,
                outcome: finalizer.finalize(&vehicle).map(|report| report.record),
            });
        }

        if let Err(e) = store.remove_if_idle() {
            warn!("cannot remove {}: {}", session.display(), e);
        }
    }
    Ok(recovered)
}
