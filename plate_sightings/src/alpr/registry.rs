use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{BoundingBox, FrameNumber, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleState {
    /// Seen by the tracker, no qualifying plate read yet.
    New,
    /// At least one qualifying plate read; evidence is being kept.
    Target,
    /// Departed, artifacts are being rendered.
    Finalizing,
    /// Terminal.
    Closed,
}

/// Session-unique identity of one logical vehicle. The tracker id alone is
/// not enough because trackers reuse ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VehicleKey {
    pub track_id: TrackId,
    pub serial: u64,
}

impl fmt::Display for VehicleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vehicle_{}_{}", self.track_id, self.serial)
    }
}

impl VehicleKey {
    /// Inverse of `Display`, used to name transient directories.
    pub fn parse(name: &str) -> Option<Self> {
        let (track_id, serial) = name.strip_prefix("vehicle_")?.split_once('_')?;
        Some(Self {
            track_id: track_id.parse().ok()?,
            serial: serial.parse().ok()?,
        })
    }
}

/// A logged plate read. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateDetectionEvent {
    pub text: String,
    pub confidence: u8,
    pub frame: FrameNumber,
}

#[derive(Debug)]
pub struct TrackedVehicle {
    key: VehicleKey,
    state: VehicleState,
    first_frame: FrameNumber,
    last_frame: FrameNumber,
    boxes: BTreeMap<FrameNumber, BoundingBox>,
    plate_boxes: BTreeMap<FrameNumber, BoundingBox>,
    events: Vec<PlateDetectionEvent>,
}

impl TrackedVehicle {
    fn new(key: VehicleKey, frame: FrameNumber, bbox: BoundingBox) -> Self {
        let mut boxes = BTreeMap::new();
        boxes.insert(frame, bbox);
        Self {
            key,
            state: VehicleState::New,
            first_frame: frame,
            last_frame: frame,
            boxes,
            plate_boxes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Rebuilds a departed target from its checkpointed history.
    pub fn restore(
        key: VehicleKey,
        boxes: BTreeMap<FrameNumber, BoundingBox>,
        plate_boxes: BTreeMap<FrameNumber, BoundingBox>,
        events: Vec<PlateDetectionEvent>,
    ) -> Self {
        let frames = boxes
            .keys()
            .copied()
            .chain(events.iter().map(|e| e.frame));
        let first_frame = frames.clone().min().unwrap_or_default();
        let last_frame = frames.max().unwrap_or_default();
        Self {
            key,
            state: VehicleState::Target,
            first_frame,
            last_frame,
            boxes,
            plate_boxes,
            events,
        }
    }

    pub fn key(&self) -> VehicleKey {
        self.key
    }

    pub fn track_id(&self) -> TrackId {
        self.key.track_id
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn is_target(&self) -> bool {
        self.state == VehicleState::Target
    }

    pub fn first_frame(&self) -> FrameNumber {
        self.first_frame
    }

    pub fn last_frame(&self) -> FrameNumber {
        self.last_frame
    }

    pub fn boxes(&self) -> &BTreeMap<FrameNumber, BoundingBox> {
        &self.boxes
    }

    pub fn plate_boxes(&self) -> &BTreeMap<FrameNumber, BoundingBox> {
        &self.plate_boxes
    }

    pub fn events(&self) -> &[PlateDetectionEvent] {
        &self.events
    }

    fn record_box(&mut self, frame: FrameNumber, bbox: BoundingBox) -> Result<()> {
        if frame <= self.last_frame {
            return Err(Error::FrameOrder {
                vehicle: self.key,
                frame,
                last: self.last_frame,
            });
        }
        self.boxes.insert(frame, bbox);
        self.last_frame = frame;
        Ok(())
    }

    /// Stores the plate box (vehicle-local) seen at `frame`. A later plate in
    /// the same frame replaces an earlier one.
    pub fn record_plate_box(&mut self, frame: FrameNumber, bbox: BoundingBox) -> Result<()> {
        if let Some((&last, _)) = self.plate_boxes.last_key_value() {
            if frame < last {
                return Err(Error::FrameOrder {
                    vehicle: self.key,
                    frame,
                    last,
                });
            }
        }
        self.plate_boxes.insert(frame, bbox);
        Ok(())
    }

    /// Appends a qualifying read and promotes the vehicle if needed.
    /// Returns `true` when this call promoted it.
    pub fn log_event(&mut self, event: PlateDetectionEvent) -> Result<bool> {
        if let Some(last) = self.events.last() {
            if event.frame < last.frame {
                return Err(Error::FrameOrder {
                    vehicle: self.key,
                    frame: event.frame,
                    last: last.frame,
                });
            }
        }
        self.events.push(event);
        Ok(self.promote())
    }

    /// `New` -> `Target`. Idempotent for targets.
    pub fn promote(&mut self) -> bool {
        match self.state {
            VehicleState::New => {
                info!("{} promoted to target at frame {}", self.key, self.last_frame);
                self.state = VehicleState::Target;
                true
            }
            _ => false,
        }
    }
}

/// Result of removing a vehicle that left the scene.
#[derive(Debug)]
pub enum Eviction<R> {
    /// A `New` vehicle that never produced a qualifying read.
    Dropped(VehicleKey),
    /// A target that went through finalization and is now closed.
    Finalized(VehicleKey, R),
}

/// Owns every vehicle currently visible, keyed by tracker id.
#[derive(Debug, Default)]
pub struct VehicleRegistry {
    vehicles: HashMap<TrackId, TrackedVehicle>,
    next_serial: u64,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `track_id` is visible at `frame`, creating a `New` entry
    /// for unknown ids.
    pub fn observe(
        &mut self,
        track_id: TrackId,
        frame: FrameNumber,
        bbox: BoundingBox,
    ) -> Result<&mut TrackedVehicle> {
        match self.vehicles.entry(track_id) {
            Entry::Occupied(entry) => {
                let vehicle = entry.into_mut();
                vehicle.record_box(frame, bbox)?;
                Ok(vehicle)
            }
            Entry::Vacant(entry) => {
                self.next_serial += 1;
                let key = VehicleKey {
                    track_id,
                    serial: self.next_serial,
                };
                debug!("{} first seen at frame {}", key, frame);
                Ok(entry.insert(TrackedVehicle::new(key, frame, bbox)))
            }
        }
    }

    pub fn promote(&mut self, track_id: TrackId) -> Result<bool> {
        self.vehicles
            .get_mut(&track_id)
            .map(TrackedVehicle::promote)
            .ok_or(Error::UnknownVehicle(track_id))
    }

    pub fn get(&self, track_id: TrackId) -> Option<&TrackedVehicle> {
        self.vehicles.get(&track_id)
    }

    pub fn get_mut(&mut self, track_id: TrackId) -> Option<&mut TrackedVehicle> {
        self.vehicles.get_mut(&track_id)
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &TrackedVehicle> {
        self.vehicles.values()
    }

    /// Ids of tracked vehicles missing from `visible`, sorted.
    pub fn departed(&self, visible: &[TrackId]) -> Vec<TrackId> {
        let mut gone: Vec<TrackId> = self
            .vehicles
            .keys()
            .filter(|id| !visible.contains(id))
            .copied()
            .collect();
        gone.sort_unstable();
        gone
    }

    pub fn active_ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self.vehicles.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn target_ids(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self
            .vehicles
            .values()
            .filter(|v| v.is_target())
            .map(TrackedVehicle::track_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Removes `track_id`. Targets are handed to `finalize` while in
    /// `Finalizing` and closed once it returns; `New` vehicles are dropped.
    pub fn evict<F, R>(&mut self, track_id: TrackId, finalize: F) -> Option<Eviction<R>>
    where
        F: FnOnce(&TrackedVehicle) -> R,
    {
        let mut vehicle = self.vehicles.remove(&track_id)?;
        match vehicle.state {
            VehicleState::New => {
                debug!("{} left without a qualifying read, dropped", vehicle.key);
                Some(Eviction::Dropped(vehicle.key))
            }
            VehicleState::Target => {
                vehicle.state = VehicleState::Finalizing;
                let outcome = finalize(&vehicle);
                vehicle.state = VehicleState::Closed;
                debug!("{} closed", vehicle.key);
                Some(Eviction::Finalized(vehicle.key, outcome))
            }
            VehicleState::Finalizing | VehicleState::Closed => {
                warn!("{} was stored in state {:?}", vehicle.key, vehicle.state);
                None
            }
        }
    }

    /// Evicts every vehicle, e.g. when the stream ends.
    pub fn evict_all<F, R>(&mut self, mut finalize: F) -> Vec<Eviction<R>>
    where
        F: FnMut(&TrackedVehicle) -> R,
    {
        self.active_ids()
            .into_iter()
            .filter_map(|id| self.evict(id, &mut finalize))
            .collect()
    }
}
