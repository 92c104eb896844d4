use opencv::core::Rect;
use serde::{Deserialize, Serialize};

/// Identifier assigned by the upstream tracker. Only stable while a vehicle
/// stays continuously visible.
pub type TrackId = u32;

/// Source frame counter, strictly increasing within a stream session.
pub type FrameNumber = u64;

/// Axis aligned box stored as corners, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Moves a box expressed relative to `origin` into the coordinate space
    /// `origin` lives in.
    pub fn offset_by(&self, origin: &BoundingBox) -> Self {
        Self {
            x1: self.x1 + origin.x1,
            y1: self.y1 + origin.y1,
            x2: self.x2 + origin.x1,
            y2: self.y2 + origin.y1,
        }
    }

    /// Inverse of [`BoundingBox::offset_by`].
    pub fn relative_to(&self, origin: &BoundingBox) -> Self {
        Self {
            x1: self.x1 - origin.x1,
            y1: self.y1 - origin.y1,
            x2: self.x2 - origin.x1,
            y2: self.y2 - origin.y1,
        }
    }

    /// Clips the box to an image of `cols` x `rows`. Returns `None` when
    /// nothing of the box is left inside the image.
    pub fn clamp_to(&self, cols: i32, rows: i32) -> Option<Self> {
        let clamped = Self {
            x1: self.x1.clamp(0, cols),
            y1: self.y1.clamp(0, rows),
            x2: self.x2.clamp(0, cols),
            y2: self.y2.clamp(0, rows),
        };
        if clamped.is_empty() {
            return None;
        }
        Some(clamped)
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        let inter_area = inter.area();
        if inter_area == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter_area;
        inter_area as f32 / union as f32
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.width(), self.height())
    }
}

impl From<Rect> for BoundingBox {
    fn from(rect: Rect) -> Self {
        Self {
            x1: rect.x,
            y1: rect.y,
            x2: rect.x + rect.width,
            y2: rect.y + rect.height,
        }
    }
}

/// One vehicle returned by the tracker for a frame. Detections without an id
/// have not been confirmed by the tracker yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleDetection {
    pub track_id: Option<TrackId>,
    pub bbox: BoundingBox,
}

/// Recognized text for a plate crop. `region` is plate-local.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCandidate {
    pub text: String,
    pub confidence: u8,
    pub region: BoundingBox,
}
