use opencv::core::{Point, Scalar};
use opencv::imgproc::{line, put_text, rectangle, LineTypes, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::Mat;

use super::aggregator::ReadTier;
use crate::error::Result;
use crate::types::BoundingBox;

const CORNER_LENGTH: i32 = 20;
const LABEL_OFFSET: i32 = 20;
const FONT_SCALE: f64 = 1.5;

// BGR
pub fn blue() -> Scalar {
    Scalar::from((255.0, 0.0, 0.0))
}

pub fn green() -> Scalar {
    Scalar::from((0.0, 255.0, 0.0))
}

pub fn red() -> Scalar {
    Scalar::from((0.0, 0.0, 255.0))
}

pub fn white() -> Scalar {
    Scalar::from((255.0, 255.0, 255.0))
}

pub fn tier_color(tier: ReadTier) -> Scalar {
    match tier {
        ReadTier::Logged => green(),
        ReadTier::LowConfidence => Scalar::from((0.0, 255.0, 255.0)),
        ReadTier::Partial => Scalar::from((0.0, 165.0, 255.0)),
        ReadTier::Unknown => red(),
    }
}

pub fn draw_box(image: &mut Mat, bbox: &BoundingBox, color: Scalar, thickness: i32) -> Result<()> {
    rectangle(
        image,
        bbox.to_rect(),
        color,
        thickness,
        LineTypes::LINE_4 as i32,
        0,
    )?;
    Ok(())
}

/// Text placed `LABEL_OFFSET` pixels above `anchor`, pushed by `lift` more.
pub fn draw_label(
    image: &mut Mat,
    text: &str,
    anchor: &BoundingBox,
    lift: i32,
    color: Scalar,
) -> Result<()> {
    put_text(
        image,
        text,
        Point::new(anchor.x1, anchor.y1 - LABEL_OFFSET - lift),
        FONT_HERSHEY_SIMPLEX,
        FONT_SCALE,
        color,
        2,
        LINE_8,
        false,
    )?;
    Ok(())
}

/// Four L-shaped corners instead of a full rectangle.
pub fn draw_corners(image: &mut Mat, bbox: &BoundingBox, color: Scalar) -> Result<()> {
    let (x1, y1, x2, y2) = (bbox.x1, bbox.y1, bbox.x2, bbox.y2);
    let arm = CORNER_LENGTH;
    let segments = [
        ((x1, y1), (x1, y1 + arm)),
        ((x1, y1), (x1 + arm, y1)),
        ((x2, y1), (x2, y1 + arm)),
        ((x2, y1), (x2 - arm, y1)),
        ((x1, y2), (x1, y2 - arm)),
        ((x1, y2), (x1 + arm, y2)),
        ((x2, y2), (x2, y2 - arm)),
        ((x2, y2), (x2 - arm, y2)),
    ];
    for ((ax, ay), (bx, by)) in segments {
        line(
            image,
            Point::new(ax, ay),
            Point::new(bx, by),
            color,
            4,
            LINE_8,
            0,
        )?;
    }
    Ok(())
}
