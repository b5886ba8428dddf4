//! Detection data model.
//!
use serde::{Deserialize, Serialize};

/// Minimum confidence (exclusive) for a detection to be drawn.
pub const RENDER_THRESHOLD: f32 = 0.66;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Axis-aligned box in pixel coordinates of the frame it was detected on.
///
/// `(x, y)` is the top-left corner, the origin is the top-left corner of the frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from the top-left and bottom-right corner points.
    pub fn from_corners(x_tl: f32, y_tl: f32, x_br: f32, y_br: f32) -> Self {
        Self::new(x_tl, y_tl, x_br - x_tl, y_br - y_tl)
    }

    /// Enclosed area. Boxes with a negative extent are empty.
    pub fn area(&self) -> f32 {
        if self.width < 0.0 || self.height < 0.0 {
            return 0.0;
        }

        self.width * self.height
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        // If the boxes do not overlap, the overlap box has a negative extent and an area of zero.
        let overlap = BoundingBox::from_corners(
            f32::max(self.x, other.x),
            f32::max(self.y, other.y),
            f32::min(self.x + self.width, other.x + other.width),
            f32::min(self.y + self.height, other.y + other.height),
        );
        let overlap_area = overlap.area();

        overlap_area / (self.area() + other.area() - overlap_area + EPS)
    }
}

/// One labeled, scored box predicted for a single frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// Whether the detection is confident enough to be drawn.
    pub fn is_rendered(&self) -> bool {
        self.confidence > RENDER_THRESHOLD
    }

    /// Caption drawn next to the box, e.g. `person - 90%`.
    pub fn caption(&self) -> String {
        format!(
            "{} - {}%",
            self.label,
            (self.confidence * 100.0).round() as u32
        )
    }
}
