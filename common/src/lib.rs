//! Common types shared between the detector, the renderer and the HTTP surface.
pub mod detection;

pub use detection::{BoundingBox, Detection, RENDER_THRESHOLD};
