//! Composite surface and the detection overlay drawn on it.
//!
use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use common::{BoundingBox, Detection};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};
use tokio::sync::Mutex;

use crate::{frame_channel, FrameReceiver, FrameSender};

/// Color of boxes, `green` in CSS.
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 128, 0]);

/// Color of captions, the default canvas fill style.
pub const CAPTION_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Caption font size in pixels.
const CAPTION_SCALE: Scale = Scale { x: 14.0, y: 14.0 };

/// Fonts tried when no font is configured.
const FALLBACK_FONTS: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
];

/// One box with its caption as drawn on the surface.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub rect: BoundingBox,
    pub caption: String,
    /// Left end of the caption baseline.
    pub caption_origin: (f32, f32),
}

/// Baseline of the caption for a box, kept inside the top of the surface.
pub fn caption_baseline(bbox: &BoundingBox) -> f32 {
    if bbox.y > 10.0 {
        bbox.y - 5.0
    } else {
        10.0
    }
}

/// Paint `frame` stretched to the size of `surface` and draw the confident detections on top.
///
/// Captions are skipped without a font, boxes are drawn regardless.
pub fn render_overlay(
    surface: &mut RgbImage,
    frame: &RgbImage,
    detections: &[Detection],
    font: Option<&Font<'static>>,
) -> Vec<Overlay> {
    let (width, height) = surface.dimensions();
    if frame.dimensions() == (width, height) {
        surface.clone_from(frame);
    } else {
        *surface = image::imageops::resize(
            frame,
            width,
            height,
            image::imageops::FilterType::Triangle,
        );
    }

    let mut overlays = Vec::new();
    for detection in detections.iter().filter(|d| d.is_rendered()) {
        let bbox = detection.bbox;
        draw_box(&mut *surface, &bbox);

        let overlay = Overlay {
            rect: bbox,
            caption: detection.caption(),
            caption_origin: (bbox.x, caption_baseline(&bbox)),
        };

        if let Some(font) = font {
            // imageproc positions text by its top edge
            let ascent = font.v_metrics(CAPTION_SCALE).ascent;
            draw_text_mut(
                &mut *surface,
                CAPTION_COLOR,
                overlay.caption_origin.0 as i32,
                (overlay.caption_origin.1 - ascent) as i32,
                CAPTION_SCALE,
                font,
                &overlay.caption,
            );
        }

        overlays.push(overlay);
    }

    overlays
}

/// Stroke a 2px rectangle along the inside of the box.
fn draw_box(surface: &mut RgbImage, bbox: &BoundingBox) {
    let (x, y) = (bbox.x as i32, bbox.y as i32);
    let (width, height) = (bbox.width.max(1.0) as u32, bbox.height.max(1.0) as u32);

    draw_hollow_rect_mut(surface, Rect::at(x, y).of_size(width, height), BOX_COLOR);
    if width > 2 && height > 2 {
        draw_hollow_rect_mut(
            surface,
            Rect::at(x + 1, y + 1).of_size(width - 2, height - 2),
            BOX_COLOR,
        );
    }
}

/// Load the caption font from `path`, or from a well-known location when unset.
pub fn load_font(path: Option<&Path>) -> Result<Option<Font<'static>>> {
    let path = match path {
        Some(path) => path.to_owned(),
        None => match FALLBACK_FONTS.iter().map(Path::new).find(|p| p.exists()) {
            Some(path) => path.to_owned(),
            None => return Ok(None),
        },
    };

    let data = std::fs::read(&path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    let font = Font::try_from_vec(data)
        .ok_or_else(|| anyhow!("{} is not a TrueType font", path.display()))?;
    log::info!("Using caption font {}", path.display());

    Ok(Some(font))
}

/// Raster surface holding the latest frame with its overlay.
///
/// Every paint publishes a snapshot to the subscribers of [`CompositeSurface::capture_stream`].
pub struct CompositeSurface {
    image: Mutex<RgbImage>,
    detections: Mutex<Vec<Detection>>,
    frames_tx: FrameSender,
    font: Option<Arc<Font<'static>>>,
}

impl CompositeSurface {
    pub fn new(width: u32, height: u32, font: Option<Arc<Font<'static>>>) -> Self {
        let (frames_tx, _) = frame_channel();
        Self {
            image: Mutex::new(RgbImage::new(width, height)),
            detections: Mutex::new(Vec::new()),
            frames_tx,
            font,
        }
    }

    pub async fn dimensions(&self) -> (u32, u32) {
        self.image.lock().await.dimensions()
    }

    /// Subscribe to the composite frames painted from now on.
    pub fn capture_stream(&self) -> FrameReceiver {
        self.frames_tx.subscribe()
    }

    /// Overwrite the surface with `frame` and its detections, then publish it.
    pub async fn paint(&self, frame: &RgbImage, detections: Vec<Detection>) -> Vec<Overlay> {
        let snapshot = {
            let mut image = self.image.lock().await;
            let overlays = render_overlay(&mut image, frame, &detections, self.font.as_deref());
            log::debug!("Painted {} of {} detections", overlays.len(), detections.len());
            (Arc::new(image.clone()), overlays)
        };
        *self.detections.lock().await = detections;

        // No subscribers is not an error, nobody is watching or recording
        self.frames_tx.send(snapshot.0).ok();

        snapshot.1
    }

    /// Copy of the current content.
    pub async fn snapshot(&self) -> RgbImage {
        self.image.lock().await.clone()
    }

    /// Detections of the most recent paint.
    pub async fn last_detections(&self) -> Vec<Detection> {
        self.detections.lock().await.clone()
    }
}
