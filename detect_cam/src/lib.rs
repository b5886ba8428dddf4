//! Live object detection on a webcam stream with an annotated preview and recording in the
//! browser.
pub mod config;
pub mod controller;
pub mod endpoints;
pub mod error;
pub mod frame_loop;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod recorder;
pub mod sensors;
pub mod utils;

pub use error::AppError;

use std::sync::Arc;

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::broadcast;

/// Composite frames published once per frame loop cycle.
pub type FrameSender = broadcast::Sender<Arc<RgbImage>>;
pub type FrameReceiver = broadcast::Receiver<Arc<RgbImage>>;

/// Capacity of composite frame channels, lagging subscribers skip frames.
const FRAME_CHANNEL_CAPACITY: usize = 20;

pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    broadcast::channel(FRAME_CHANNEL_CAPACITY)
}

/// Wrap a JPEG image as a part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
