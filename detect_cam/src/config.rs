//! Runtime configuration.
//!
use std::{path::PathBuf, time::Duration};

use crate::recorder::Container;

/// ONNX model zoo SSD-MobileNet v1 trained on COCO.
pub const DEFAULT_MODEL_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/object_detection_segmentation/ssd-mobilenetv1/model/ssd_mobilenet_v1_12.onnx";

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// V4L2 device of the camera.
    pub device: String,
    /// Pixel format requested from the camera.
    pub format: String,
    /// Width of the composite surface.
    pub width: u32,
    /// Height of the composite surface.
    pub height: u32,
    /// Frame loop refresh rate in Hz.
    pub refresh_rate: u32,
    /// Local model file, downloaded from `model_url` into the cache when unset.
    pub model_path: Option<PathBuf>,
    pub model_url: String,
    /// Font for detection captions.
    pub font_path: Option<PathBuf>,
    /// JPEG quality of streamed and recorded frames.
    pub jpeg_quality: u8,
    /// Container of recordings.
    pub container: Container,
    /// FFmpeg executable encoding WebM recordings.
    pub ffmpeg_path: PathBuf,
}

impl AppConfig {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.refresh_rate.max(1)))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            format: "MJPG".into(),
            width: 640,
            height: 480,
            refresh_rate: 60,
            model_path: None,
            model_url: DEFAULT_MODEL_URL.into(),
            font_path: None,
            jpeg_quality: 90,
            container: Container::WebM,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn refresh_period_from_rate() {
        let config = AppConfig {
            refresh_rate: 50,
            ..Default::default()
        };
        assert_eq!(config.refresh_period(), Duration::from_millis(20));

        let config = AppConfig {
            refresh_rate: 0,
            ..Default::default()
        };
        assert_eq!(config.refresh_period(), Duration::from_secs(1));
    }

    #[test]
    fn records_webm_by_default() {
        let config = AppConfig::default();
        assert_eq!(config.container, Container::WebM);
        assert_eq!(config.container.file_name(), "recorded_video.webm");
    }
}
