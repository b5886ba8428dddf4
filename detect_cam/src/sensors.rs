//! Sensors module.
//!
use anyhow::{bail, Result};
use image::RgbImage;

/// Constraints of a camera request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn video_only() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

/// Live sequence of camera frames.
pub trait CaptureSource: Send {
    /// Block until the next frame is available.
    fn capture(&mut self) -> Result<RgbImage>;
}

/// Grants access to a camera stream.
pub trait CameraProvider: Send + Sync {
    fn open(&self, constraints: &MediaConstraints) -> Result<Box<dyn CaptureSource>>;
}

fn check_constraints(constraints: &MediaConstraints) -> Result<()> {
    if !constraints.video {
        bail!("camera requested without video");
    }
    if constraints.audio {
        bail!("audio capture is not supported");
    }
    Ok(())
}

/// Provider for systems built without camera support.
pub struct NoCamera;

impl CameraProvider for NoCamera {
    fn open(&self, constraints: &MediaConstraints) -> Result<Box<dyn CaptureSource>> {
        check_constraints(constraints)?;
        bail!("built without camera support, enable the `v4l` feature")
    }
}

#[cfg(feature = "v4l")]
pub use v4l::V4lCameraProvider;

#[cfg(feature = "v4l")]
mod v4l {
    use anyhow::{anyhow, Context, Result};
    use image::RgbImage;
    use rscam::{Camera, Config};

    use super::{check_constraints, CameraProvider, CaptureSource, MediaConstraints};

    /// Camera on a Linux machine, accessed via V4L2.
    pub struct V4lCameraProvider {
        device: String,
        format: String,
    }

    impl V4lCameraProvider {
        pub fn new(device: &str, format: &str) -> Self {
            Self {
                device: device.to_owned(),
                format: format.to_owned(),
            }
        }
    }

    impl CameraProvider for V4lCameraProvider {
        fn open(&self, constraints: &MediaConstraints) -> Result<Box<dyn CaptureSource>> {
            check_constraints(constraints)?;

            let mut cam = Camera::new(&self.device)
                .with_context(|| format!("failed to open camera {}", self.device))?;
            log_supported_formats(&cam, &self.format);
            let format = self.format.as_bytes();

            log::info!("Using camera {}", self.device);

            let resolution = get_max_resolution(&cam, format)?;
            let frame_rate = get_max_frame_rate(&cam, format, resolution)?;

            cam.start(&Config {
                interval: frame_rate,
                resolution,
                format,
                ..Default::default()
            })
            .context("failed to start camera")?;

            Ok(Box::new(V4lCamera {
                cam,
                mjpeg: format == b"MJPG",
                resolution,
            }))
        }
    }

    struct V4lCamera {
        cam: Camera,
        mjpeg: bool,
        resolution: (u32, u32),
    }

    impl CaptureSource for V4lCamera {
        fn capture(&mut self) -> Result<RgbImage> {
            let frame = self.cam.capture().context("failed to capture frame")?;
            log::debug!("Captured frame ({} bytes)", frame.len());

            if self.mjpeg {
                let image = image::load_from_memory_with_format(&frame, image::ImageFormat::Jpeg)
                    .context("failed to decode MJPG frame")?;
                Ok(image.to_rgb8())
            } else {
                let (width, height) = self.resolution;
                RgbImage::from_raw(width, height, frame.to_vec())
                    .ok_or_else(|| anyhow!("frame does not match {width}x{height} RGB"))
            }
        }
    }

    /// Get the maximum supported resolution for the given format.
    fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
        let resolution_info = cam.resolutions(format)?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Map to iterator over ((width, height) num_pixels)
                .map(|res| (res, res.0 * res.1))
                .max_by(|a, b| a.1.cmp(&b.1))
                .map(|res| *res.0),
            rscam::ResolutionInfo::Stepwise {
                min: _,
                max,
                step: _,
            } => Some(max),
        }
        .ok_or_else(|| anyhow!("no resolution found"))
    }

    /// Get the maximum supported frame rate for the given format and resolution.
    fn get_max_frame_rate(
        cam: &Camera,
        format: &[u8],
        resolution: (u32, u32),
    ) -> Result<(u32, u32)> {
        let interval_info = cam.intervals(format, resolution)?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        match interval_info {
            rscam::IntervalInfo::Discretes(frame_rates) => frame_rates
                .iter()
                // Intervals are (numerator, denominator) seconds per frame
                .map(|(numerator, denominator)| {
                    ((numerator, denominator), denominator / numerator.max(&1))
                })
                .max_by(|a, b| a.1.cmp(&b.1))
                .map(|((&n, &d), _)| (n, d)),
            rscam::IntervalInfo::Stepwise {
                min,
                max: _,
                step: _,
            } => Some(min),
        }
        .ok_or_else(|| anyhow!("no frame rate found"))
    }

    fn log_supported_formats(cam: &Camera, format: &str) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!(
            "Supported formats: {:?}, using format {:?}",
            formats,
            format
        );
    }
}
