//! Detect cam server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use detect_cam::{
    config::{AppConfig, DEFAULT_MODEL_URL},
    controller::AppContext,
    endpoints::router,
    meter::spawn_meter_logger,
    nn::SsdMobilenetModel,
    overlay::load_font,
    recorder::{Container, Recorder},
    sensors::CameraProvider,
};
use env_logger::TimestampPrecision;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RecordingFormat {
    /// VP8 in WebM, encoded by FFmpeg
    Webm,
    /// Concatenated JPEG frames
    Mjpeg,
}

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the page on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Video device of the camera
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Pixel format requested from the camera
    #[clap(long, default_value = "MJPG")]
    format: String,

    /// Width of the annotated stream
    #[clap(long, default_value_t = 640)]
    width: u32,

    /// Height of the annotated stream
    #[clap(long, default_value_t = 480)]
    height: u32,

    /// Maximum frames per second of the detection loop
    #[clap(long, default_value_t = 60)]
    refresh_rate: u32,

    /// Local ONNX model, downloaded from `model_url` if not given
    #[clap(long)]
    model_path: Option<PathBuf>,

    /// URL of the ONNX model
    #[clap(long, default_value = DEFAULT_MODEL_URL)]
    model_url: String,

    /// TrueType font for detection captions
    #[clap(long)]
    font_path: Option<PathBuf>,

    /// JPEG quality of streamed and recorded frames
    #[clap(long, default_value_t = 90)]
    jpeg_quality: u8,

    /// Container of recordings
    #[clap(long, value_enum, default_value_t = RecordingFormat::Webm)]
    recording_format: RecordingFormat,

    /// FFmpeg executable used for WebM recordings
    #[clap(long, default_value = "ffmpeg")]
    ffmpeg_path: PathBuf,
}

impl From<Args> for AppConfig {
    fn from(args: Args) -> Self {
        AppConfig {
            device: args.device,
            format: args.format,
            width: args.width,
            height: args.height,
            refresh_rate: args.refresh_rate,
            model_path: args.model_path,
            model_url: args.model_url,
            font_path: args.font_path,
            jpeg_quality: args.jpeg_quality,
            container: match args.recording_format {
                RecordingFormat::Webm => Container::WebM,
                RecordingFormat::Mjpeg => Container::MotionJpeg,
            },
            ffmpeg_path: args.ffmpeg_path,
        }
    }
}

#[cfg(feature = "v4l")]
fn camera_provider(config: &AppConfig) -> Box<dyn CameraProvider> {
    Box::new(detect_cam::sensors::V4lCameraProvider::new(
        &config.device,
        &config.format,
    ))
}

#[cfg(not(feature = "v4l"))]
fn camera_provider(_config: &AppConfig) -> Box<dyn CameraProvider> {
    log::warn!("Built without the `v4l` feature, the camera cannot be enabled");
    Box::new(detect_cam::sensors::NoCamera)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let addr: SocketAddr = args.server_address.parse()?;
    let config = AppConfig::from(args);

    let font = load_font(config.font_path.as_deref())?;
    if font.is_none() {
        log::warn!("No caption font found, drawing boxes only");
    }

    let ctx = Arc::new(AppContext::new(
        config.clone(),
        camera_provider(&config),
        font,
        Recorder::from_config(&config),
    ));

    // The page is served right away, the camera can be enabled once the model is loaded
    ctx.spawn_detector_load(async move {
        SsdMobilenetModel::load(
            config.model_path.as_deref(),
            &config.model_url,
            config.width,
            config.height,
        )
        .await
    });

    spawn_meter_logger();

    // Serve HTTP server
    log::info!("Serving on http://{addr}");
    let shutdown_ctx = Arc::clone(&ctx);
    axum::Server::bind(&addr)
        .serve(router(ctx).into_make_service())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutting down");
            shutdown_ctx.shutdown().await;
        })
        .await?;

    Ok(())
}
