use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use common::{BoundingBox, Detection};
use detect_cam::{
    config::AppConfig,
    controller::{AppContext, EnableOutcome},
    endpoints::router,
    frame_loop::{CycleOutcome, FrameLoop},
    nn::Detector,
    overlay::{CompositeSurface, Overlay, BOX_COLOR},
    recorder::{ChunkEncoder, Container, Recorder},
    AppError,
    sensors::{CameraProvider, CaptureSource, MediaConstraints},
};
use bytes::Bytes;
use image::{Rgb, RgbImage};

struct StillCamera;

impl CaptureSource for StillCamera {
    fn capture(&mut self) -> Result<RgbImage> {
        std::thread::sleep(Duration::from_millis(2));
        Ok(RgbImage::from_pixel(640, 480, Rgb([40, 40, 40])))
    }
}

struct StillCameraProvider;

impl CameraProvider for StillCameraProvider {
    fn open(&self, _constraints: &MediaConstraints) -> Result<Box<dyn CaptureSource>> {
        Ok(Box::new(StillCamera))
    }
}

/// Always sees one person in the top left corner.
struct PersonDetector;

impl Detector for PersonDetector {
    fn name(&self) -> &'static str {
        "person"
    }

    fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        Ok(vec![Detection::new(
            "person",
            0.9,
            BoundingBox::new(10.0, 5.0, 50.0, 80.0),
        )])
    }
}

/// Stands in for the FFmpeg encoder: an EBML header, then one tag byte per frame.
struct TaggingWebmEncoder {
    header_written: bool,
}

impl ChunkEncoder for TaggingWebmEncoder {
    fn encode(&mut self, _frame: &RgbImage) -> Result<Bytes, AppError> {
        if self.header_written {
            return Ok(Bytes::from_static(&[0xA3]));
        }
        self.header_written = true;
        Ok(Bytes::from_static(&[0x1A, 0x45, 0xDF, 0xA3]))
    }
}

fn webm_recorder() -> Recorder {
    Recorder::new(
        Container::WebM,
        Box::new(|_, _| -> Result<Box<dyn ChunkEncoder>, AppError> {
            Ok(Box::new(TaggingWebmEncoder {
                header_written: false,
            }))
        }),
    )
}

fn context(recorder: Recorder) -> Arc<AppContext> {
    let config = AppConfig {
        refresh_rate: 200,
        ..Default::default()
    };
    Arc::new(AppContext::new(
        config,
        Box::new(StillCameraProvider),
        None,
        recorder,
    ))
}

async fn serve(ctx: Arc<AppContext>) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = axum::Server::bind(&addr).serve(router(ctx).into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

async fn wait_for_frames(surface: &CompositeSurface, count: usize) {
    let mut frames = surface.capture_stream();
    let mut received = 0;
    while received < count {
        if frames.recv().await.is_ok() {
            received += 1;
        }
    }
}

#[tokio::test]
async fn person_is_boxed_and_captioned() {
    let surface = Arc::new(CompositeSurface::new(640, 480, None));
    let mut frame_loop = FrameLoop::new(
        Box::new(StillCamera),
        Arc::new(PersonDetector),
        surface.clone(),
        Duration::from_millis(5),
    );

    let outcome = frame_loop.cycle().await.unwrap();

    let CycleOutcome::Rendered(overlays) = outcome else {
        panic!("detection failed");
    };
    assert_eq!(
        overlays,
        vec![Overlay {
            rect: BoundingBox::new(10.0, 5.0, 50.0, 80.0),
            caption: "person - 90%".to_owned(),
            // Box top is within 10px of the surface top
            caption_origin: (10.0, 10.0),
        }]
    );

    let composite = surface.snapshot().await;
    assert_eq!(composite[(10, 5)], BOX_COLOR);
    assert_eq!(composite[(59, 84)], BOX_COLOR);
    assert_eq!(composite[(30, 40)], Rgb([40, 40, 40]));
}

#[tokio::test]
async fn end_to_end_through_controller() {
    let ctx = context(Recorder::jpeg(80));
    assert_eq!(ctx.enable_camera().await.unwrap(), EnableOutcome::Ignored);
    // Enabling early is a no-op, the trigger stays available
    assert!(ctx.trigger_visible());

    ctx.detector_ready(Arc::new(PersonDetector));
    assert!(ctx.trigger_visible());
    assert_eq!(ctx.enable_camera().await.unwrap(), EnableOutcome::Enabled);
    assert!(!ctx.trigger_visible());

    let surface = Arc::clone(ctx.surface().unwrap());
    wait_for_frames(&surface, 1).await;

    let composite = surface.snapshot().await;
    assert_eq!(composite[(10, 5)], BOX_COLOR);
    assert_eq!(composite[(11, 6)], BOX_COLOR);
    assert_eq!(composite[(12, 7)], Rgb([40, 40, 40]));
    assert_eq!(surface.last_detections().await.len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn http_record_and_download() {
    let ctx = context(webm_recorder());
    let addr = serve(Arc::clone(&ctx)).await;
    let client = reqwest::Client::new();
    let url = |path: &str| format!("http://{addr}{path}");

    let healthy = client.get(url("/healthcheck")).send().await.unwrap();
    assert_eq!(healthy.text().await.unwrap(), "healthy");

    // Detector not loaded yet
    let resp = client.post(url("/camera/enable")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "\"ignored\"");
    let status: serde_json::Value = serde_json::from_str(
        &client
            .get(url("/status"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(status["detector_ready"], false);
    assert_eq!(status["trigger_visible"], true);
    let resp = client.post(url("/recording/start")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    ctx.detector_ready(Arc::new(PersonDetector));

    let resp = client.post(url("/camera/enable")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "\"enabled\"");
    let resp = client.post(url("/camera/enable")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "\"already_active\"");

    let status: serde_json::Value = serde_json::from_str(
        &client
            .post(url("/recording/start"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(status["recorder"], "recording");
    assert_eq!(status["chunks"], 0);

    let surface = Arc::clone(ctx.surface().unwrap());
    wait_for_frames(&surface, 2).await;

    let resp = client.get(url("/recording/save")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    let status: serde_json::Value = serde_json::from_str(
        &client
            .post(url("/recording/stop"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(status["recorder"], "stopped");
    assert_eq!(status["frame_loop"]["state"], "running");
    assert!(status["chunks"].as_u64().unwrap() >= 2);

    let resp = client.get(url("/recording/save")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_DISPOSITION],
        "attachment; filename=\"recorded_video.webm\""
    );
    assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "video/webm");
    let video = resp.bytes().await.unwrap();
    assert_eq!(&video[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    assert_eq!(video.len(), 4 + status["chunks"].as_u64().unwrap() as usize - 1);

    let detections: Vec<Detection> = serde_json::from_str(
        &client
            .get(url("/detections"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(detections[0].label, "person");

    let mut stream = client.get(url("/stream")).send().await.unwrap();
    assert_eq!(
        stream.headers()[reqwest::header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    let first = stream.chunk().await.unwrap().unwrap();
    assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg"));
    drop(stream);

    ctx.shutdown().await;
    let status: serde_json::Value = serde_json::from_str(
        &client
            .get(url("/status"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(status["frame_loop"]["state"], "stopped");
}
