//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    http::header,
    response::{Html, IntoResponse},
    routing::{get, post},
    Extension, Json, Router,
};
use common::Detection;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    as_jpeg_stream_item,
    controller::{AppContext, AppStatus, EnableOutcome},
    recorder::encode_jpeg,
    AppError,
};

/// Build the router serving the page and its actions.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/detections", get(detections))
        .route("/stream", get(composite_stream))
        .route("/camera/enable", post(enable_camera))
        .route("/recording/start", post(start_recording))
        .route("/recording/stop", post(stop_recording))
        .route("/recording/save", get(save_recording))
        .layer(Extension(ctx))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

pub async fn status(Extension(ctx): Extension<Arc<AppContext>>) -> Json<AppStatus> {
    Json(ctx.status().await)
}

/// Detections of the last frame loop cycle, including those below the render threshold.
pub async fn detections(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<Json<Vec<Detection>>, AppError> {
    let surface = ctx.surface().ok_or(AppError::NoSurface)?;
    Ok(Json(surface.last_detections().await))
}

pub async fn enable_camera(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<Json<EnableOutcome>, AppError> {
    Ok(Json(ctx.enable_camera().await?))
}

pub async fn start_recording(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<Json<AppStatus>, AppError> {
    ctx.start_recording().await?;
    Ok(Json(ctx.status().await))
}

pub async fn stop_recording(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<Json<AppStatus>, AppError> {
    ctx.stop_recording().await?;
    Ok(Json(ctx.status().await))
}

/// Download the last recording as an attachment.
pub async fn save_recording(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<impl IntoResponse, AppError> {
    let recording = ctx.save_recording().await?;
    let headers = [
        (header::CONTENT_TYPE, recording.content_type.to_owned()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", recording.file_name),
        ),
    ];

    Ok((headers, recording.data))
}

/// Composite frames as a multipart JPEG stream.
pub async fn composite_stream(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Result<impl IntoResponse, AppError> {
    let surface = ctx.surface().ok_or(AppError::NoSurface)?;
    let quality = ctx.config().jpeg_quality;
    log::info!("Composite stream requested");

    let stream = BroadcastStream::new(surface.capture_stream()).filter_map(move |res| async move {
        match res {
            Ok(frame) => match encode_jpeg(&frame, quality) {
                Ok(jpeg) => Some(Ok::<_, std::io::Error>(as_jpeg_stream_item(&jpeg))),
                Err(err) => {
                    log::warn!("Skipping frame of composite stream: {err}");
                    None
                }
            },
            Err(lagged) => {
                log::debug!("Composite stream {lagged}");
                None
            }
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    Ok((headers, body))
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Live object detection</title>
  <style>
    body { font-family: sans-serif; margin: 2em; }
    .removed { display: none; }
    #liveView img { width: 640px; height: 480px; background: #222; }
  </style>
</head>
<body>
  <h3>Live object detection</h3>
  <p id="message">Loading model...</p>
  <button id="webcamButton">Enable Webcam</button>
  <div id="liveView"><img id="composite" alt=""></div>
  <button id="startButton">Start Recording</button>
  <button id="stopButton">Stop Recording</button>
  <button id="saveButton">Save Recording</button>
  <script>
    const message = document.getElementById('message');
    const webcamButton = document.getElementById('webcamButton');
    const composite = document.getElementById('composite');

    async function call(method, path) {
      const resp = await fetch(path, { method });
      const text = await resp.text();
      message.textContent = resp.ok ? '' : text;
      return resp.ok ? JSON.parse(text) : null;
    }

    async function refresh() {
      const resp = await fetch('/status');
      if (!resp.ok) return;
      const status = await resp.json();
      const cameraEnded = status.frame_loop.state === 'failed';
      webcamButton.classList.toggle('removed', !(status.trigger_visible || cameraEnded));
      if (!status.detector_ready) message.textContent = 'Loading model...';
      else if (message.textContent === 'Loading model...') message.textContent = '';
      if (cameraEnded) message.textContent = 'Camera stream ended: ' + status.frame_loop.reason;
    }

    webcamButton.addEventListener('click', async () => {
      const outcome = await call('POST', '/camera/enable');
      if (outcome === 'enabled' || outcome === 'already_active') {
        composite.src = '/stream';
      }
      refresh();
    });
    document.getElementById('startButton').addEventListener('click', async () => {
      if (await call('POST', '/recording/start')) message.textContent = 'Recording...';
    });
    document.getElementById('stopButton').addEventListener('click', async () => {
      const status = await call('POST', '/recording/stop');
      if (status) message.textContent = 'Recorded ' + status.chunks + ' frames';
    });
    document.getElementById('saveButton').addEventListener('click', async () => {
      const resp = await fetch('/recording/save');
      if (!resp.ok) {
        message.textContent = await resp.text();
        return;
      }
      const disposition = resp.headers.get('Content-Disposition') || '';
      const match = disposition.match(/filename="([^"]+)"/);
      const url = URL.createObjectURL(await resp.blob());
      const a = document.createElement('a');
      a.style.display = 'none';
      a.href = url;
      a.download = match ? match[1] : 'recorded_video';
      document.body.appendChild(a);
      a.click();
      a.remove();
      URL.revokeObjectURL(url);
    });

    setInterval(refresh, 500);
    refresh();
  </script>
</body>
</html>
"#;
