//! Application context wiring user actions to the camera, frame loop and recorder.
//!
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rusttype::Font;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex, OnceCell},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    frame_loop::{FrameLoop, LoopState},
    nn::Detector,
    overlay::CompositeSurface,
    recorder::{Recorder, RecorderState, Recording},
    sensors::{CameraProvider, MediaConstraints},
    AppError,
};

/// Result of an *enable camera* request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableOutcome {
    /// The detector is still loading, nothing happened.
    Ignored,
    /// A camera stream is already attached.
    AlreadyActive,
    Enabled,
}

/// Snapshot of the application state for the user interface.
#[derive(Clone, Debug, Serialize)]
pub struct AppStatus {
    pub detector_ready: bool,
    pub trigger_visible: bool,
    pub frame_loop: LoopState,
    pub recorder: RecorderState,
    pub chunks: usize,
}

struct CameraSession {
    cancel: CancellationToken,
    handle: Option<JoinHandle<LoopState>>,
    state: watch::Receiver<LoopState>,
}

impl CameraSession {
    /// Whether the stream is still attached.
    fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), LoopState::Idle | LoopState::Running)
    }
}

/// Owns everything the page interacts with.
///
/// The detector is loaded once, the composite surface is created as soon as it is ready. Until
/// then, enabling the camera is ignored and recordings cannot start.
pub struct AppContext {
    config: AppConfig,
    camera: Arc<dyn CameraProvider>,
    font: Option<Arc<Font<'static>>>,
    detector: OnceCell<Arc<dyn Detector>>,
    surface: OnceCell<Arc<CompositeSurface>>,
    trigger_visible: AtomicBool,
    /// Held while a camera is being opened.
    session: Mutex<Option<CameraSession>>,
    /// State of the latest frame loop, readable while the session is locked.
    loop_state: Mutex<Option<watch::Receiver<LoopState>>>,
    recorder: Recorder,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        camera: Box<dyn CameraProvider>,
        font: Option<Font<'static>>,
        recorder: Recorder,
    ) -> Self {
        Self {
            config,
            camera: Arc::from(camera),
            font: font.map(Arc::new),
            detector: OnceCell::new(),
            surface: OnceCell::new(),
            trigger_visible: AtomicBool::new(true),
            session: Mutex::new(None),
            loop_state: Mutex::new(None),
            recorder,
        }
    }

    /// Run the one-time detector load in the background.
    pub fn spawn_detector_load<F, D>(self: &Arc<Self>, load: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<D>> + Send + 'static,
        D: Detector + 'static,
    {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            match load.await {
                Ok(detector) => ctx.detector_ready(Arc::new(detector)),
                Err(err) => log::error!("Failed to load detector: {err:#}"),
            }
        })
    }

    /// Install the loaded detector and create the composite surface.
    pub fn detector_ready(&self, detector: Arc<dyn Detector>) {
        let name = detector.name();
        if self.detector.set(detector).is_err() {
            log::warn!("Detector already loaded, ignoring {name}");
            return;
        }

        let surface =
            CompositeSurface::new(self.config.width, self.config.height, self.font.clone());
        self.surface.set(Arc::new(surface)).ok();
        log::info!("Detector {name} ready");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn detector_is_ready(&self) -> bool {
        self.detector.initialized()
    }

    pub fn trigger_visible(&self) -> bool {
        self.trigger_visible.load(Ordering::SeqCst)
    }

    pub fn surface(&self) -> Option<&Arc<CompositeSurface>> {
        self.surface.get()
    }

    /// Attach the camera and start the frame loop.
    ///
    /// Ignored while the detector loads, the trigger stays visible then. A new stream can be
    /// attached once the previous frame loop has ended.
    pub async fn enable_camera(&self) -> Result<EnableOutcome, AppError> {
        let (Some(detector), Some(surface)) = (self.detector.get(), self.surface.get()) else {
            log::debug!("Camera requested before the detector is ready, ignoring");
            return Ok(EnableOutcome::Ignored);
        };

        let mut session = self.session.lock().await;
        if session.as_ref().map_or(false, CameraSession::is_active) {
            return Ok(EnableOutcome::AlreadyActive);
        }

        self.trigger_visible.store(false, Ordering::SeqCst);

        let camera = Arc::clone(&self.camera);
        let opened = tokio::task::spawn_blocking(move || {
            camera.open(&MediaConstraints::video_only())
        })
        .await
        .map_err(|err| AppError::Internal(err.into()))?;

        let source = match opened {
            Ok(source) => source,
            Err(err) => {
                self.trigger_visible.store(true, Ordering::SeqCst);
                return Err(AppError::Camera(err));
            }
        };

        let frame_loop = FrameLoop::new(
            source,
            Arc::clone(detector),
            Arc::clone(surface),
            self.config.refresh_period(),
        );
        let state = frame_loop.state();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(frame_loop.run(cancel.clone()));

        *self.loop_state.lock().await = Some(state.clone());
        *session = Some(CameraSession {
            cancel,
            handle: Some(handle),
            state,
        });
        log::info!("Camera enabled");

        Ok(EnableOutcome::Enabled)
    }

    pub async fn start_recording(&self) -> Result<(), AppError> {
        let surface = self.surface.get().ok_or(AppError::NoSurface)?;
        self.recorder
            .start(surface.capture_stream(), surface.dimensions().await)
            .await
    }

    pub async fn stop_recording(&self) -> Result<usize, AppError> {
        self.recorder.stop().await
    }

    pub async fn save_recording(&self) -> Result<Recording, AppError> {
        self.recorder.save().await
    }

    pub async fn status(&self) -> AppStatus {
        let frame_loop = match &*self.loop_state.lock().await {
            Some(state) => state.borrow().clone(),
            None => LoopState::Idle,
        };

        AppStatus {
            detector_ready: self.detector_is_ready(),
            trigger_visible: self.trigger_visible(),
            frame_loop,
            recorder: self.recorder.state().await,
            chunks: self.recorder.chunk_count().await,
        }
    }

    /// Stop the frame loop and any recording, releasing the camera.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.as_mut() {
            session.cancel.cancel();
            if let Some(handle) = session.handle.take() {
                match handle.await {
                    Ok(state) => log::info!("Camera released, frame loop {state:?}"),
                    Err(err) => log::error!("Frame loop task failed: {err}"),
                }
            }
        }

        if self.recorder.state().await == RecorderState::Recording {
            if let Err(err) = self.recorder.stop().await {
                log::warn!("Failed to stop recording: {err}");
            }
        }
    }
}
