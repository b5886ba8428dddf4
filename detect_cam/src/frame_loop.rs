//! Per-frame capture, detection and rendering cycle.
//!
use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    meter::METER,
    nn::Detector,
    overlay::{CompositeSurface, Overlay},
    sensors::CaptureSource,
};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the first frame.
    Idle,
    Running,
    /// Cancelled.
    Stopped,
    /// The capture source ended.
    Failed(String),
}

#[derive(Debug)]
pub enum CycleOutcome {
    Rendered(Vec<Overlay>),
    /// Detection failed, the surface keeps the previous frame.
    DetectionFailed,
}

/// Drives capture, detection and rendering, one frame at a time.
///
/// Only one detection is in flight: the next cycle starts on the first refresh tick after the
/// previous one has been painted, so the effective frame rate is bounded by inference latency.
pub struct FrameLoop {
    source: Option<Box<dyn CaptureSource>>,
    detector: Arc<dyn Detector>,
    surface: Arc<CompositeSurface>,
    refresh_period: Duration,
    state_tx: watch::Sender<LoopState>,
}

impl FrameLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        detector: Arc<dyn Detector>,
        surface: Arc<CompositeSurface>,
        refresh_period: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            source: Some(source),
            detector,
            surface,
            refresh_period,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Run one cycle: capture, detect, paint.
    ///
    /// Errors only when no frame could be captured.
    pub async fn cycle(&mut self) -> Result<CycleOutcome> {
        let (width, height) = self.surface.dimensions().await;
        let frame = self.capture(width, height).await?;
        METER.tick_captured();

        if *self.state_tx.borrow() == LoopState::Idle {
            log::info!("First frame available, frame loop running");
            self.state_tx.send_replace(LoopState::Running);
        }

        let detector = Arc::clone(&self.detector);
        let (frame, detections) = tokio::task::spawn_blocking(move || {
            let detections = detector.detect(&frame);
            (frame, detections)
        })
        .await?;

        match detections {
            Ok(detections) => {
                log::debug!("{} detections", detections.len());
                let overlays = self.surface.paint(&frame, detections).await;
                METER.tick_rendered();
                Ok(CycleOutcome::Rendered(overlays))
            }
            Err(err) => {
                log::warn!("Detection with {} failed: {err:#}", self.detector.name());
                METER.tick_failed_detection();
                Ok(CycleOutcome::DetectionFailed)
            }
        }
    }

    /// Capture the next frame, stretched to `width` x `height`.
    async fn capture(&mut self, width: u32, height: u32) -> Result<RgbImage> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("capture source lost"))?;

        let (source, frame) = tokio::task::spawn_blocking(move || {
            let frame = source.capture().map(|frame| stretch(frame, width, height));
            (source, frame)
        })
        .await
        .context("capture task panicked")?;

        self.source = Some(source);
        frame
    }

    /// Run cycles on every refresh tick until cancelled or the capture source ends.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopState {
        let mut refresh = interval(self.refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let final_state = loop {
            tokio::select! {
                _ = cancel.cancelled() => break LoopState::Stopped,
                _ = refresh.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break LoopState::Stopped,
                res = self.cycle() => {
                    if let Err(err) = res {
                        log::error!("Frame loop failed: {err:#}");
                        break LoopState::Failed(format!("{err:#}"));
                    }
                }
            }
        };

        log::info!("Frame loop ended: {final_state:?}");
        self.state_tx.send_replace(final_state.clone());

        final_state
    }
}

fn stretch(frame: RgbImage, width: u32, height: u32) -> RgbImage {
    if frame.dimensions() == (width, height) {
        return frame;
    }

    image::imageops::resize(
        &frame,
        width,
        height,
        image::imageops::FilterType::Triangle,
    )
}

#[cfg(test)]
mod test {

    use std::collections::VecDeque;

    use anyhow::bail;
    use common::{BoundingBox, Detection};
    use image::Rgb;

    use super::*;
    use crate::overlay::BOX_COLOR;

    struct ScriptedCamera {
        frames: VecDeque<RgbImage>,
    }

    impl CaptureSource for ScriptedCamera {
        fn capture(&mut self) -> Result<RgbImage> {
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None => bail!("camera unplugged"),
            }
        }
    }

    struct EndlessCamera;

    impl CaptureSource for EndlessCamera {
        fn capture(&mut self) -> Result<RgbImage> {
            Ok(RgbImage::new(64, 48))
        }
    }

    struct FixedDetector(Vec<Detection>);

    impl Detector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl Detector for BrokenDetector {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>> {
            bail!("out of memory")
        }
    }

    fn frames(count: usize, width: u32, height: u32) -> Box<ScriptedCamera> {
        Box::new(ScriptedCamera {
            frames: (0..count)
                .map(|_| RgbImage::from_pixel(width, height, Rgb([20, 20, 20])))
                .collect(),
        })
    }

    #[tokio::test]
    async fn cycle_paints_detections() {
        let surface = Arc::new(CompositeSurface::new(64, 48, None));
        let detector = Arc::new(FixedDetector(vec![Detection::new(
            "cup",
            0.8,
            BoundingBox::new(4.0, 4.0, 20.0, 20.0),
        )]));
        let mut frame_loop = FrameLoop::new(
            frames(1, 64, 48),
            detector,
            surface.clone(),
            Duration::from_millis(1),
        );
        let state = frame_loop.state();
        assert_eq!(*state.borrow(), LoopState::Idle);

        let outcome = frame_loop.cycle().await.unwrap();

        match outcome {
            CycleOutcome::Rendered(overlays) => assert_eq!(overlays[0].caption, "cup - 80%"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*state.borrow(), LoopState::Running);
        assert_eq!(surface.snapshot().await[(4, 4)], BOX_COLOR);
    }

    #[tokio::test]
    async fn frames_are_stretched_to_surface() {
        let surface = Arc::new(CompositeSurface::new(32, 32, None));
        let mut frame_loop = FrameLoop::new(
            frames(1, 128, 16),
            Arc::new(FixedDetector(vec![])),
            surface.clone(),
            Duration::from_millis(1),
        );

        frame_loop.cycle().await.unwrap();

        let snapshot = surface.snapshot().await;
        assert_eq!(snapshot.dimensions(), (32, 32));
        assert_eq!(snapshot[(16, 16)], Rgb([20, 20, 20]));
    }

    #[tokio::test]
    async fn failed_detection_skips_paint() {
        let surface = Arc::new(CompositeSurface::new(64, 48, None));
        let mut frame_loop = FrameLoop::new(
            frames(1, 64, 48),
            Arc::new(BrokenDetector),
            surface.clone(),
            Duration::from_millis(1),
        );

        let outcome = frame_loop.cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::DetectionFailed));
        assert_eq!(surface.snapshot().await[(0, 0)], Rgb([0, 0, 0]));
    }

    #[tokio::test]
    async fn loop_fails_when_camera_ends() {
        let surface = Arc::new(CompositeSurface::new(64, 48, None));
        let frame_loop = FrameLoop::new(
            frames(3, 64, 48),
            Arc::new(FixedDetector(vec![])),
            surface,
            Duration::from_millis(1),
        );
        let state = frame_loop.state();

        let final_state = frame_loop.run(CancellationToken::new()).await;

        assert_eq!(
            final_state,
            LoopState::Failed("camera unplugged".to_owned())
        );
        assert_eq!(*state.borrow(), final_state);
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let surface = Arc::new(CompositeSurface::new(64, 48, None));
        let mut frames_rx = surface.capture_stream();
        let frame_loop = FrameLoop::new(
            Box::new(EndlessCamera),
            Arc::new(FixedDetector(vec![])),
            surface,
            Duration::from_millis(1),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(frame_loop.run(cancel.clone()));

        // At least one frame went through before stopping
        while frames_rx.recv().await.is_err() {}
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), LoopState::Stopped);
    }
}
