//! Frame rate meter.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    rendered_frames: AtomicU64,
    failed_detections: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            rendered_frames: AtomicU64::new(0),
            failed_detections: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_rendered(&self) {
        self.rendered_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_failed_detection(&self) {
        self.failed_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_captured(&self) -> u64 {
        self.captured_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_rendered(&self) -> u64 {
        self.rendered_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_failed_detections(&self) -> u64 {
        self.failed_detections.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let captured_frames = METER.get_reset_captured();
            let rendered_frames = METER.get_reset_rendered();
            let failed_detections = METER.get_reset_failed_detections();
            let elapsed = start.elapsed().as_secs_f32();
            let fps_captured = captured_frames as f32 / elapsed;
            let fps_rendered = rendered_frames as f32 / elapsed;

            if captured_frames > 0 {
                log::info!("Captured frames per second: {fps_captured:.2}")
            }
            if rendered_frames > 0 {
                log::info!("Rendered frames per second: {fps_rendered:.2}")
            }
            if failed_detections > 0 {
                log::warn!("{failed_detections} detections failed in the last {elapsed:.1}s")
            }
        }
    })
}
