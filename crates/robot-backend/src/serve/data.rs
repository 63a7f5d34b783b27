use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use serde::Serialize;
use video_ingest::FrameManager;

/// Encoded preview frame published to HTTP clients.
#[derive(Clone, Debug)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

pub(crate) type SharedFrame = FrameManager<FramePacket>;

/// Service-wide state that outlives individual pipeline runs.
pub(crate) struct ServiceStatus {
    camera_open: AtomicBool,
    restarts: AtomicU64,
    started: Instant,
    vision_version: &'static str,
}

impl ServiceStatus {
    pub(crate) fn new(vision_version: &'static str) -> Self {
        Self {
            camera_open: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            started: Instant::now(),
            vision_version,
        }
    }

    pub(crate) fn set_camera_open(&self, open: bool) {
        self.camera_open.store(open, Ordering::SeqCst);
        metrics::gauge!("backend_camera_open").set(if open { 1.0 } else { 0.0 });
    }

    pub(crate) fn camera_open(&self) -> bool {
        self.camera_open.load(Ordering::SeqCst)
    }

    pub(crate) fn record_restart(&self) -> u64 {
        metrics::counter!("backend_pipeline_restarts_total").increment(1);
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self, frames: &SharedFrame) -> StatusResponse {
        let latest_frame = frames.get().map(|packet| LatestFrame {
            frame_number: packet.frame_number,
            timestamp_ms: packet.timestamp_ms,
            fps: packet.fps,
            width: packet.width,
            height: packet.height,
        });
        StatusResponse {
            camera_open: self.camera_open(),
            frames: frames.sequence(),
            restarts: self.restarts(),
            vision_version: self.vision_version,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            latest_frame,
        }
    }
}

pub(crate) type SharedStatus = Arc<ServiceStatus>;

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) camera_open: bool,
    pub(crate) frames: u64,
    pub(crate) restarts: u64,
    pub(crate) vision_version: &'static str,
    pub(crate) uptime_ms: u64,
    pub(crate) latest_frame: Option<LatestFrame>,
}

#[derive(Serialize)]
pub(crate) struct LatestFrame {
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) fps: f32,
    pub(crate) width: i32,
    pub(crate) height: i32,
}
