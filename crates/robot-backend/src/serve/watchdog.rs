//! Stall detection for the capture and encoding stages.
//!
//! Both stages beat on every frame. When either goes quiet for longer than the
//! configured stall timeout, the watchdog lowers the pipeline's running flag
//! and records which stage tripped it so the supervisor can reopen the camera.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::error;

use crate::telemetry;

pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_WARMUP_MS: u64 = 5_000;

const MAX_POLL: Duration = Duration::from_millis(500);
const MIN_POLL: Duration = Duration::from_millis(10);

/// How long stages may stay silent before the camera is reopened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogTimings {
    /// Silence tolerated from a running stage.
    pub stall_timeout: Duration,
    /// Extra time granted after opening, while the sensor settles.
    pub warmup: Duration,
}

impl Default for WatchdogTimings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            warmup: Duration::from_millis(DEFAULT_WARMUP_MS),
        }
    }
}

impl WatchdogTimings {
    /// Three checks per stall window, capped so shutdown stays responsive.
    pub fn poll_interval(&self) -> Duration {
        (self.stall_timeout / 3).clamp(MIN_POLL, MAX_POLL)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Capture,
    Encoder,
}

impl Stage {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Encoder => "encoding",
        }
    }
}

/// Last heartbeat of each stage, in milliseconds since the pipeline opened.
pub(crate) struct StageHeartbeats {
    opened: Instant,
    stall_timeout_ms: u64,
    capture_ms: AtomicU64,
    encoder_ms: AtomicU64,
}

impl StageHeartbeats {
    pub(crate) fn new(timings: WatchdogTimings) -> Self {
        // Stages count as alive until the warmup ends.
        let warmup_ms = millis(timings.warmup);
        Self {
            opened: Instant::now(),
            stall_timeout_ms: millis(timings.stall_timeout),
            capture_ms: AtomicU64::new(warmup_ms),
            encoder_ms: AtomicU64::new(warmup_ms),
        }
    }

    pub(crate) fn beat(&self, stage: Stage) {
        self.beat_at(stage, self.elapsed_ms());
    }

    pub(crate) fn beat_at(&self, stage: Stage, at_ms: u64) {
        self.slot(stage).fetch_max(at_ms, Ordering::Relaxed);
    }

    /// First stage silent for longer than the stall timeout at `now_ms`.
    pub(crate) fn stalled_stage(&self, now_ms: u64) -> Option<Stage> {
        [Stage::Capture, Stage::Encoder].into_iter().find(|stage| {
            let last = self.slot(*stage).load(Ordering::Relaxed);
            now_ms.saturating_sub(last) > self.stall_timeout_ms
        })
    }

    fn elapsed_ms(&self) -> u64 {
        millis(self.opened.elapsed())
    }

    fn slot(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::Capture => &self.capture_ms,
            Stage::Encoder => &self.encoder_ms,
        }
    }
}

/// Stage that tripped the watchdog, set at most once per pipeline run.
pub(crate) type StallReport = OnceLock<Stage>;

/// Spawn the thread that polls `heartbeats` until the pipeline stops.
pub(crate) fn spawn_watchdog(
    heartbeats: Arc<StageHeartbeats>,
    timings: WatchdogTimings,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    report: Arc<StallReport>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let poll = timings.poll_interval();
    telemetry::spawn_thread("preview-watchdog", move || {
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(poll);
            if let Some(stage) = heartbeats.stalled_stage(heartbeats.elapsed_ms()) {
                error!(
                    "{} stage silent for over {:?}; reopening the camera",
                    stage.label(),
                    timings.stall_timeout
                );
                metrics::counter!("backend_watchdog_trips_total", "stage" => stage.label())
                    .increment(1);
                let _ = report.set(stage);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
