//! Pipeline supervisor tying together capture, encoding and the preview server.
//!
//! The preview server starts once and stays up while the camera comes and
//! goes. The capture pipeline is reopened whenever the camera is missing, a
//! read fails, or the watchdog sees a stage stall.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{RecvTimeoutError, TrySendError};
use tracing::{debug, error, info, warn};
use video_ingest::{CameraBackend, CaptureError, FrameReader, spawn_camera_reader};

use crate::{
    serve::{
        ServeConfig,
        data::{ServiceStatus, SharedFrame, SharedStatus},
        encoding::{EncodeJob, spawn_encode_worker},
        server::{ServerState, spawn_preview_server},
        watchdog::{Stage, StageHeartbeats, StallReport, spawn_watchdog},
    },
    startup::{STARTUP_BANNER, version_line},
    telemetry,
};

const FRAME_RECV_TIMEOUT: Duration = Duration::from_millis(100);
const ENCODE_QUEUE_DEPTH: usize = 3;
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Run the preview service until Ctrl+C.
pub fn run<B: CameraBackend>(backend: B, config: ServeConfig) -> Result<()> {
    println!("{STARTUP_BANNER}");
    println!("{}", version_line(backend.library_version()));

    let shutdown = install_shutdown_handler();
    if telemetry::init_metrics_recorder().is_none() {
        warn!("Prometheus endpoint disabled");
    }

    let frames = SharedFrame::new();
    let status: SharedStatus = Arc::new(ServiceStatus::new(backend.library_version()));
    let addr = config.listen_addr();
    let server = spawn_preview_server(
        &addr,
        ServerState {
            frames: frames.clone(),
            status: status.clone(),
        },
    )
    .context("Failed to start preview server")?;
    println!("[INFO] Listening on http://{addr}");

    let result = supervise(&backend, &config, &frames, &status, &shutdown);

    info!("Stopping preview service");
    server.stop();
    result
}

fn install_shutdown_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

/// Result of a single pipeline run attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Keep a capture pipeline running until `shutdown` is raised.
pub(crate) fn supervise<B: CameraBackend>(
    backend: &B,
    config: &ServeConfig,
    frames: &SharedFrame,
    status: &ServiceStatus,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let mut attempt: u32 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        match run_pipeline_once(backend, config, frames, status, shutdown) {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                let restarts = status.record_restart();
                warn!("Pipeline restart requested (reason: {reason}), attempt #{attempt}, {restarts} total");
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                match err.downcast_ref::<CaptureError>() {
                    Some(capture) if capture.is_recoverable() => {
                        warn!("Camera unavailable ({capture}), retrying (attempt #{attempt})");
                    }
                    _ => error!("Capture pipeline error: {err:?}"),
                }
            }
        }
        status.set_camera_open(false);
        frames.clear();
        sleep_unless_shutdown(config.restart_delay, shutdown);
    }
    Ok(())
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

/// Execute the pipeline once, returning whether to exit or restart.
fn run_pipeline_once<B: CameraBackend>(
    backend: &B,
    config: &ServeConfig,
    frames: &SharedFrame,
    status: &ServiceStatus,
    shutdown: &Arc<AtomicBool>,
) -> Result<PipelineOutcome> {
    if shutdown.load(Ordering::SeqCst) {
        return Ok(PipelineOutcome::Graceful);
    }

    let mut reader = backend.open(&config.source)?;
    reader.configure(&config.capture);
    status.set_camera_open(true);
    info!(
        "Capturing from {} at {}x{} @ {} fps",
        config.source, config.capture.width, config.capture.height, config.capture.fps
    );

    let pipeline_running = Arc::new(AtomicBool::new(true));
    let capture_stop = Arc::new(AtomicBool::new(false));
    let heartbeats = Arc::new(StageHeartbeats::new(config.watchdog));
    let stall_report = Arc::new(StallReport::new());

    let (frame_rx, capture_handle) = spawn_camera_reader(reader, capture_stop.clone())?;
    let (encode_tx, encode_rx) = crossbeam_channel::bounded::<EncodeJob>(ENCODE_QUEUE_DEPTH);
    let encode_handle = spawn_encode_worker(
        frames.clone(),
        encode_rx,
        heartbeats.clone(),
        pipeline_running.clone(),
        config.jpeg_quality,
    )
    .context("Failed to spawn encoder thread")?;
    let watchdog_handle = spawn_watchdog(
        heartbeats.clone(),
        config.watchdog,
        pipeline_running.clone(),
        shutdown.clone(),
        stall_report.clone(),
    )
    .context("Failed to spawn watchdog thread")?;

    let mut frame_number: u64 = 0;
    let mut smoothed_fps: f32 = 0.0;
    let mut last_instant = Instant::now();
    let mut dropped_frames: u64 = 0;
    let mut restart_reason: Option<&'static str> = None;

    while pipeline_running.load(Ordering::Relaxed) {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match frame_rx.recv_timeout(FRAME_RECV_TIMEOUT) {
            Ok(Ok(frame)) => {
                heartbeats.beat(Stage::Capture);
                frame_number = frame_number.wrapping_add(1);
                metrics::counter!("backend_capture_frames_total").increment(1);

                let now = Instant::now();
                let elapsed = now.duration_since(last_instant).as_secs_f32();
                last_instant = now;
                if elapsed > 0.0 {
                    smoothed_fps = smooth_fps(smoothed_fps, 1.0 / elapsed);
                }
                metrics::gauge!("backend_capture_fps").set(smoothed_fps as f64);

                if frame_number % 30 == 0 {
                    debug!(
                        "Capture heartbeat: frame #{}, {:.1} fps, ts={}",
                        frame_number, smoothed_fps, frame.timestamp_ms
                    );
                }

                match encode_tx.try_send(EncodeJob {
                    frame,
                    frame_number,
                    fps: smoothed_fps,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped_frames = dropped_frames.wrapping_add(1);
                        metrics::counter!("backend_capture_dropped_frames_total").increment(1);
                        debug!("Dropping frame #{frame_number} (encoder backlog, dropped total: {dropped_frames})");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        error!("Encoder thread terminated unexpectedly");
                        restart_reason = Some("encoder channel disconnected");
                        break;
                    }
                }
            }
            Ok(Err(err)) => {
                error!("Capture error: {err}");
                restart_reason = Some("capture error");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                error!("Frame channel closed");
                restart_reason = Some("capture channel closed");
                break;
            }
        }
    }

    debug!("Stopping capture pipeline");
    pipeline_running.store(false, Ordering::SeqCst);
    capture_stop.store(true, Ordering::SeqCst);
    drop(frame_rx);
    drop(encode_tx);
    let _ = encode_handle.join();
    let _ = watchdog_handle.join();
    join_capture_thread(capture_handle);
    status.set_camera_open(false);

    if let Some(stage) = stall_report.get() {
        return Ok(PipelineOutcome::Restart(stage.label()));
    }

    if let Some(reason) = restart_reason {
        return Ok(PipelineOutcome::Restart(reason));
    }

    Ok(PipelineOutcome::Graceful)
}

/// Exponential moving average weighted towards the history.
fn smooth_fps(previous: f32, instant: f32) -> f32 {
    if previous == 0.0 {
        instant
    } else {
        0.9 * previous + 0.1 * instant
    }
}

/// A driver stuck inside a read can hold the capture thread forever; give it a
/// moment, then detach.
fn join_capture_thread(handle: thread::JoinHandle<()>) {
    let deadline = Instant::now() + CAPTURE_JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Capture thread did not exit in time; detaching it");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::AtomicU32};

    use anyhow::anyhow;
    use video_ingest::{CaptureSettings, CaptureSource, Frame, FrameFormat};

    use super::*;
    use crate::serve::WatchdogTimings;

    /// Reader producing solid frames, failing after `fail_after` reads or going
    /// quiet after `silent_after` reads if set.
    struct SyntheticReader {
        settings: CaptureSettings,
        reads: usize,
        fail_after: Option<usize>,
        silent_after: Option<usize>,
    }

    impl FrameReader for SyntheticReader {
        fn configure(&mut self, settings: &CaptureSettings) {
            self.settings = *settings;
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.reads += 1;
            if self.fail_after.is_some_and(|limit| self.reads > limit) {
                return Err(CaptureError::Other(anyhow!("sensor timeout")));
            }
            if self.silent_after.is_some_and(|limit| self.reads > limit) {
                return Ok(None);
            }
            let CaptureSettings { width, height, .. } = self.settings;
            Ok(Some(Frame {
                data: vec![40; (width * height * 3) as usize],
                width,
                height,
                timestamp_ms: self.reads as i64,
                format: FrameFormat::Bgr8,
            }))
        }
    }

    struct SyntheticBackend {
        opens: AtomicU32,
        missing_until: u32,
        fail_after: Option<usize>,
        silent_after: Option<usize>,
        sources: Mutex<Vec<CaptureSource>>,
    }

    impl SyntheticBackend {
        fn new(missing_until: u32, fail_after: Option<usize>) -> Self {
            Self {
                opens: AtomicU32::new(0),
                missing_until,
                fail_after,
                silent_after: None,
                sources: Mutex::new(Vec::new()),
            }
        }

        fn going_silent_after(reads: usize) -> Self {
            Self {
                silent_after: Some(reads),
                ..Self::new(0, None)
            }
        }
    }

    impl CameraBackend for SyntheticBackend {
        type Reader = SyntheticReader;

        fn library_version(&self) -> &'static str {
            "synthetic-1.0"
        }

        fn open(&self, source: &CaptureSource) -> Result<SyntheticReader, CaptureError> {
            self.sources.lock().unwrap().push(source.clone());
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.missing_until {
                return Err(CaptureError::Open {
                    uri: source.describe(),
                });
            }
            Ok(SyntheticReader {
                settings: CaptureSettings::default(),
                reads: 0,
                fail_after: self.fail_after,
                silent_after: self.silent_after,
            })
        }
    }

    fn test_config() -> ServeConfig {
        ServeConfig {
            source: CaptureSource::Device { index: 0 },
            capture: CaptureSettings {
                width: 8,
                height: 6,
                fps: 30,
            },
            restart_delay: Duration::from_millis(20),
            ..ServeConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn fps_smoothing_starts_from_first_sample() {
        assert_eq!(smooth_fps(0.0, 30.0), 30.0);
        assert!((smooth_fps(30.0, 20.0) - 29.0).abs() < 1e-4);
    }

    #[test]
    fn publishes_encoded_frames_until_shutdown() {
        let backend = Arc::new(SyntheticBackend::new(0, None));
        let frames = SharedFrame::new();
        let status = Arc::new(ServiceStatus::new("synthetic-1.0"));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let (backend, frames, status, shutdown) =
                (backend.clone(), frames.clone(), status.clone(), shutdown.clone());
            thread::spawn(move || supervise(&*backend, &test_config(), &frames, &status, &shutdown))
        };

        assert!(wait_until(Duration::from_secs(5), || frames.get().is_some()));
        assert!(status.camera_open());
        let packet = frames.get().unwrap();
        assert_eq!((packet.width, packet.height), (8, 6));
        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);

        shutdown.store(true, Ordering::SeqCst);
        worker.join().unwrap().unwrap();
        assert!(!status.camera_open());
        assert_eq!(status.restarts(), 0);
        assert_eq!(
            backend.sources.lock().unwrap().first(),
            Some(&CaptureSource::Device { index: 0 })
        );
    }

    #[test]
    fn missing_camera_is_retried() {
        let backend = Arc::new(SyntheticBackend::new(2, None));
        let frames = SharedFrame::new();
        let status = Arc::new(ServiceStatus::new("synthetic-1.0"));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let (backend, frames, status, shutdown) =
                (backend.clone(), frames.clone(), status.clone(), shutdown.clone());
            thread::spawn(move || supervise(&*backend, &test_config(), &frames, &status, &shutdown))
        };

        assert!(wait_until(Duration::from_secs(5), || frames.get().is_some()));
        assert!(backend.opens.load(Ordering::SeqCst) >= 3);

        shutdown.store(true, Ordering::SeqCst);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn read_errors_restart_the_pipeline() {
        let backend = Arc::new(SyntheticBackend::new(0, Some(3)));
        let frames = SharedFrame::new();
        let status = Arc::new(ServiceStatus::new("synthetic-1.0"));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let (backend, frames, status, shutdown) =
                (backend.clone(), frames.clone(), status.clone(), shutdown.clone());
            thread::spawn(move || supervise(&*backend, &test_config(), &frames, &status, &shutdown))
        };

        assert!(wait_until(Duration::from_secs(5), || status.restarts() >= 2));
        assert!(backend.opens.load(Ordering::SeqCst) >= 2);

        shutdown.store(true, Ordering::SeqCst);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn silent_camera_is_reopened_after_the_stall_timeout() {
        let backend = Arc::new(SyntheticBackend::going_silent_after(5));
        let frames = SharedFrame::new();
        let status = Arc::new(ServiceStatus::new("synthetic-1.0"));
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = ServeConfig {
            watchdog: WatchdogTimings {
                stall_timeout: Duration::from_millis(150),
                warmup: Duration::ZERO,
            },
            ..test_config()
        };

        let worker = {
            let (backend, frames, status, shutdown) =
                (backend.clone(), frames.clone(), status.clone(), shutdown.clone());
            thread::spawn(move || supervise(&*backend, &config, &frames, &status, &shutdown))
        };

        assert!(wait_until(Duration::from_secs(5), || status.restarts() >= 1));
        assert!(wait_until(Duration::from_secs(5), || {
            backend.opens.load(Ordering::SeqCst) >= 2
        }));

        shutdown.store(true, Ordering::SeqCst);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn raised_shutdown_skips_the_camera() {
        let backend = SyntheticBackend::new(0, None);
        let shutdown = Arc::new(AtomicBool::new(true));
        supervise(
            &backend,
            &test_config(),
            &SharedFrame::new(),
            &ServiceStatus::new("synthetic-1.0"),
            &shutdown,
        )
        .unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 0);
    }
}
