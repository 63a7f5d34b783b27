//! Encoder stage turning captured BGR frames into JPEG preview packets.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use tracing::{debug, error};
use video_ingest::Frame;

use crate::{
    serve::{
        data::{FramePacket, SharedFrame},
        watchdog::{Stage, StageHeartbeats},
    },
    telemetry,
};

const ENCODE_POLL: Duration = Duration::from_millis(100);

/// Frame handed from the capture loop to the encoder.
pub(crate) struct EncodeJob {
    pub(crate) frame: Frame,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

/// Encode a BGR8 frame as JPEG.
pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    if frame.width <= 0 || frame.height <= 0 {
        bail!("cannot encode empty {}x{} frame", frame.width, frame.height);
    }
    if frame.data.len() != frame.expected_len() {
        bail!(
            "unexpected frame buffer size: got {} bytes, expected {}",
            frame.data.len(),
            frame.expected_len()
        );
    }

    let rgb = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(
        frame.width as u32,
        frame.height as u32,
        bgr_to_rgb(&frame.data),
    )
    .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

/// Spawn the dedicated encoder thread.
///
/// Every encoded frame replaces the shared latest packet and counts as an
/// encoder heartbeat.
pub(crate) fn spawn_encode_worker(
    shared: SharedFrame,
    encode_rx: Receiver<EncodeJob>,
    heartbeats: Arc<StageHeartbeats>,
    running: Arc<AtomicBool>,
    jpeg_quality: u8,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("preview-encoding", move || {
        while running.load(Ordering::Relaxed) {
            let job = match encode_rx.recv_timeout(ENCODE_POLL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            match encode_jpeg(&job.frame, jpeg_quality) {
                Ok(jpeg) => {
                    shared.update(FramePacket {
                        jpeg,
                        width: job.frame.width,
                        height: job.frame.height,
                        timestamp_ms: job.frame.timestamp_ms,
                        frame_number: job.frame_number,
                        fps: job.fps,
                    });
                    heartbeats.beat(Stage::Encoder);
                    metrics::histogram!("backend_encoding_seconds")
                        .record(started.elapsed().as_secs_f64());
                }
                Err(err) => {
                    metrics::counter!("backend_encoding_errors_total").increment(1);
                    error!("Failed to encode frame #{}: {err}", job.frame_number);
                }
            }
        }
        debug!("encoder thread exiting");
    })
}
