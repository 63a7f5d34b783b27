use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use crate::{
    backend::FrameReader,
    types::{CaptureError, Frame},
};

/// Pause after a frame was delivered so the capture thread yields.
pub const FRAME_YIELD: Duration = Duration::from_millis(5);
/// Pause after the device returned nothing.
pub const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(50);

/// Frames (or the terminal capture error) produced by a reader thread.
pub type FrameStream = Receiver<Result<Frame, CaptureError>>;

/// Spawns a background thread that continually reads frames from `reader`.
///
/// The channel holds two frames so the capture loop is backpressured when the
/// consumer falls behind. The thread exits when `shutdown` is raised, when the
/// receiver is dropped, or after forwarding a read error.
pub fn spawn_camera_reader<R: FrameReader>(
    reader: R,
    shutdown: Arc<AtomicBool>,
) -> Result<(FrameStream, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded(2);
    let handle = thread::Builder::new()
        .name("camera-capture".into())
        .spawn(move || capture_loop(reader, &tx, &shutdown))
        .context("failed to spawn camera capture thread")?;
    Ok((rx, handle))
}

fn capture_loop<R: FrameReader>(
    mut reader: R,
    tx: &Sender<Result<Frame, CaptureError>>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match reader.read_frame() {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
                thread::sleep(FRAME_YIELD);
            }
            Ok(None) => thread::sleep(EMPTY_READ_BACKOFF),
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        }
    }
    debug!("camera capture thread exiting");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;

    use super::*;
    use crate::{source::CaptureSettings, types::FrameFormat};

    struct Scripted(VecDeque<Result<Option<Frame>, CaptureError>>);

    impl FrameReader for Scripted {
        fn configure(&mut self, _settings: &CaptureSettings) {}

        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn frame(ts: i64) -> Frame {
        Frame {
            data: vec![0; 3],
            width: 1,
            height: 1,
            timestamp_ms: ts,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn forwards_frames_then_terminal_error() {
        let script = VecDeque::from(vec![
            Ok(Some(frame(1))),
            Ok(None),
            Ok(Some(frame(2))),
            Err(CaptureError::Other(anyhow!("device unplugged"))),
        ]);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_camera_reader(Scripted(script), shutdown).unwrap();

        let first = rx.recv().unwrap().unwrap();
        let second = rx.recv().unwrap().unwrap();
        assert_eq!((first.timestamp_ms, second.timestamp_ms), (1, 2));

        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "device unplugged");

        handle.join().unwrap();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn shutdown_stops_an_idle_reader() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (rx, handle) =
            spawn_camera_reader(Scripted(VecDeque::new()), shutdown.clone()).unwrap();
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(rx.recv().is_err());
    }
}
