//! One-shot startup check executed when the backend runs without a subcommand.
//!
//! The sequence prints a banner and the linked vision library version, probes
//! the default camera, declares the core initialised and passes once through
//! the (still empty) frame loop. A camera that fails to open is reported and
//! ignored; any other error or panic inside the guarded region aborts the run.

use std::{
    any::Any,
    io::Write,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    sync::Arc,
    thread::{self, ThreadId},
};

use anyhow::{Result, anyhow};
use tracing::debug;
use video_ingest::{CameraBackend, CaptureSource, Frame};

pub const STARTUP_BANNER: &str = "[INFO] Starting PENS-KAIT 2026 Rust Backend...";
pub const READY_BANNER: &str = "[INFO] Backend Core Initialized. Waiting for tasks...";
pub const CAMERA_OPEN_ERROR: &str = "[ERROR] Could not open camera";

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Second banner line, carrying the vision library's compiled-in version.
pub fn version_line(version: &str) -> String {
    format!("[INFO] OpenCV Version: {version}")
}

/// What the sequence observed. Only used by callers that care; the process
/// exit status does not depend on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartupReport {
    pub camera_open: bool,
    pub loop_passes: u32,
}

pub struct StartupSequencer<B> {
    backend: B,
    source: CaptureSource,
}

impl<B: CameraBackend> StartupSequencer<B> {
    /// Sequencer probing the default camera (index 0).
    pub fn new(backend: B) -> Self {
        Self::with_source(backend, CaptureSource::default_device())
    }

    pub fn with_source(backend: B, source: CaptureSource) -> Self {
        Self { backend, source }
    }

    pub fn source(&self) -> &CaptureSource {
        &self.source
    }

    /// Run the sequence, writing banners to `out` and diagnostics to `err`.
    ///
    /// Returns `Err` for fatal faults, including panics raised while the camera
    /// is being acquired.
    pub fn run<O: Write, E: Write>(&self, out: &mut O, err: &mut E) -> Result<StartupReport> {
        writeln!(out, "{STARTUP_BANNER}")?;
        writeln!(out, "{}", version_line(self.backend.library_version()))?;

        let outcome = {
            let _quiet = QuietPanics::install();
            panic::catch_unwind(AssertUnwindSafe(|| self.guarded(out, err)))
        };
        let report = match outcome {
            Ok(result) => result?,
            Err(payload) => return Err(anyhow!(panic_message(payload.as_ref()))),
        };

        out.flush()?;
        Ok(report)
    }

    fn guarded<O: Write, E: Write>(&self, out: &mut O, err: &mut E) -> Result<StartupReport> {
        // Serial/I2C bring-up and model loading slot in ahead of the camera.
        let camera = match self.backend.open(&self.source) {
            Ok(reader) => Some(reader),
            Err(open_err) if open_err.is_recoverable() => {
                debug!("camera probe on {} failed: {open_err}", self.source);
                writeln!(err, "{CAMERA_OPEN_ERROR}")?;
                err.flush()?;
                None
            }
            Err(fatal) => return Err(fatal.into()),
        };

        writeln!(out, "{READY_BANNER}")?;

        let _frame: Option<Frame> = None;
        let mut loop_passes = 0;
        #[allow(clippy::never_loop)]
        loop {
            loop_passes += 1;
            // Frame grab, inference and broadcast will run here. Single pass
            // until they exist.
            break;
        }

        Ok(StartupReport {
            camera_open: camera.is_some(),
            loop_passes,
        })
    }
}

/// Map a command outcome to the process exit status, reporting failures on `err`.
pub fn report_outcome<T, E: Write>(result: &Result<T>, err: &mut E) -> i32 {
    match result {
        Ok(_) => EXIT_SUCCESS,
        Err(error) => {
            let _ = writeln!(err, "[ERROR] Exception: {error:#}");
            let _ = err.flush();
            EXIT_FAILURE
        }
    }
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Keeps the panic hook from printing for the installing thread while alive.
///
/// A panic in the guarded region is reported as a single exception line, so
/// the hook's own message and backtrace note must not reach stderr. Panics on
/// other threads still go to the previous hook.
struct QuietPanics {
    previous: Option<Arc<PanicHook>>,
}

impl QuietPanics {
    fn install() -> Self {
        let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
        let owner: ThreadId = thread::current().id();
        let fallback = Arc::clone(&previous);
        panic::set_hook(Box::new(move |info| {
            if thread::current().id() != owner {
                (**fallback)(info);
            }
        }));
        Self {
            previous: Some(previous),
        }
    }
}

impl Drop for QuietPanics {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        // Dropping the quiet hook releases its handle on `previous`.
        drop(panic::take_hook());
        match Arc::try_unwrap(previous) {
            Ok(hook) => panic::set_hook(hook),
            Err(shared) => panic::set_hook(Box::new(move |info| (**shared)(info))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
