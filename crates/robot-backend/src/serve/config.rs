//! Configuration parsing for the preview service.
//!
//! Translates `serve` CLI arguments into a validated `ServeConfig` so the
//! pipeline and server never re-check flags.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use video_ingest::{CaptureSettings, CaptureSource, source};

use crate::serve::watchdog::{DEFAULT_STALL_TIMEOUT_MS, DEFAULT_WARMUP_MS, WatchdogTimings};

pub const DEFAULT_JPEG_QUALITY: u8 = 70;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;

#[derive(Clone, Debug)]
/// Canonical configuration shared by capture, encoding and the HTTP server.
pub struct ServeConfig {
    /// Where frames come from.
    pub source: CaptureSource,
    /// Requested capture geometry and rate.
    pub capture: CaptureSettings,
    /// JPEG quality for preview frames.
    pub jpeg_quality: u8,
    /// Address the preview server binds to.
    pub bind: String,
    pub port: u16,
    /// Pause before reopening the camera after a failure or restart.
    pub restart_delay: Duration,
    /// Stall detection applied to each capture pipeline run.
    pub watchdog: WatchdogTimings,
}

impl Default for ServeConfig {
    fn default() -> Self {
        let capture = CaptureSettings::default();
        Self {
            source: CaptureSource::auto(capture),
            capture,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            watchdog: WatchdogTimings::default(),
        }
    }
}

impl ServeConfig {
    /// `host:port` the server listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Default, Args)]
pub struct ServeCliArgs {
    /// Capture source: auto, csi, camera index, /dev/videoN, file/URI or a GStreamer pipeline.
    #[arg(long = "source", value_name = "SOURCE")]
    pub source: Option<String>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Capture frame rate.
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<i32>,
    /// JPEG quality used for preview frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<i32>,
    /// Address the preview server binds to.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<String>,
    /// Port the preview server listens on.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,
    /// Delay before reopening the camera after a failure.
    #[arg(long = "restart-delay-ms", value_name = "MS")]
    pub restart_delay_ms: Option<u64>,
    /// Reopen the camera when capture or encoding stays silent this long.
    #[arg(long = "stall-timeout-ms", value_name = "MS")]
    pub stall_timeout_ms: Option<u64>,
    /// Time allowed for the first frame after the camera opens.
    #[arg(long = "warmup-ms", value_name = "MS")]
    pub warmup_ms: Option<u64>,
}

impl TryFrom<ServeCliArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeCliArgs) -> Result<Self> {
        let width = args.width.unwrap_or(source::DEFAULT_WIDTH);
        let height = args.height.unwrap_or(source::DEFAULT_HEIGHT);
        if width <= 0 || height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let fps = args.fps.unwrap_or(source::DEFAULT_FPS);
        if fps <= 0 {
            bail!("--fps must be a positive integer");
        }

        let jpeg_quality = args.jpeg_quality.unwrap_or(i32::from(DEFAULT_JPEG_QUALITY));
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let port = args.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            bail!("--port must be between 1 and 65535");
        }

        let bind = args.bind.unwrap_or_else(|| DEFAULT_BIND.to_string());
        if bind.trim().is_empty() {
            bail!("--bind must not be empty");
        }

        let stall_timeout_ms = args.stall_timeout_ms.unwrap_or(DEFAULT_STALL_TIMEOUT_MS);
        if stall_timeout_ms == 0 {
            bail!("--stall-timeout-ms must be positive");
        }
        let watchdog = WatchdogTimings {
            stall_timeout: Duration::from_millis(stall_timeout_ms),
            warmup: Duration::from_millis(args.warmup_ms.unwrap_or(DEFAULT_WARMUP_MS)),
        };

        let capture = CaptureSettings { width, height, fps };
        let source = match args.source {
            Some(raw) => CaptureSource::parse(&raw, &capture),
            None => CaptureSource::auto(capture),
        };

        Ok(Self {
            source,
            capture,
            jpeg_quality: jpeg_quality as u8,
            bind,
            port,
            restart_delay: Duration::from_millis(
                args.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS),
            ),
            watchdog,
        })
    }
}
