//! Capture source descriptors and settings.

use std::fmt;

/// Default capture geometry used by the robot camera.
pub const DEFAULT_WIDTH: i32 = 640;
pub const DEFAULT_HEIGHT: i32 = 480;
pub const DEFAULT_FPS: i32 = 30;

/// Requested capture geometry and rate. Applied best-effort by backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureSource {
    /// Local camera by zero-based index, opened with the library's default API.
    Device { index: i32 },
    /// GStreamer pipeline description terminated by an `appsink`.
    Pipeline { description: String },
    /// File path or network URI.
    Uri { uri: String },
    /// CSI camera through GStreamer at `settings`, falling back to the indexed device.
    Auto {
        index: i32,
        settings: CaptureSettings,
    },
}

impl CaptureSource {
    /// Default device used by the startup check.
    pub const fn default_device() -> Self {
        CaptureSource::Device { index: 0 }
    }

    /// CSI camera first, then device 0, both negotiated at `settings`.
    pub const fn auto(settings: CaptureSettings) -> Self {
        CaptureSource::Auto { index: 0, settings }
    }

    /// Interpret a user-supplied source string.
    pub fn parse(raw: &str, settings: &CaptureSettings) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "" | "auto" => return CaptureSource::auto(*settings),
            "csi" => {
                return CaptureSource::Pipeline {
                    description: csi_pipeline(settings),
                };
            }
            _ => {}
        }
        if let Some(index) = parse_device_index(trimmed) {
            return CaptureSource::Device { index };
        }
        if trimmed.contains(" ! ") {
            return CaptureSource::Pipeline {
                description: trimmed.to_string(),
            };
        }
        CaptureSource::Uri {
            uri: trimmed.to_string(),
        }
    }

    /// Short identifier used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            CaptureSource::Device { index } => format!("/dev/video{index}"),
            CaptureSource::Pipeline { description } => format!("gstreamer:{description}"),
            CaptureSource::Uri { uri } => uri.clone(),
            CaptureSource::Auto { index, .. } => format!("auto(csi, /dev/video{index})"),
        }
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// GStreamer pipeline for the Raspberry Pi CSI camera via libcamera.
pub fn csi_pipeline(settings: &CaptureSettings) -> String {
    format!(
        "libcamerasrc ! video/x-raw, width={}, height={}, framerate={}/1 ! videoconvert ! appsink",
        settings.width, settings.height, settings.fps
    )
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return (index >= 0).then_some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}
