//! Camera acquisition for the robot backend.
//!
//! - `source`: capture source descriptors and settings.
//! - `backend`: traits implemented by vision library bindings.
//! - `camera`: OpenCV implementation (feature `opencv`).
//! - `reader`: background capture thread feeding a bounded channel.
//! - `frame_manager`: latest-value slot shared between threads.

pub mod backend;
#[cfg(feature = "opencv")]
pub mod camera;
pub mod frame_manager;
pub mod reader;
pub mod source;
pub mod types;

pub use backend::{CameraBackend, FrameReader};
#[cfg(feature = "opencv")]
pub use camera::{OpenCvBackend, OpenCvReader};
pub use frame_manager::FrameManager;
pub use reader::{FrameStream, spawn_camera_reader};
pub use source::{CaptureSettings, CaptureSource, csi_pipeline, parse_device_index};
pub use types::{CaptureError, Frame, FrameFormat};
