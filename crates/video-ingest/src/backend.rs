//! Seams between capture consumers and the library that talks to the camera.

use crate::{
    source::{CaptureSettings, CaptureSource},
    types::{CaptureError, Frame},
};

/// An opened camera that yields frames on demand.
///
/// Dropping the reader releases the device.
pub trait FrameReader: Send + 'static {
    /// Apply capture settings. Backends ignore properties the device rejects.
    fn configure(&mut self, settings: &CaptureSettings);

    /// Grab the next frame. `Ok(None)` means the device produced nothing this
    /// time and the caller may retry.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Vision library binding able to open capture sources.
pub trait CameraBackend {
    type Reader: FrameReader;

    /// Version identifier compiled into the linked vision library.
    fn library_version(&self) -> &'static str;

    /// Open `source`. Returns [`CaptureError::Open`] when the library worked but
    /// the device could not be opened, [`CaptureError::Other`] when the library
    /// itself failed.
    fn open(&self, source: &CaptureSource) -> Result<Self::Reader, CaptureError>;
}
