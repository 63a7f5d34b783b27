use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a tightly packed frame of this geometry should carry.
    pub fn expected_len(&self) -> usize {
        let bpp = match self.format {
            FrameFormat::Bgr8 => 3,
        };
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * bpp
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Open failures leave the process usable; everything else came out of the
    /// capture library itself and is treated as fatal by callers.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::Open { .. })
    }
}
