//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, Mat, MatTraitConstManual},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    backend::{CameraBackend, FrameReader},
    source::{CaptureSettings, CaptureSource, csi_pipeline},
    types::{CaptureError, Frame, FrameFormat},
};

/// Camera backend built on the OpenCV `videoio` module.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

impl CameraBackend for OpenCvBackend {
    type Reader = OpenCvReader;

    fn library_version(&self) -> &'static str {
        core::CV_VERSION
    }

    fn open(&self, source: &CaptureSource) -> Result<OpenCvReader, CaptureError> {
        let cap = match source {
            CaptureSource::Device { index } => open_device(*index, videoio::CAP_ANY)?,
            CaptureSource::Pipeline { description } => {
                open_uri(description, videoio::CAP_GSTREAMER)?
            }
            CaptureSource::Uri { uri } => open_uri(uri, videoio::CAP_ANY)?,
            CaptureSource::Auto { index, settings } => open_auto(*index, settings)?,
        };
        debug!("opened capture source {source}");
        Ok(OpenCvReader::new(cap))
    }
}

/// Open capture handle plus scratch buffers reused across reads.
pub struct OpenCvReader {
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    target_size: Option<(i32, i32)>,
}

impl OpenCvReader {
    fn new(cap: VideoCapture) -> Self {
        Self {
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            target_size: None,
        }
    }
}

impl FrameReader for OpenCvReader {
    fn configure(&mut self, settings: &CaptureSettings) {
        configure_camera(&mut self.cap, settings);
        self.target_size = Some((settings.width, settings.height));
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.cap.read(&mut self.frame).map_err(library_error)? {
            return Ok(None);
        }

        let size = self.frame.size().map_err(library_error)?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        let (width, height, working) = match self.target_size {
            Some((target_w, target_h)) if (target_w, target_h) != (size.width, size.height) => {
                imgproc::resize(
                    &self.frame,
                    &mut self.scratch,
                    core::Size {
                        width: target_w,
                        height: target_h,
                    },
                    0.0,
                    0.0,
                    imgproc::INTER_LINEAR,
                )
                .map_err(library_error)?;
                (target_w, target_h, &self.scratch)
            }
            _ => (size.width, size.height, &self.frame),
        };

        let data = working.data_bytes().map_err(library_error)?.to_vec();

        Ok(Some(Frame {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }))
    }
}

fn library_error(err: opencv::Error) -> CaptureError {
    CaptureError::Other(err.into())
}

fn ensure_opened(cap: VideoCapture, uri: impl FnOnce() -> String) -> Result<VideoCapture, CaptureError> {
    if cap.is_opened().map_err(library_error)? {
        Ok(cap)
    } else {
        Err(CaptureError::Open { uri: uri() })
    }
}

fn open_device(index: i32, api: i32) -> Result<VideoCapture, CaptureError> {
    let cap = VideoCapture::new(index, api).map_err(library_error)?;
    ensure_opened(cap, || format!("/dev/video{index}"))
}

fn open_uri(uri: &str, api: i32) -> Result<VideoCapture, CaptureError> {
    let cap = VideoCapture::from_file(uri, api).map_err(library_error)?;
    ensure_opened(cap, || uri.to_string())
}

/// CSI camera through GStreamer first, then the indexed device.
fn open_auto(index: i32, settings: &CaptureSettings) -> Result<VideoCapture, CaptureError> {
    let pipeline = csi_pipeline(settings);
    match VideoCapture::from_file(&pipeline, videoio::CAP_GSTREAMER) {
        Ok(cap) if cap.is_opened().unwrap_or(false) => {
            debug!("opened CSI camera via GStreamer");
            Ok(cap)
        }
        Ok(_) => {
            warn!("GStreamer CSI pipeline did not open, falling back to V4L2 /dev/video{index}");
            open_device(index, videoio::CAP_V4L2)
        }
        Err(err) => {
            warn!("GStreamer API error ({err}), falling back to device #{index}");
            open_device(index, videoio::CAP_ANY)
        }
    }
}

/// Apply capture settings (preferred pixel format, resolution, fps).
fn configure_camera(cap: &mut VideoCapture, settings: &CaptureSettings) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, settings.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, settings.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.fps as f64);
}
