//! Camera device ports.
//!
//! A [`CameraBackend`] opens devices; a [`CaptureDevice`] is one open
//! handle. Requested formats are best-effort: backends report what the
//! device actually negotiated and callers log it rather than enforce it.

use std::fmt;

use thiserror::Error;

use crate::frame::Frame;
use crate::guard::SessionKind;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("failed to open camera {index}: {message}")]
    Open { index: u32, message: String },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("camera is not open for the {0} session")]
    NotOpen(SessionKind),
    #[error("camera is busy: held by the {0} session")]
    Busy(SessionKind),
    #[error("camera backend unsupported: {0}")]
    Unsupported(String),
    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the caller asks the device for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// What the device actually delivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} @{:.2}fps", self.width, self.height, self.fps)
    }
}

/// One open camera handle.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Negotiated capture format.
    fn format(&self) -> CaptureFormat;

    /// Release the underlying device. Must be safe to call more than once.
    fn release(&mut self) -> Result<(), CameraError>;
}

/// Opens camera devices.
pub trait CameraBackend: Send + Sync {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Backend used when no capture support was compiled in.
pub struct UnsupportedBackend {
    reason: String,
}

impl UnsupportedBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CameraBackend for UnsupportedBackend {
    fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Err(CameraError::Unsupported(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unsupported"
    }
}
