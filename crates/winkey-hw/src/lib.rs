//! winkey-hw — camera capture for the winkey daemon.
//!
//! Backends open devices ([`CameraBackend`]); the [`CameraGuard`] makes
//! sure only one session holds the physical camera at a time.

pub mod camera;
pub mod frame;
pub mod guard;
pub mod replay;

#[cfg(feature = "v4l")]
pub mod v4l;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use camera::{
    CameraBackend, CameraError, CaptureDevice, CaptureFormat, CaptureRequest, UnsupportedBackend,
};
pub use frame::Frame;
pub use guard::{CameraGuard, CameraLease, SessionKind};
pub use replay::ReplayBackend;

#[cfg(feature = "v4l")]
pub use self::v4l::V4lBackend;
