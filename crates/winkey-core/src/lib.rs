//! winkey-core — eye-state pipeline.
//!
//! Turns facial landmarks into per-eye open/closed state and that state
//! into key actions. Camera access, the landmark model and the OS input
//! service sit behind ports ([`LandmarkDetector`], [`InputInjector`]).

pub mod actuation;
pub mod detector;
pub mod hysteresis;
pub mod landmarks;
pub mod mapper;
pub mod openness;
pub mod relay;
pub mod status;
pub mod tracker;

#[cfg(feature = "onnx")]
pub mod landmarker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use actuation::{ActuationGate, HeldKeys, InjectError, InputInjector, Key};
pub use detector::{DetectorError, LandmarkDetector};
pub use hysteresis::{EyeState, EyeStateTracker, ThresholdError, Thresholds};
pub use landmarks::{Eye, FaceLandmarks, Point};
pub use mapper::{ActionMapper, CombinedState, Decision};
pub use openness::openness_score;
pub use relay::DisplayRelay;
pub use status::{SessionState, StatusBoard, TrackerStatus};
pub use tracker::{lock_gate, lock_gate_within, shared_gate, EyeTracker, SharedGate};

#[cfg(feature = "onnx")]
pub use landmarker::FaceMeshLandmarker;

/// Default location of the face-landmark model.
///
/// `$XDG_DATA_HOME/winkey/face_landmark.onnx`, falling back to
/// `~/.local/share/winkey/face_landmark.onnx`.
pub fn default_model_path() -> std::path::PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_home.join("winkey").join("face_landmark.onnx")
}
