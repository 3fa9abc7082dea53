use thiserror::Error;

use crate::landmarks::FaceLandmarks;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load landmark model {path}: {message}")]
    ModelLoad { path: String, message: String },
    #[error("landmark inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    InvalidOutput(String),
    #[error("no landmark detector available: {0}")]
    Unavailable(String),
}

/// Port to the external facial-landmark model.
///
/// `rgb` is a tightly packed RGB8 image of `width`×`height`. Returns the
/// landmarks of one face in normalized coordinates, or `None` when no face
/// is present.
pub trait LandmarkDetector: Send {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>, DetectorError>;
}

impl<T: LandmarkDetector + ?Sized> LandmarkDetector for Box<T> {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>, DetectorError> {
        (**self).detect(rgb, width, height)
    }
}
