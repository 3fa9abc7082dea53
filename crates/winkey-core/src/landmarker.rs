//! MediaPipe face-mesh landmarker on ONNX Runtime.
//!
//! Expects the single-face landmark model (192×192 NHWC RGB input in the
//! [0, 1] range) with two outputs: 468 landmarks × (x, y, z) in input pixel
//! units and a face-presence logit. The model has no detection stage, so
//! it is run on the centred square crop of the frame, which is where a
//! user seated at a webcam appears.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::Session;
use ort::value::Tensor;

use crate::detector::{DetectorError, LandmarkDetector};
use crate::landmarks::{FaceLandmarks, Point};

const INPUT_SIZE: u32 = 192;
const MESH_POINTS: usize = 468;
/// Face-presence probability below which a frame counts as "no face".
const PRESENCE_THRESHOLD: f32 = 0.5;

pub struct FaceMeshLandmarker {
    session: Session,
}

impl FaceMeshLandmarker {
    /// Load the ONNX model at `path`.
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let load_err = |e: &dyn std::fmt::Display| DetectorError::ModelLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let session = Session::builder()
            .map_err(|e| load_err(&e))?
            .with_intra_threads(2)
            .map_err(|e| load_err(&e))?
            .commit_from_file(path)
            .map_err(|e| load_err(&e))?;

        tracing::info!(path = %path.display(), "face mesh model loaded");
        Ok(Self { session })
    }
}

/// Square crop geometry in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Crop {
    x: u32,
    y: u32,
    side: u32,
}

fn centre_crop(width: u32, height: u32) -> Crop {
    let side = width.min(height);
    Crop {
        x: (width - side) / 2,
        y: (height - side) / 2,
        side,
    }
}

/// Map a point in model input pixels back to normalized frame coordinates.
fn to_frame(x: f32, y: f32, crop: Crop, width: u32, height: u32) -> Point {
    let scale = crop.side as f32 / INPUT_SIZE as f32;
    Point::new(
        (crop.x as f32 + x * scale) / width as f32,
        (crop.y as f32 + y * scale) / height as f32,
    )
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl LandmarkDetector for FaceMeshLandmarker {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceLandmarks>, DetectorError> {
        let frame = RgbImage::from_raw(width, height, rgb.to_vec()).ok_or_else(|| {
            DetectorError::Inference(format!(
                "frame buffer of {} bytes does not match {width}x{height}",
                rgb.len()
            ))
        })?;
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let crop = centre_crop(width, height);
        let cropped = imageops::crop_imm(&frame, crop.x, crop.y, crop.side, crop.side).to_image();
        let resized = imageops::resize(&cropped, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let data: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|v| v as f32 / 255.0)
            .collect();

        let shape = [1usize, INPUT_SIZE as usize, INPUT_SIZE as usize, 3];
        let input = Tensor::from_array((shape, data))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let mut landmarks: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for index in 0..outputs.len() {
            let (_, values) = outputs[index]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;
            match values.len() {
                1 => presence = Some(values[0]),
                n if n == MESH_POINTS * 3 => landmarks = Some(values.to_vec()),
                _ => {}
            }
        }

        let landmarks = landmarks.ok_or_else(|| {
            DetectorError::InvalidOutput(format!("no output with {} values", MESH_POINTS * 3))
        })?;
        if let Some(logit) = presence {
            if sigmoid(logit) < PRESENCE_THRESHOLD {
                return Ok(None);
            }
        }

        let points = landmarks
            .chunks_exact(3)
            .map(|xyz| to_frame(xyz[0], xyz[1], crop, width, height))
            .collect();
        Ok(Some(FaceLandmarks::new(points)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centre_crop_landscape() {
        assert_eq!(
            centre_crop(320, 240),
            Crop {
                x: 40,
                y: 0,
                side: 240
            }
        );
    }

    #[test]
    fn test_centre_crop_portrait() {
        assert_eq!(
            centre_crop(240, 320),
            Crop {
                x: 0,
                y: 40,
                side: 240
            }
        );
    }

    #[test]
    fn test_to_frame_maps_crop_corners() {
        let crop = centre_crop(320, 240);
        let origin = to_frame(0.0, 0.0, crop, 320, 240);
        assert!((origin.x - 40.0 / 320.0).abs() < 1e-6);
        assert!(origin.y.abs() < 1e-6);

        let far = to_frame(192.0, 192.0, crop, 320, 240);
        assert!((far.x - 280.0 / 320.0).abs() < 1e-6);
        assert!((far.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }
}
