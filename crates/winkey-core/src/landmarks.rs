//! Facial landmark types and eye-contour extraction.
//!
//! Detectors report face-mesh points in normalized image coordinates
//! (0.0–1.0 on both axes). Scoring works in pixel space so that the
//! aspect ratio of the frame does not distort the openness ratio.

use serde::Serialize;

/// Face-mesh indices for the subject's left eye, in contour order:
/// outer corner, upper lid (2), inner corner, lower lid (2).
pub const LEFT_EYE_CONTOUR: [usize; 6] = [362, 385, 387, 263, 373, 380];

/// Face-mesh indices for the subject's right eye, same ordering as
/// [`LEFT_EYE_CONTOUR`].
pub const RIGHT_EYE_CONTOUR: [usize; 6] = [33, 160, 158, 133, 153, 144];

/// A 2D point. Normalized when stored in [`FaceLandmarks`], pixels once
/// extracted with [`FaceLandmarks::eye_contour`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Which eye. Always the subject's own side, independent of mirroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub fn contour_indices(&self) -> &'static [usize; 6] {
        match self {
            Self::Left => &LEFT_EYE_CONTOUR,
            Self::Right => &RIGHT_EYE_CONTOUR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Landmarks of a single detected face, normalized coordinates.
#[derive(Debug, Clone, Default)]
pub struct FaceLandmarks {
    pub points: Vec<Point>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Extract the six-point contour of `eye`, scaled to pixel coordinates.
    ///
    /// Indices beyond the detector's point count are skipped, so a truncated
    /// mesh yields fewer than six points; the scorer treats that as closed.
    pub fn eye_contour(&self, eye: Eye, width: u32, height: u32) -> Vec<Point> {
        let (w, h) = (width as f32, height as f32);
        eye.contour_indices()
            .iter()
            .filter_map(|&idx| self.points.get(idx))
            .map(|p| Point::new(p.x * w, p.y * h))
            .collect()
    }
}
