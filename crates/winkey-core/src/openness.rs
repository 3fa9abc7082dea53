//! Eye-openness scoring from six contour landmarks.
//!
//! The score is the classic eye aspect ratio: the mean of the two vertical
//! lid distances divided by twice the horizontal corner distance. An open
//! eye typically scores 0.25–0.35; a closed eye drops below 0.15.

use crate::landmarks::Point;

/// Horizontal spans shorter than this (pixels) are treated as degenerate.
pub const MIN_HORIZONTAL_SPAN: f32 = 1e-6;

/// Score how open an eye is.
///
/// `contour` must hold exactly six points ordered outer corner, upper lid
/// (2), inner corner, lower lid (2). Anything else (wrong count,
/// non-finite coordinates, coincident corners) scores 0.0, which the
/// state tracker reads as closed.
pub fn openness_score(contour: &[Point]) -> f32 {
    let [p1, p2, p3, p4, p5, p6] = match contour {
        [a, b, c, d, e, f] => [a, b, c, d, e, f],
        _ => return 0.0,
    };
    if !contour.iter().all(Point::is_finite) {
        return 0.0;
    }

    let vertical1 = p2.distance(p6);
    let vertical2 = p3.distance(p5);
    let horizontal = p1.distance(p4);
    if horizontal < MIN_HORIZONTAL_SPAN {
        return 0.0;
    }

    let score = (vertical1 + vertical2) / (2.0 * horizontal);
    if score.is_finite() {
        score.max(0.0)
    } else {
        0.0
    }
}
