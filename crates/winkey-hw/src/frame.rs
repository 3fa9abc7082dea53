use image::{imageops, RgbImage};

/// A captured RGB8 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Tightly packed RGB8 pixels, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture order within the session, starting at 0.
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
        }
    }

    /// Build a frame from a decoded image.
    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, sequence)
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Non-empty, and the buffer matches the dimensions.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    /// Flip left-right in place, so the preview moves like a mirror.
    ///
    /// Invalid frames are left untouched.
    pub fn mirror_horizontal(&mut self) {
        if !self.is_valid() {
            return;
        }
        let data = std::mem::take(&mut self.data);
        if let Some(mut image) = RgbImage::from_raw(self.width, self.height, data) {
            imageops::flip_horizontal_in_place(&mut image);
            self.data = image.into_raw();
        }
    }

    /// Draw a small square of `color` centred on each `(x, y)` pixel position.
    ///
    /// Points outside the frame, or not finite, are skipped.
    pub fn mark_points(&mut self, points: &[(f32, f32)], color: [u8; 3]) {
        if !self.is_valid() {
            return;
        }
        let (width, height) = (self.width as i64, self.height as i64);
        for &(x, y) in points {
            if !(x.is_finite() && y.is_finite()) {
                continue;
            }
            let (cx, cy) = (x.round() as i64, y.round() as i64);
            if cx < 0 || cy < 0 || cx >= width || cy >= height {
                continue;
            }
            for py in (cy - 1).max(0)..=(cy + 1).min(height - 1) {
                for px in (cx - 1).max(0)..=(cx + 1).min(width - 1) {
                    let at = ((py * width + px) * 3) as usize;
                    self.data[at..at + 3].copy_from_slice(&color);
                }
            }
        }
    }

    /// Copy into an [`RgbImage`] (e.g. for saving a snapshot).
    pub fn to_image(&self) -> Option<RgbImage> {
        if !self.is_valid() {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}
