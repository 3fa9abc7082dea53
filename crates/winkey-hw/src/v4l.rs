//! V4L2 capture backend using memory-mapped streaming.
//!
//! MJPEG is requested first since most UVC webcams only reach their full
//! frame rate with it; YUYV is accepted as a fallback.

use std::time::Instant;

use image::ImageFormat;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::camera::{CameraBackend, CameraError, CaptureDevice, CaptureFormat, CaptureRequest};
use crate::frame::Frame;

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Mjpeg,
    Yuyv,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(Self::Mjpeg),
            b"YUYV" => Some(Self::Yuyv),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct V4lBackend;

impl V4lBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CameraBackend for V4lBackend {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let open_err = |e: std::io::Error| CameraError::Open {
            index: request.index,
            message: e.to_string(),
        };

        let device = Device::new(request.index as usize).map_err(open_err)?;

        let mut format = device.format().map_err(open_err)?;
        format.width = request.width;
        format.height = request.height;
        format.fourcc = FourCC::new(b"MJPG");
        let mut format = device.set_format(&format).map_err(open_err)?;
        if PixelFormat::from_fourcc(format.fourcc).is_none() {
            format.fourcc = FourCC::new(b"YUYV");
            format = device.set_format(&format).map_err(open_err)?;
        }
        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::Unsupported(format!("pixel format {} not supported", format.fourcc))
        })?;

        let params = device
            .set_params(&Parameters::with_fps(request.fps))
            .map_err(open_err)?;
        let fps = if params.interval.numerator > 0 {
            params.interval.denominator as f32 / params.interval.numerator as f32
        } else {
            request.fps as f32
        };

        let stream =
            Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(open_err)?;

        Ok(Box::new(V4lDevice {
            _device: device,
            stream: Some(stream),
            pixel_format,
            format: CaptureFormat {
                width: format.width,
                height: format.height,
                fps,
            },
            stride: format.stride,
            sequence: 0,
        }))
    }

    fn name(&self) -> &str {
        "v4l2"
    }
}

struct V4lDevice {
    _device: Device,
    stream: Option<Stream<'static>>,
    pixel_format: PixelFormat,
    format: CaptureFormat,
    /// Bytes per row as reported by the driver; 0 when it did not say.
    stride: u32,
    sequence: u64,
}

// SAFETY: the mapped buffers are only touched through `&mut self`, and the
// guard serializes every call on the device behind its mutex.
unsafe impl Send for V4lDevice {}

impl CaptureDevice for V4lDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Read("device released".into()))?;
        let started = Instant::now();
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::Read(e.to_string()))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = &buf[..used];
        if data.is_empty() {
            return Err(CameraError::Read("empty buffer".into()));
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let frame = match self.pixel_format {
            PixelFormat::Mjpeg => {
                let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                    .map_err(|e| CameraError::Read(format!("MJPEG decode: {e}")))?
                    .to_rgb8();
                Frame::from_image(image, sequence)
            }
            PixelFormat::Yuyv => {
                let rgb = yuyv_to_rgb(data, self.format.width, self.format.height, self.stride)?;
                Frame::new(rgb, self.format.width, self.format.height, sequence)
            }
        };
        tracing::trace!(sequence, elapsed_ms = started.elapsed().as_millis() as u64, "v4l frame");
        Ok(frame)
    }

    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn release(&mut self) -> Result<(), CameraError> {
        // Dropping the stream unmaps the buffers and stops streaming.
        self.stream = None;
        Ok(())
    }
}

/// Convert packed YUYV 4:2:2 to RGB8 (BT.601, limited range).
///
/// Rows are padded to whole macropixels, so an odd `width` still spans
/// `(width + 1) / 2` of them; the spare pixel at the end of each row is
/// dropped. `stride` below the packed row size is ignored.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Result<Vec<u8>, CameraError> {
    let width = width as usize;
    let height = height as usize;
    let row_bytes = width.div_ceil(2) * 4;
    let stride = (stride as usize).max(row_bytes);
    let needed = match height {
        0 => 0,
        h => stride * (h - 1) + row_bytes,
    };
    if data.len() < needed {
        return Err(CameraError::Read(format!(
            "YUYV buffer too short: {} bytes for {width}x{height}",
            data.len()
        )));
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let start = row * stride;
        let mut left = width;
        for chunk in data[start..start + row_bytes].chunks_exact(4) {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            for y in [y0, y1] {
                if left == 0 {
                    break;
                }
                rgb.extend_from_slice(&yuv_pixel(y, u, v));
                left -= 1;
            }
        }
    }
    Ok(rgb)
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ]
}
