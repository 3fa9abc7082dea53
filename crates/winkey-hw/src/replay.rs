//! Replay backend: serves the images of a directory as a looping camera.
//!
//! Frames are paced to the requested frame rate so downstream timing
//! behaves as it would with a real device.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::camera::{CameraBackend, CameraError, CaptureDevice, CaptureFormat, CaptureRequest};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

pub struct ReplayBackend {
    dir: PathBuf,
}

impl ReplayBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CameraError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn decode(path: &Path, sequence: u64) -> Result<Frame, CameraError> {
    let image = image::open(path)
        .map_err(|e| CameraError::Read(format!("{}: {e}", path.display())))?
        .to_rgb8();
    Ok(Frame::from_image(image, sequence))
}

impl CameraBackend for ReplayBackend {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let open_err = |message: String| CameraError::Open {
            index: request.index,
            message,
        };
        let paths = list_images(&self.dir)
            .map_err(|e| open_err(format!("{}: {e}", self.dir.display())))?;
        let first = paths
            .first()
            .ok_or_else(|| open_err(format!("no images in {}", self.dir.display())))?;
        let probe = decode(first, 0).map_err(|e| open_err(e.to_string()))?;

        let fps = request.fps.max(1);
        Ok(Box::new(ReplayDevice {
            paths,
            next: 0,
            sequence: 0,
            format: CaptureFormat {
                width: probe.width,
                height: probe.height,
                fps: fps as f32,
            },
            period: Duration::from_secs(1) / fps,
            last_read: None,
            released: false,
        }))
    }

    fn name(&self) -> &str {
        "replay"
    }
}

struct ReplayDevice {
    paths: Vec<PathBuf>,
    next: usize,
    sequence: u64,
    format: CaptureFormat,
    period: Duration,
    last_read: Option<Instant>,
    released: bool,
}

impl CaptureDevice for ReplayDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        if self.released {
            return Err(CameraError::Read("replay device released".into()));
        }
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.period {
                std::thread::sleep(self.period - elapsed);
            }
        }
        self.last_read = Some(Instant::now());

        let path = &self.paths[self.next];
        self.next = (self.next + 1) % self.paths.len();
        let frame = decode(path, self.sequence)?;
        self.sequence += 1;
        Ok(frame)
    }

    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn release(&mut self) -> Result<(), CameraError> {
        self.released = true;
        Ok(())
    }
}
