//! In-memory camera backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{CameraBackend, CameraError, CaptureDevice, CaptureFormat, CaptureRequest};
use crate::frame::Frame;

#[derive(Default)]
struct Counters {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opens: AtomicUsize,
    releases: AtomicUsize,
    reads: AtomicUsize,
}

/// Backend producing solid grey frames and counting device handles.
/// Clones share counters.
#[derive(Clone)]
pub struct MockBackend {
    width: u32,
    height: u32,
    fail_open: bool,
    /// Reads numbered `>= fail_reads_from` fail (per device).
    fail_reads_from: Option<usize>,
    frame_delay: Duration,
    counters: Arc<Counters>,
}

impl MockBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_open: false,
            fail_reads_from: None,
            frame_delay: Duration::ZERO,
            counters: Arc::default(),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every read after the first `good_reads` fails.
    pub fn failing_reads_after(mut self, good_reads: usize) -> Self {
        self.fail_reads_from = Some(good_reads);
        self
    }

    /// Sleep this long in every read, like a real frame period.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Device handles currently open.
    pub fn open_handles(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Highest number of handles that were ever open at once.
    pub fn max_concurrent_handles(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Total reads across all devices, failed or not.
    pub fn read_calls(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }
}

impl CameraBackend for MockBackend {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, CameraError> {
        if self.fail_open {
            return Err(CameraError::Open {
                index: request.index,
                message: "mock open failure".into(),
            });
        }
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(open, Ordering::SeqCst);
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDevice {
            width: self.width,
            height: self.height,
            fps: request.fps as f32,
            fail_reads_from: self.fail_reads_from,
            frame_delay: self.frame_delay,
            reads: 0,
            released: false,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockDevice {
    width: u32,
    height: u32,
    fps: f32,
    fail_reads_from: Option<usize>,
    frame_delay: Duration,
    reads: usize,
    released: bool,
    counters: Arc<Counters>,
}

impl MockDevice {
    fn close(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

impl CaptureDevice for MockDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        let sequence = self.reads as u64;
        self.reads += 1;
        if self.released {
            return Err(CameraError::Read("device released".into()));
        }
        if self.fail_reads_from.is_some_and(|n| sequence as usize >= n) {
            return Err(CameraError::Read("mock read failure".into()));
        }
        let len = self.width as usize * self.height as usize * 3;
        Ok(Frame::new(vec![128; len], self.width, self.height, sequence))
    }

    fn format(&self) -> CaptureFormat {
        CaptureFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    fn release(&mut self) -> Result<(), CameraError> {
        if self.close() {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.close();
    }
}
