//! Exclusive ownership of the physical camera.
//!
//! Preview and tracking sessions each have a handle slot, and at most one
//! slot is occupied at any instant. Opening, reading and releasing all
//! happen under the same lock, so two sessions can never hold the device
//! open together.
//!
//! [`CameraGuard::acquire`] returns a [`CameraLease`] that releases its slot
//! when dropped, whichever way the owning worker exits. Each lease carries
//! a generation number: a lease outliving a forced release (for example a
//! worker that missed its join timeout) can no longer read from, or
//! release, a device opened later by another session.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::camera::{CameraBackend, CameraError, CaptureDevice, CaptureFormat, CaptureRequest};
use crate::frame::Frame;

/// Logical owner of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Preview,
    Tracking,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Tracking => "tracking",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Slot {
    generation: u64,
    index: u32,
    device: Box<dyn CaptureDevice>,
}

#[derive(Default)]
struct Slots {
    preview: Option<Slot>,
    tracking: Option<Slot>,
    next_generation: u64,
}

impl Slots {
    fn slot_mut(&mut self, kind: SessionKind) -> &mut Option<Slot> {
        match kind {
            SessionKind::Preview => &mut self.preview,
            SessionKind::Tracking => &mut self.tracking,
        }
    }

    fn holder(&self) -> Option<SessionKind> {
        if self.preview.is_some() {
            Some(SessionKind::Preview)
        } else if self.tracking.is_some() {
            Some(SessionKind::Tracking)
        } else {
            None
        }
    }

    fn open_count(&self) -> usize {
        usize::from(self.preview.is_some()) + usize::from(self.tracking.is_some())
    }
}

/// Clone-safe handle to the camera slots.
#[derive(Clone, Default)]
pub struct CameraGuard {
    slots: Arc<Mutex<Slots>>,
}

impl CameraGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the camera for `kind`.
    ///
    /// Fails with [`CameraError::Busy`] if any session already holds the
    /// device; the caller must stop that session first.
    pub fn acquire(
        &self,
        kind: SessionKind,
        backend: &dyn CameraBackend,
        request: &CaptureRequest,
    ) -> Result<CameraLease, CameraError> {
        let mut slots = self.lock();
        if let Some(holder) = slots.holder() {
            return Err(CameraError::Busy(holder));
        }

        tracing::info!(
            session = %kind,
            backend = backend.name(),
            camera = request.index,
            "opening camera"
        );
        let device = backend.open(request)?;
        let format = device.format();
        tracing::info!(
            session = %kind,
            camera = request.index,
            requested = %format!("{}x{} @{}fps", request.width, request.height, request.fps),
            actual = %format,
            "camera opened"
        );

        slots.next_generation += 1;
        let generation = slots.next_generation;
        *slots.slot_mut(kind) = Some(Slot {
            generation,
            index: request.index,
            device,
        });

        Ok(CameraLease {
            guard: self.clone(),
            kind,
            generation,
            format,
        })
    }

    /// Release whatever device `kind` holds. Idempotent.
    ///
    /// Returns `true` if a device was released.
    pub fn release(&self, kind: SessionKind) -> bool {
        self.release_matching(kind, None)
    }

    fn release_matching(&self, kind: SessionKind, generation: Option<u64>) -> bool {
        let mut slots = self.lock();
        let slot = slots.slot_mut(kind);
        let matches = match (slot.as_ref(), generation) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(s), Some(g)) => s.generation == g,
        };
        if !matches {
            return false;
        }
        let Some(mut slot) = slot.take() else {
            return false;
        };

        tracing::info!(session = %kind, camera = slot.index, "releasing camera");
        if let Err(e) = slot.device.release() {
            tracing::error!(session = %kind, camera = slot.index, error = %e, "camera release failed");
        }
        tracing::info!(session = %kind, camera = slot.index, "camera released");
        true
    }

    fn read(&self, kind: SessionKind, generation: u64) -> Result<Frame, CameraError> {
        let mut slots = self.lock();
        match slots.slot_mut(kind) {
            Some(slot) if slot.generation == generation => slot.device.read_frame(),
            _ => Err(CameraError::NotOpen(kind)),
        }
    }

    /// Number of open device handles (0 or 1).
    pub fn open_count(&self) -> usize {
        self.lock().open_count()
    }

    /// Which session currently holds the device.
    pub fn holder(&self) -> Option<SessionKind> {
        self.lock().holder()
    }
}

/// A session's claim on the camera. Releases the device on drop.
pub struct CameraLease {
    guard: CameraGuard,
    kind: SessionKind,
    generation: u64,
    format: CaptureFormat,
}

impl CameraLease {
    /// Read one frame. Fails with [`CameraError::NotOpen`] once the device
    /// has been released out from under this lease.
    pub fn read_frame(&self) -> Result<Frame, CameraError> {
        self.guard.read(self.kind, self.generation)
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Release now rather than at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.guard.release_matching(self.kind, Some(self.generation));
    }
}
