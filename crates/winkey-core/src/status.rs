//! Status snapshot published by the capture worker and polled by consumers.
//!
//! The whole bundle is replaced under one lock so a reader never sees the
//! left eye of one frame paired with the right eye of another.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::actuation::HeldKeys;
use crate::hysteresis::EyeState;

/// Which kind of camera session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Preview,
    Tracking,
}

/// Per-frame tracking status.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TrackerStatus {
    pub session: SessionState,
    pub face_visible: bool,
    pub left_eye: EyeState,
    pub right_eye: EyeState,
    pub left_score: f32,
    pub right_score: f32,
    pub held: HeldKeys,
    /// Frames sent through inference since the session started.
    pub frames_processed: u64,
}

impl TrackerStatus {
    /// Defaults for a freshly started (or stopped) session.
    pub fn for_session(session: SessionState) -> Self {
        Self {
            session,
            ..Self::default()
        }
    }
}

/// Shared, atomically replaced [`TrackerStatus`].
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<TrackerStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot.
    pub fn publish(&self, status: TrackerStatus) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> TrackerStatus {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset to defaults for `session`.
    pub fn reset(&self, session: SessionState) {
        self.publish(TrackerStatus::for_session(session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_snapshot() {
        let board = StatusBoard::new();
        assert_eq!(board.snapshot(), TrackerStatus::default());

        let status = TrackerStatus {
            session: SessionState::Tracking,
            face_visible: true,
            left_eye: EyeState::Closed,
            left_score: 0.1,
            right_score: 0.3,
            ..TrackerStatus::default()
        };
        board.publish(status);
        assert_eq!(board.snapshot(), status);

        board.reset(SessionState::Idle);
        assert_eq!(board.snapshot(), TrackerStatus::default());
    }

    #[test]
    fn test_snapshots_are_never_torn() {
        let board = StatusBoard::new();
        let writer = board.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..5_000u64 {
                let closed = i % 2 == 0;
                let state = if closed { EyeState::Closed } else { EyeState::Open };
                writer.publish(TrackerStatus {
                    left_eye: state,
                    right_eye: state,
                    frames_processed: i,
                    ..TrackerStatus::default()
                });
            }
        });
        for _ in 0..5_000 {
            let s = board.snapshot();
            assert_eq!(s.left_eye, s.right_eye);
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_serializes_to_json() {
        let json = serde_json::to_value(TrackerStatus::for_session(SessionState::Preview)).unwrap();
        assert_eq!(json["session"], "preview");
        assert_eq!(json["left_eye"], "open");
        assert_eq!(json["held"]["left_action"], false);
    }
}
