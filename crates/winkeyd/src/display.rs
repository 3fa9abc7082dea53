//! Display consumer.
//!
//! Polls the relay and the status board on a fixed tick, independent of the
//! capture rate. The newest frame is kept so it can be saved as a snapshot.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use winkey_core::{DisplayRelay, StatusBoard, TrackerStatus};
use winkey_hw::Frame;

use crate::session::SessionShared;

pub const DISPLAY_TICK: Duration = Duration::from_millis(33);

/// Most recently displayed frame. Clones share the slot.
#[derive(Clone, Default)]
pub struct LatestFrame {
    inner: Arc<Mutex<Option<Frame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, frame: Frame) {
        *self.lock() = Some(frame);
    }

    pub fn get(&self) -> Option<Frame> {
        self.lock().clone()
    }

    /// Write the frame to `path`; the format follows the extension.
    ///
    /// Returns `false` when nothing has been displayed yet.
    pub fn save(&self, path: &Path) -> Result<bool, image::ImageError> {
        let Some(image) = self.get().and_then(|frame| frame.to_image()) else {
            return Ok(false);
        };
        image.save(path)?;
        tracing::info!(path = %path.display(), "snapshot saved");
        Ok(true)
    }
}

pub struct DisplayConsumer {
    relay: DisplayRelay<Frame>,
    status: StatusBoard,
    latest: LatestFrame,
    last_status: TrackerStatus,
    shown: u64,
}

impl DisplayConsumer {
    pub fn new(shared: &SessionShared, latest: LatestFrame) -> Self {
        Self {
            relay: shared.relay.clone(),
            status: shared.status.clone(),
            latest,
            last_status: TrackerStatus::default(),
            shown: 0,
        }
    }

    /// Take the newest frame, if any, and note status changes.
    ///
    /// Returns `true` when a new frame was taken.
    pub fn tick(&mut self) -> bool {
        let fresh = match self.relay.pop() {
            Some(frame) => {
                self.latest.set(frame);
                self.shown += 1;
                true
            }
            None => false,
        };

        let status = self.status.snapshot();
        if status.session != self.last_status.session {
            tracing::info!(from = ?self.last_status.session, to = ?status.session, "session state changed");
        }
        if status.held != self.last_status.held {
            tracing::debug!(
                left_action = status.held.left_action,
                right_action = status.held.right_action,
                "held keys changed"
            );
        }
        self.last_status = status;
        fresh
    }

    /// Frames taken so far.
    pub fn shown(&self) -> u64 {
        self.shown
    }

    /// Tick until `shutdown` flips or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(DISPLAY_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!("display loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(frames = self.shown, "display loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use winkey_core::SessionState;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "winkey-display-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![sequence as u8; 4 * 2 * 3], 4, 2, sequence)
    }

    #[test]
    fn test_tick_keeps_only_newest_frame() {
        let shared = SessionShared::new(true);
        let latest = LatestFrame::new();
        let mut consumer = DisplayConsumer::new(&shared, latest.clone());

        for seq in 1..=3 {
            shared.relay.push(frame(seq));
        }
        assert!(consumer.tick());
        assert_eq!(latest.get().map(|f| f.sequence), Some(3));
        assert!(!consumer.tick());
        assert_eq!(latest.get().map(|f| f.sequence), Some(3));
        assert_eq!(consumer.shown(), 1);
    }

    #[test]
    fn test_tick_tracks_status() {
        let shared = SessionShared::new(true);
        let mut consumer = DisplayConsumer::new(&shared, LatestFrame::new());
        shared.status.reset(SessionState::Preview);
        consumer.tick();
        assert_eq!(consumer.last_status.session, SessionState::Preview);
    }

    #[test]
    fn test_save_snapshot() {
        let latest = LatestFrame::new();
        let dir = temp_dir("snapshot");
        let path = dir.join("shot.png");
        assert!(!latest.save(&path).unwrap());
        assert!(!path.exists());

        latest.set(frame(7));
        assert!(latest.save(&path).unwrap());
        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (4, 2));
        assert_eq!(saved.get_pixel(0, 0).0, [7, 7, 7]);

        assert!(latest.save(&dir.join("shot.unknown-ext")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_run_consumes_until_shutdown() {
        let shared = SessionShared::new(true);
        let latest = LatestFrame::new();
        let consumer = DisplayConsumer::new(&shared, latest.clone());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(rx));

        shared.relay.push(frame(1));
        for _ in 0..50 {
            if latest.get().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(latest.get().map(|f| f.sequence), Some(1));
        assert!(shared.relay.is_empty());

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
