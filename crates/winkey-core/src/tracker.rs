//! Per-frame eye tracking: landmarks → openness → eye state → key actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::actuation::{ActuationGate, InputInjector};
use crate::hysteresis::{EyeStateTracker, Thresholds};
use crate::landmarks::{Eye, FaceLandmarks};
use crate::mapper::{ActionMapper, Decision};
use crate::openness::openness_score;
use crate::status::{SessionState, StatusBoard, TrackerStatus};

const GATE_POLL: Duration = Duration::from_millis(2);

/// Actuation gate shared between the tracking worker and the controller,
/// which needs it to force-release keys if the worker cannot be joined.
pub type SharedGate<I> = Arc<Mutex<ActuationGate<I>>>;

pub fn shared_gate<I: InputInjector>(injector: I) -> SharedGate<I> {
    Arc::new(Mutex::new(ActuationGate::new(injector)))
}

/// Lock a shared gate, recovering it if a previous holder panicked.
pub fn lock_gate<I: InputInjector>(gate: &SharedGate<I>) -> MutexGuard<'_, ActuationGate<I>> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Like [`lock_gate`], but gives up after `timeout`.
///
/// The holder may be stuck inside an injector call; `None` means it still
/// was when the time ran out.
pub fn lock_gate_within<I: InputInjector>(
    gate: &SharedGate<I>,
    timeout: Duration,
) -> Option<MutexGuard<'_, ActuationGate<I>>> {
    let deadline = Instant::now() + timeout;
    loop {
        match gate.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(e)) => return Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(GATE_POLL);
            }
        }
    }
}

/// Tracking state owned by one session's worker.
///
/// Once the session's running flag is cleared the tracker stops pressing
/// keys and stops publishing status. Both checks happen with the gate
/// locked, so a controller that has cleaned up under the same lock never
/// sees a late key press or a stale "tracking" status.
pub struct EyeTracker<I: InputInjector> {
    left: EyeStateTracker,
    right: EyeStateTracker,
    mapper: ActionMapper,
    gate: SharedGate<I>,
    status: StatusBoard,
    running: Arc<AtomicBool>,
    face_visible: bool,
    left_score: f32,
    right_score: f32,
    frames_processed: u64,
}

impl<I: InputInjector> EyeTracker<I> {
    pub fn new(
        thresholds: Thresholds,
        pulse: Duration,
        gate: SharedGate<I>,
        status: StatusBoard,
    ) -> Self {
        let tracker = Self {
            left: EyeStateTracker::new(thresholds),
            right: EyeStateTracker::new(thresholds),
            mapper: ActionMapper::new(pulse),
            gate,
            status,
            running: Arc::new(AtomicBool::new(true)),
            face_visible: false,
            left_score: 0.0,
            right_score: 0.0,
            frames_processed: 0,
        };
        tracker.publish();
        tracker
    }

    /// Tie the tracker to a session's running flag.
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn thresholds(&self) -> Thresholds {
        self.left.thresholds()
    }

    /// Use new thresholds from the next frame on; eye states are kept.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.left.set_thresholds(thresholds);
        self.right.set_thresholds(thresholds);
    }

    pub fn both_were_closed(&self) -> bool {
        self.mapper.both_were_closed()
    }

    /// Process the detector's result for one frame of `width`×`height` pixels.
    ///
    /// Returns the mapper decision, or `None` when no face was seen or the
    /// session has been stopped.
    pub fn process(
        &mut self,
        face: Option<&FaceLandmarks>,
        width: u32,
        height: u32,
    ) -> Option<Decision> {
        self.frames_processed += 1;

        let visible = face.is_some();
        if visible != self.face_visible {
            if visible {
                tracing::info!("face found");
            } else {
                tracing::info!("face lost");
            }
            self.reset();
            self.face_visible = visible;
        }

        let decision = match face {
            Some(face) => {
                self.left_score = openness_score(&face.eye_contour(Eye::Left, width, height));
                self.right_score = openness_score(&face.eye_contour(Eye::Right, width, height));
                if self.left.update(self.left_score) {
                    tracing::debug!(eye = Eye::Left.as_str(), state = ?self.left.state(), score = self.left_score, "eye state changed");
                }
                if self.right.update(self.right_score) {
                    tracing::debug!(eye = Eye::Right.as_str(), state = ?self.right.state(), score = self.right_score, "eye state changed");
                }
                self.actuate()
            }
            None => None,
        };

        self.publish();
        decision
    }

    fn actuate(&mut self) -> Option<Decision> {
        let mut gate = lock_gate(&self.gate);
        if !self.is_active() {
            tracing::debug!("session stopped; skipping actuation");
            return None;
        }
        let decision = self
            .mapper
            .apply(self.left.state(), self.right.state(), &mut gate);
        if decision == Decision::BothClosedPulse {
            drop(gate);
            let hold = self.mapper.pulse();
            if !hold.is_zero() {
                std::thread::sleep(hold);
            }
            // A controller cleanup during the hold has already released them.
            lock_gate(&self.gate).release_all();
        }
        Some(decision)
    }

    /// Release held keys and return every eye to open.
    ///
    /// Used on face loss and at session stop; calling it repeatedly is
    /// equivalent to calling it once.
    pub fn reset(&mut self) {
        if lock_gate(&self.gate).release_all() {
            tracing::info!("tracking reset: released held keys");
        }
        self.left.reset();
        self.right.reset();
        self.mapper.reset();
        self.face_visible = false;
        self.left_score = 0.0;
        self.right_score = 0.0;
        self.publish();
    }

    fn publish(&self) {
        let gate = lock_gate(&self.gate);
        if !self.is_active() {
            return;
        }
        self.status.publish(TrackerStatus {
            session: SessionState::Tracking,
            face_visible: self.face_visible,
            left_eye: self.left.state(),
            right_eye: self.right.state(),
            left_score: self.left_score,
            right_score: self.right_score,
            held: gate.held(),
            frames_processed: self.frames_processed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::{HeldKeys, Key};
    use crate::hysteresis::EyeState;
    use crate::testing::{face_with_openness, InjectedKey, RecordingInjector};

    fn setup() -> (EyeTracker<RecordingInjector>, RecordingInjector, StatusBoard) {
        let injector = RecordingInjector::new();
        let board = StatusBoard::new();
        let tracker = EyeTracker::new(
            Thresholds::default(),
            Duration::ZERO,
            shared_gate(injector.clone()),
            board.clone(),
        );
        (tracker, injector, board)
    }

    #[test]
    fn test_left_wink_holds_left_action() {
        let (mut tracker, injector, board) = setup();
        let open = face_with_openness(0.30, 0.30);
        let left_closed = face_with_openness(0.05, 0.30);

        tracker.process(Some(&open), 100, 100);
        let decision = tracker.process(Some(&left_closed), 100, 100);

        assert_eq!(decision, Some(Decision::HoldLeft));
        assert_eq!(injector.events(), vec![InjectedKey::Down(Key::LeftAction)]);

        let status = board.snapshot();
        assert!(status.face_visible);
        assert_eq!(status.left_eye, EyeState::Closed);
        assert_eq!(status.right_eye, EyeState::Open);
        assert!((status.left_score - 0.05).abs() < 1e-3);
        assert!(status.held.left_action);
        assert_eq!(status.frames_processed, 2);
    }

    #[test]
    fn test_dead_zone_scores_do_not_reopen() {
        let (mut tracker, injector, board) = setup();
        tracker.process(Some(&face_with_openness(0.05, 0.30)), 100, 100);
        tracker.process(Some(&face_with_openness(0.20, 0.30)), 100, 100);
        assert_eq!(board.snapshot().left_eye, EyeState::Closed);
        tracker.process(Some(&face_with_openness(0.25, 0.30)), 100, 100);
        assert_eq!(board.snapshot().left_eye, EyeState::Open);
        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Down(Key::LeftAction),
                InjectedKey::Up(Key::LeftAction),
            ]
        );
    }

    #[test]
    fn test_face_loss_releases_and_resets() {
        let (mut tracker, injector, board) = setup();
        tracker.process(Some(&face_with_openness(0.30, 0.05)), 100, 100);
        assert!(board.snapshot().held.right_action);

        assert_eq!(tracker.process(None, 100, 100), None);
        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Down(Key::RightAction),
                InjectedKey::Up(Key::RightAction),
            ]
        );
        let status = board.snapshot();
        assert!(!status.face_visible);
        assert_eq!(status.right_eye, EyeState::Open);
        assert_eq!(status.held, HeldKeys::default());
        assert_eq!(status.right_score, 0.0);
    }

    #[test]
    fn test_face_loss_clears_both_closed_flag() {
        let (mut tracker, injector, _board) = setup();
        tracker.process(Some(&face_with_openness(0.05, 0.05)), 100, 100);
        assert!(tracker.both_were_closed());
        tracker.process(None, 100, 100);
        assert!(!tracker.both_were_closed());

        // Reappearing with open eyes must not produce the exit tap.
        injector.clear();
        tracker.process(Some(&face_with_openness(0.30, 0.30)), 100, 100);
        assert!(injector.events().is_empty());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (mut tracker, injector, board) = setup();
        tracker.process(Some(&face_with_openness(0.05, 0.30)), 100, 100);

        tracker.reset();
        let once = (board.snapshot(), injector.events(), tracker.both_were_closed());
        tracker.reset();
        let twice = (board.snapshot(), injector.events(), tracker.both_were_closed());

        assert_eq!(once, twice);
        assert_eq!(once.0.left_eye, EyeState::Open);
        assert_eq!(once.0.right_eye, EyeState::Open);
        assert_eq!(once.0.held, HeldKeys::default());
        assert!(!once.2);
        assert_eq!(injector.count(InjectedKey::Up(Key::LeftAction)), 1);
    }

    #[test]
    fn test_truncated_mesh_reads_as_closed() {
        let (mut tracker, _injector, board) = setup();
        let mesh = FaceLandmarks::new(vec![Default::default(); 100]);
        tracker.process(Some(&mesh), 100, 100);
        let status = board.snapshot();
        assert_eq!(status.left_eye, EyeState::Closed);
        assert_eq!(status.right_eye, EyeState::Closed);
    }

    #[test]
    fn test_stopped_tracker_neither_actuates_nor_publishes() {
        let (tracker, injector, board) = setup();
        let running = Arc::new(AtomicBool::new(true));
        let mut tracker = tracker.with_running_flag(Arc::clone(&running));
        tracker.process(Some(&face_with_openness(0.30, 0.30)), 100, 100);

        running.store(false, Ordering::Release);
        board.reset(SessionState::Idle);
        assert_eq!(tracker.process(Some(&face_with_openness(0.05, 0.30)), 100, 100), None);
        tracker.reset();

        assert!(injector.events().is_empty());
        assert_eq!(board.snapshot().session, SessionState::Idle);
    }

    #[test]
    fn test_pulse_ends_with_nothing_held() {
        let (mut tracker, injector, board) = setup();
        let decision = tracker.process(Some(&face_with_openness(0.05, 0.05)), 100, 100);
        assert_eq!(decision, Some(Decision::BothClosedPulse));
        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Down(Key::LeftAction),
                InjectedKey::Down(Key::RightAction),
                InjectedKey::Up(Key::LeftAction),
                InjectedKey::Up(Key::RightAction),
            ]
        );
        assert_eq!(board.snapshot().held, HeldKeys::default());
    }

    #[test]
    fn test_thresholds_change_mid_session() {
        let (mut tracker, _injector, board) = setup();
        tracker.process(Some(&face_with_openness(0.15, 0.30)), 100, 100);
        assert_eq!(board.snapshot().left_eye, EyeState::Closed);

        tracker.set_thresholds(Thresholds::new(0.10, 0.12).unwrap());
        assert_eq!(tracker.thresholds().close(), 0.10);
        tracker.process(Some(&face_with_openness(0.15, 0.30)), 100, 100);
        assert_eq!(board.snapshot().left_eye, EyeState::Open);
    }

    #[test]
    fn test_lock_gate_within_times_out_while_held() {
        let gate = shared_gate(RecordingInjector::new());
        let held = lock_gate(&gate);
        let started = Instant::now();
        assert!(lock_gate_within(&gate, Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
        drop(held);
        assert!(lock_gate_within(&gate, Duration::from_millis(20)).is_some());
    }
}
