//! Camera sessions.
//!
//! A session is one frame acquisition worker thread holding the camera
//! through a [`CameraLease`]. Preview sessions only relay frames for display;
//! tracking sessions also run the landmark detector and drive the keys.
//! At most one worker exists at a time, and starting tracking always stops
//! the preview first.
//!
//! Workers are cancelled cooperatively: the controller clears the running
//! flag, which the worker checks once per loop, then waits up to the join
//! timeout. Camera release and key release happen whether or not the worker
//! exits in time. A worker that outlives its stop can no longer press keys
//! or publish status, since its tracker shares the same running flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use winkey_core::{
    lock_gate_within, DetectorError, DisplayRelay, Eye, EyeTracker, FaceLandmarks, InputInjector,
    LandmarkDetector, SessionState, SharedGate, StatusBoard, ThresholdError, Thresholds,
};
use winkey_hw::{
    CameraBackend, CameraError, CameraGuard, CameraLease, CaptureRequest, Frame, SessionKind,
};

use crate::config::Config;
use crate::engine::EngineError;

/// Builds a fresh landmark detector for each tracking session.
pub type DetectorFactory =
    Box<dyn Fn() -> Result<Box<dyn LandmarkDetector>, DetectorError> + Send + Sync>;

/// Shortest wait for the gate when cleaning up after a stop.
const MIN_GATE_WAIT: Duration = Duration::from_millis(50);

const LANDMARK_COLOR: [u8; 3] = [0, 255, 0];

/// Session tuning. See [`SessionController::apply_settings`] for which
/// fields reach a running session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub thresholds: Thresholds,
    pub pulse: Duration,
    pub process_interval: u32,
    pub min_frame_interval: Duration,
    pub read_backoff: Duration,
    /// 0 retries forever.
    pub max_read_failures: u32,
    pub join_timeout: Duration,
    /// Mark eye contours on relayed tracking frames.
    pub show_landmarks: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self, ThresholdError> {
        Ok(Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            thresholds: config.thresholds()?,
            pulse: config.pulse(),
            process_interval: config.process_interval.max(1),
            min_frame_interval: config.min_frame_interval(),
            read_backoff: config.read_backoff(),
            max_read_failures: config.max_read_failures,
            join_timeout: config.join_timeout(),
            show_landmarks: config.show_landmarks,
        })
    }

    fn same_capture_format(&self, other: &Self) -> bool {
        (self.width, self.height, self.fps) == (other.width, other.height, other.fps)
    }

    fn request(&self, index: u32) -> CaptureRequest {
        CaptureRequest {
            index,
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}

/// The part of [`SessionSettings`] a running worker rereads every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LiveTuning {
    thresholds: Thresholds,
    process_interval: u32,
    min_frame_interval: Duration,
    show_landmarks: bool,
}

impl From<&SessionSettings> for LiveTuning {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            thresholds: settings.thresholds,
            process_interval: settings.process_interval,
            min_frame_interval: settings.min_frame_interval,
            show_landmarks: settings.show_landmarks,
        }
    }
}

type SharedTuning = Arc<RwLock<LiveTuning>>;

fn read_tuning(tuning: &SharedTuning) -> LiveTuning {
    *tuning.read().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the controller, its workers and the display loop.
#[derive(Clone)]
pub struct SessionShared {
    pub guard: CameraGuard,
    pub relay: DisplayRelay<Frame>,
    pub status: StatusBoard,
    display: Arc<AtomicBool>,
}

impl SessionShared {
    pub fn new(display_enabled: bool) -> Self {
        Self {
            guard: CameraGuard::new(),
            relay: DisplayRelay::new(),
            status: StatusBoard::new(),
            display: Arc::new(AtomicBool::new(display_enabled)),
        }
    }

    pub fn display_enabled(&self) -> bool {
        self.display.load(Ordering::Relaxed)
    }
}

struct Worker {
    kind: SessionKind,
    camera: u32,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    /// Disconnects when the worker thread exits, including by panic.
    exited: mpsc::Receiver<()>,
}

/// Starts and stops camera sessions. Owned by a single control thread.
pub struct SessionController<I: InputInjector + 'static> {
    settings: SessionSettings,
    tuning: SharedTuning,
    backend: Box<dyn CameraBackend>,
    detectors: DetectorFactory,
    gate: SharedGate<I>,
    shared: SessionShared,
    worker: Option<Worker>,
    sessions_started: u64,
}

impl<I: InputInjector + 'static> SessionController<I> {
    pub fn new(
        settings: SessionSettings,
        backend: Box<dyn CameraBackend>,
        detectors: DetectorFactory,
        gate: SharedGate<I>,
        shared: SessionShared,
    ) -> Self {
        Self {
            settings,
            tuning: Arc::new(RwLock::new(LiveTuning::from(&settings))),
            backend,
            detectors,
            gate,
            shared,
            worker: None,
            sessions_started: 0,
        }
    }

    pub fn state(&mut self) -> SessionState {
        self.reap();
        match self.worker.as_ref().map(|w| w.kind) {
            Some(SessionKind::Preview) => SessionState::Preview,
            Some(SessionKind::Tracking) => SessionState::Tracking,
            None => SessionState::Idle,
        }
    }

    /// Start relaying frames from `camera` for display.
    ///
    /// Restarts a running preview; refused while tracking.
    pub fn start_preview(&mut self, camera: u32) -> Result<(), EngineError> {
        match self.state() {
            SessionState::Tracking => return Err(EngineError::TrackingActive),
            SessionState::Preview => {
                self.stop_worker();
            }
            SessionState::Idle => {}
        }

        let lease = self.shared.guard.acquire(
            SessionKind::Preview,
            self.backend.as_ref(),
            &self.settings.request(camera),
        )?;
        self.shared.status.reset(SessionState::Preview);
        self.spawn(camera, lease, None)
    }

    /// Start eye tracking on `camera`, stopping any preview first.
    ///
    /// The detector is built before the preview is touched, so a model that
    /// fails to load leaves the preview running.
    pub fn start_tracking(&mut self, camera: u32) -> Result<(), EngineError> {
        if self.state() == SessionState::Tracking {
            return Err(EngineError::TrackingActive);
        }

        let detector = (self.detectors)()?;
        tracing::info!("landmark detector ready");

        self.stop_worker();
        let lease = self.shared.guard.acquire(
            SessionKind::Tracking,
            self.backend.as_ref(),
            &self.settings.request(camera),
        )?;
        let tracker = EyeTracker::new(
            self.settings.thresholds,
            self.settings.pulse,
            Arc::clone(&self.gate),
            self.shared.status.clone(),
        );
        self.spawn(
            camera,
            lease,
            Some(Pipeline {
                tracker,
                detector,
                failing: false,
            }),
        )
    }

    /// Stop the preview, if one is running.
    pub fn stop_preview(&mut self) -> bool {
        if self.state() != SessionState::Preview {
            return false;
        }
        self.stop_worker()
    }

    /// Stop tracking, if it is running. The preview comes back on the same
    /// camera when display is enabled.
    pub fn stop_tracking(&mut self) -> bool {
        if self.state() != SessionState::Tracking {
            return false;
        }
        let camera = self.worker.as_ref().map_or(0, |w| w.camera);
        self.stop_worker();

        if self.shared.display_enabled() {
            if let Err(e) = self.start_preview(camera) {
                tracing::warn!(camera, error = %e, "could not restart preview after tracking");
            }
        }
        true
    }

    pub fn set_display(&mut self, enabled: bool) {
        self.shared.display.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.shared.relay.clear();
        }
        tracing::info!(enabled, "display relay toggled");
    }

    /// Adopt new settings.
    ///
    /// Thresholds, processing interval, frame pacing and landmark marking
    /// reach the running worker on its next frame, and the join timeout
    /// applies to the next stop. A different capture size or rate restarts
    /// the running session on the same camera. Everything else applies from
    /// the next session start. Returns whether a session was restarted.
    pub fn apply_settings(&mut self, settings: SessionSettings) -> Result<bool, EngineError> {
        let reformat = !self.settings.same_capture_format(&settings);
        self.settings = settings;
        *self.tuning.write().unwrap_or_else(PoisonError::into_inner) = LiveTuning::from(&settings);
        tracing::info!(
            close = settings.thresholds.close(),
            open = settings.thresholds.open(),
            process_interval = settings.process_interval,
            reformat,
            "session settings updated"
        );

        self.reap();
        if !reformat {
            return Ok(false);
        }
        let Some((kind, camera)) = self.worker.as_ref().map(|w| (w.kind, w.camera)) else {
            return Ok(false);
        };
        tracing::info!(
            session = %kind,
            camera,
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            "capture format changed; restarting session"
        );
        self.stop_worker();
        match kind {
            SessionKind::Preview => self.start_preview(camera)?,
            SessionKind::Tracking => self.start_tracking(camera)?,
        }
        Ok(true)
    }

    /// Stop everything and make sure no key or camera is left held.
    /// Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        tracing::info!("session controller shutting down");
        self.stop_worker();
        match lock_gate_within(&self.gate, self.settings.join_timeout) {
            Some(mut gate) => {
                if gate.release_all() {
                    tracing::warn!("shutdown: released held keys");
                }
            }
            None => tracing::error!("shutdown: key injection still busy; keys may stay held"),
        }
        for kind in [SessionKind::Preview, SessionKind::Tracking] {
            self.shared.guard.release(kind);
        }
        self.shared.relay.clear();
        self.shared.status.reset(SessionState::Idle);
    }

    fn spawn(
        &mut self,
        camera: u32,
        lease: CameraLease,
        pipeline: Option<Pipeline<I>>,
    ) -> Result<(), EngineError> {
        self.sessions_started += 1;
        let kind = lease.kind();
        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = mpsc::channel::<()>();
        let pipeline = pipeline.map(|p| Pipeline {
            tracker: p.tracker.with_running_flag(Arc::clone(&running)),
            ..p
        });
        let ctx = WorkerContext {
            running: Arc::clone(&running),
            settings: self.settings,
            tuning: Arc::clone(&self.tuning),
            shared: self.shared.clone(),
            lease,
            pipeline,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("winkey-{}-{}", kind.as_str(), self.sessions_started))
            .spawn(move || {
                let _exit = exit_tx;
                ctx.run();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The lease went down with the closure, releasing the camera.
                self.shared.status.reset(SessionState::Idle);
                return Err(EngineError::Spawn(e));
            }
        };

        tracing::info!(session = %kind, camera, "session started");
        self.worker = Some(Worker {
            kind,
            camera,
            running,
            handle,
            exited,
        });
        Ok(())
    }

    /// Stop the current worker. Returns `false` if there was none.
    fn stop_worker(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };
        let kind = worker.kind;
        tracing::info!(session = %kind, camera = worker.camera, "stopping session");
        worker.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.settings.join_timeout;
        match worker.exited.recv_timeout(self.settings.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    session = %kind,
                    timeout_ms = self.settings.join_timeout.as_millis() as u64,
                    "worker did not exit in time; forcing cleanup"
                );
            }
            _ => {
                if worker.handle.join().is_err() {
                    tracing::error!(session = %kind, "worker thread panicked");
                }
            }
        }

        self.force_cleanup(kind, deadline);
        tracing::info!(session = %kind, "session stopped");
        true
    }

    /// Collect a worker that ended by itself (e.g. the camera died).
    fn reap(&mut self) {
        if !self.worker.as_ref().is_some_and(|w| w.handle.is_finished()) {
            return;
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.handle.join().is_err() {
            tracing::error!(session = %worker.kind, "worker thread panicked");
        }
        self.force_cleanup(worker.kind, Instant::now() + self.settings.join_timeout);
        tracing::info!(session = %worker.kind, "session ended");
    }

    /// Release the camera and keys and mark the session idle.
    ///
    /// Waits for the gate until `deadline` (at least [`MIN_GATE_WAIT`]). If
    /// a stuck worker still holds it then, its keys are released when its
    /// injector call returns and it notices the cleared running flag.
    fn force_cleanup(&self, kind: SessionKind, deadline: Instant) {
        if self.shared.guard.release(kind) {
            tracing::warn!(session = %kind, "camera still held after worker exit; released");
        }
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .max(MIN_GATE_WAIT);
        match lock_gate_within(&self.gate, wait) {
            Some(mut gate) => {
                if gate.release_all() {
                    tracing::warn!(session = %kind, "keys still held after worker exit; released");
                }
                // Under the gate lock, so no late publish can follow it.
                self.shared.status.reset(SessionState::Idle);
            }
            None => {
                tracing::error!(
                    session = %kind,
                    wait_ms = wait.as_millis() as u64,
                    "key injection still busy; leaving key release to the worker"
                );
                self.shared.status.reset(SessionState::Idle);
            }
        }
    }
}

impl<I: InputInjector + 'static> Drop for SessionController<I> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

/// Detector plus tracking state, present only in tracking sessions.
struct Pipeline<I: InputInjector> {
    tracker: EyeTracker<I>,
    detector: Box<dyn LandmarkDetector>,
    /// Inside a streak of detector errors.
    failing: bool,
}

impl<I: InputInjector> Pipeline<I> {
    fn retune(&mut self, thresholds: Thresholds) {
        if self.tracker.thresholds() != thresholds {
            tracing::info!(
                close = thresholds.close(),
                open = thresholds.open(),
                "thresholds updated"
            );
            self.tracker.set_thresholds(thresholds);
        }
    }

    /// Run detection and tracking on one frame; returns the face, if any.
    fn process(&mut self, frame: &Frame) -> Option<FaceLandmarks> {
        let face = match self.detector.detect(&frame.data, frame.width, frame.height) {
            Ok(face) => {
                if self.failing {
                    tracing::debug!("landmark detection recovered");
                    self.failing = false;
                }
                face
            }
            Err(e) => {
                if !self.failing {
                    tracing::warn!(error = %e, "landmark detection failed; treating as no face");
                    self.failing = true;
                }
                None
            }
        };
        self.tracker.process(face.as_ref(), frame.width, frame.height);
        face
    }
}

fn mark_eyes(frame: &mut Frame, face: &FaceLandmarks) {
    let points: Vec<(f32, f32)> = [Eye::Left, Eye::Right]
        .into_iter()
        .flat_map(|eye| face.eye_contour(eye, frame.width, frame.height))
        .map(|p| (p.x, p.y))
        .collect();
    frame.mark_points(&points, LANDMARK_COLOR);
}

struct WorkerContext<I: InputInjector> {
    running: Arc<AtomicBool>,
    settings: SessionSettings,
    tuning: SharedTuning,
    shared: SessionShared,
    lease: CameraLease,
    pipeline: Option<Pipeline<I>>,
}

fn non_empty(frame: Frame) -> Result<Frame, CameraError> {
    if frame.is_valid() {
        Ok(frame)
    } else {
        Err(CameraError::Read("empty frame".into()))
    }
}

fn should_process(frame_index: u64, interval: u32) -> bool {
    frame_index % u64::from(interval.max(1)) == 0
}

impl<I: InputInjector> WorkerContext<I> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn run(mut self) {
        let kind = self.lease.kind();
        tracing::info!(session = %kind, format = %self.lease.format(), "worker running");
        let mut frames = 0u64;
        let mut failures = 0u32;
        let mut last_read: Option<Instant> = None;

        while self.is_running() {
            let tuning = read_tuning(&self.tuning);
            if let Some(last) = last_read {
                let elapsed = last.elapsed();
                if elapsed < tuning.min_frame_interval {
                    std::thread::sleep(tuning.min_frame_interval - elapsed);
                    continue;
                }
            }
            last_read = Some(Instant::now());

            let mut frame = match self.lease.read_frame().and_then(non_empty) {
                Ok(frame) => frame,
                Err(CameraError::NotOpen(_)) => {
                    tracing::warn!(session = %kind, "camera released under the worker");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        tracing::warn!(session = %kind, error = %e, "camera read failed; retrying");
                    }
                    let cap = self.settings.max_read_failures;
                    if cap > 0 && failures >= cap {
                        tracing::error!(
                            session = %kind,
                            failures,
                            "camera unusable; ending session"
                        );
                        break;
                    }
                    std::thread::sleep(self.settings.read_backoff);
                    continue;
                }
            };
            if failures > 0 {
                tracing::debug!(session = %kind, failures, "camera read recovered");
                failures = 0;
            }

            frame.mirror_horizontal();
            // A stop may have come in while the read blocked.
            if !self.is_running() {
                break;
            }
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.retune(tuning.thresholds);
                if should_process(frames, tuning.process_interval) {
                    let face = pipeline.process(&frame);
                    if let Some(face) = face.filter(|_| tuning.show_landmarks) {
                        mark_eyes(&mut frame, &face);
                    }
                }
            }
            frames += 1;

            if self.shared.display_enabled() && self.is_running() {
                self.shared.relay.push(frame);
            }
        }

        self.finish(kind, frames);
    }

    fn finish(self, kind: SessionKind, frames: u64) {
        // Still set means nobody asked us to stop.
        let ended_itself = self.is_running();

        if let Some(mut pipeline) = self.pipeline {
            pipeline.tracker.reset();
            drop(pipeline.detector);
            tracing::debug!(session = %kind, "landmark detector released");
        }
        self.lease.release();
        if ended_itself {
            self.shared.status.reset(SessionState::Idle);
        }
        tracing::info!(session = %kind, frames, "worker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winkey_core::testing::{face_with_openness, InjectedKey, RecordingInjector, ScriptedDetector};
    use winkey_core::{shared_gate, Key};
    use winkey_hw::testing::MockBackend;

    fn settings() -> SessionSettings {
        SessionSettings {
            width: 64,
            height: 64,
            fps: 30,
            thresholds: Thresholds::default(),
            pulse: Duration::ZERO,
            process_interval: 1,
            min_frame_interval: Duration::ZERO,
            read_backoff: Duration::from_millis(1),
            max_read_failures: 0,
            join_timeout: Duration::from_secs(2),
            show_landmarks: false,
        }
    }

    fn factory(detector: ScriptedDetector) -> DetectorFactory {
        Box::new(move || -> Result<Box<dyn LandmarkDetector>, DetectorError> {
            Ok(Box::new(detector.clone()))
        })
    }

    struct Rig {
        controller: SessionController<RecordingInjector>,
        backend: MockBackend,
        injector: RecordingInjector,
        shared: SessionShared,
    }

    fn rig_with(
        backend: MockBackend,
        detectors: DetectorFactory,
        settings: SessionSettings,
        display: bool,
    ) -> Rig {
        rig_with_injector(backend, detectors, settings, display, RecordingInjector::new())
    }

    fn rig_with_injector(
        backend: MockBackend,
        detectors: DetectorFactory,
        settings: SessionSettings,
        display: bool,
        injector: RecordingInjector,
    ) -> Rig {
        let shared = SessionShared::new(display);
        let controller = SessionController::new(
            settings,
            Box::new(backend.clone()),
            detectors,
            shared_gate(injector.clone()),
            shared.clone(),
        );
        Rig {
            controller,
            backend,
            injector,
            shared,
        }
    }

    fn rig(detector: ScriptedDetector) -> Rig {
        rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(detector),
            settings(),
            true,
        )
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn left_wink() -> ScriptedDetector {
        ScriptedDetector::constant(Some(face_with_openness(0.05, 0.30)))
    }

    #[test]
    fn test_preview_relays_frames_and_stops() {
        let mut rig = rig(ScriptedDetector::constant(None));
        rig.controller.start_preview(0).unwrap();
        assert_eq!(rig.controller.state(), SessionState::Preview);
        assert_eq!(rig.shared.guard.holder(), Some(SessionKind::Preview));
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Preview);

        let relay = rig.shared.relay.clone();
        wait_until("a relayed frame", || !relay.is_empty());

        assert!(rig.controller.stop_preview());
        assert!(!rig.controller.stop_preview());
        assert_eq!(rig.backend.open_handles(), 0);
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);
    }

    #[test]
    fn test_tracking_replaces_preview() {
        let mut rig = rig(ScriptedDetector::constant(None));
        rig.controller.start_preview(0).unwrap();
        rig.controller.start_tracking(0).unwrap();

        assert_eq!(rig.controller.state(), SessionState::Tracking);
        assert_eq!(rig.shared.guard.holder(), Some(SessionKind::Tracking));
        assert_eq!(rig.backend.open_handles(), 1);
        assert_eq!(rig.backend.max_concurrent_handles(), 1);

        let status = rig.shared.status.clone();
        wait_until("a processed frame", || status.snapshot().frames_processed > 0);
        assert_eq!(status.snapshot().session, SessionState::Tracking);

        assert!(matches!(
            rig.controller.start_tracking(0),
            Err(EngineError::TrackingActive)
        ));
        assert!(matches!(
            rig.controller.start_preview(0),
            Err(EngineError::TrackingActive)
        ));
    }

    #[test]
    fn test_rapid_session_cycles_never_double_open() {
        let mut rig = rig(ScriptedDetector::constant(None));
        for _ in 0..100 {
            rig.controller.start_preview(0).unwrap();
            rig.controller.start_tracking(0).unwrap();
            assert!(rig.controller.stop_tracking());
            assert_eq!(rig.controller.state(), SessionState::Preview);
            assert!(rig.controller.stop_preview());
            assert_eq!(rig.backend.open_handles(), 0);
        }
        assert_eq!(rig.backend.max_concurrent_handles(), 1);
        assert_eq!(rig.backend.open_calls(), 300);
    }

    #[test]
    fn test_left_wink_holds_left_key_once() {
        let mut rig = rig(left_wink());
        rig.controller.start_tracking(0).unwrap();

        let injector = rig.injector.clone();
        wait_until("left key down", || {
            injector.count(InjectedKey::Down(Key::LeftAction)) == 1
        });
        let status = rig.shared.status.clone();
        let seen = status.snapshot().frames_processed;
        wait_until("more frames", || status.snapshot().frames_processed > seen + 3);

        assert_eq!(injector.count(InjectedKey::Down(Key::LeftAction)), 1);
        assert_eq!(injector.count(InjectedKey::Down(Key::RightAction)), 0);
        assert!(status.snapshot().held.left_action);
    }

    #[test]
    fn test_shutdown_releases_held_key_exactly_once() {
        let mut rig = rig(left_wink());
        rig.controller.start_tracking(0).unwrap();
        let injector = rig.injector.clone();
        wait_until("left key down", || {
            injector.count(InjectedKey::Down(Key::LeftAction)) == 1
        });

        rig.controller.shutdown();
        assert_eq!(injector.count(InjectedKey::Up(Key::LeftAction)), 1);
        assert_eq!(rig.backend.open_handles(), 0);
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);

        rig.controller.shutdown();
        assert_eq!(injector.count(InjectedKey::Up(Key::LeftAction)), 1);
    }

    #[test]
    fn test_face_loss_releases_keys() {
        let closed = face_with_openness(0.05, 0.30);
        let detector = ScriptedDetector::new(vec![Some(closed); 3], None);
        let mut rig = rig(detector);
        rig.controller.start_tracking(0).unwrap();

        let injector = rig.injector.clone();
        wait_until("left key released", || {
            injector.count(InjectedKey::Up(Key::LeftAction)) == 1
        });
        let status = rig.shared.status.clone();
        wait_until("face lost", || !status.snapshot().face_visible);
        assert_eq!(injector.count(InjectedKey::Down(Key::LeftAction)), 1);
        assert!(!status.snapshot().held.any());
    }

    #[test]
    fn test_camera_open_failure_spawns_nothing() {
        let mut rig = rig_with(
            MockBackend::new(64, 64).failing_open(),
            factory(ScriptedDetector::constant(None)),
            settings(),
            true,
        );
        let err = rig.controller.start_tracking(0).unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::Open { .. })));
        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.shared.guard.open_count(), 0);
        assert!(rig.injector.events().is_empty());
    }

    #[test]
    fn test_detector_failure_keeps_preview() {
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            Box::new(|| -> Result<Box<dyn LandmarkDetector>, DetectorError> {
                Err(DetectorError::Unavailable("no model".into()))
            }),
            settings(),
            true,
        );
        rig.controller.start_preview(0).unwrap();
        let err = rig.controller.start_tracking(0).unwrap_err();
        assert!(matches!(err, EngineError::Detector(_)));
        assert_eq!(rig.controller.state(), SessionState::Preview);
        assert_eq!(rig.backend.open_calls(), 1);
    }

    #[test]
    fn test_dead_camera_ends_session() {
        let mut rig = rig_with(
            MockBackend::new(64, 64).failing_reads_after(3),
            factory(ScriptedDetector::constant(None)),
            SessionSettings {
                max_read_failures: 5,
                ..settings()
            },
            true,
        );
        rig.controller.start_preview(0).unwrap();

        let backend = rig.backend.clone();
        wait_until("camera released", || backend.open_handles() == 0);
        let status = rig.shared.status.clone();
        wait_until("idle status", || status.snapshot().session == SessionState::Idle);
        let controller = &mut rig.controller;
        wait_until("worker reaped", || controller.state() == SessionState::Idle);
        assert_eq!(rig.backend.read_calls(), 8);
    }

    #[test]
    fn test_stop_tracking_restarts_preview_when_displaying() {
        let mut rig = rig(ScriptedDetector::constant(None));
        rig.controller.start_tracking(2).unwrap();
        assert!(rig.controller.stop_tracking());
        assert_eq!(rig.controller.state(), SessionState::Preview);

        rig.controller.set_display(false);
        rig.controller.stop_preview();
        rig.controller.start_tracking(2).unwrap();
        assert!(rig.controller.stop_tracking());
        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.backend.open_handles(), 0);
    }

    #[test]
    fn test_display_disabled_relays_nothing() {
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(ScriptedDetector::constant(None)),
            settings(),
            false,
        );
        rig.controller.start_tracking(0).unwrap();
        let status = rig.shared.status.clone();
        wait_until("processed frames", || status.snapshot().frames_processed >= 3);
        assert!(rig.shared.relay.is_empty());
    }

    #[test]
    fn test_process_interval_skips_frames() {
        let detector = ScriptedDetector::constant(None);
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(detector.clone()),
            SessionSettings {
                process_interval: 3,
                ..settings()
            },
            false,
        );
        rig.controller.start_tracking(0).unwrap();
        let backend = rig.backend.clone();
        wait_until("ten frames", || backend.read_calls() >= 10);
        assert!(rig.controller.stop_tracking());

        // Every read was a good frame; frames 0, 3, 6, ... went to the
        // detector, except possibly the last one if the stop beat it.
        let expected = (rig.backend.read_calls() + 2) / 3;
        let calls = detector.calls();
        assert!(calls == expected || calls + 1 == expected, "{calls} of {expected}");
    }

    #[test]
    fn test_worker_outliving_its_stop_presses_nothing() {
        let open = face_with_openness(0.30, 0.30);
        let closed = face_with_openness(0.05, 0.30);
        let detector = ScriptedDetector::new(vec![Some(open)], Some(closed))
            .with_slow_call(2, Duration::from_millis(600));
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(detector.clone()),
            SessionSettings {
                join_timeout: Duration::from_millis(50),
                ..settings()
            },
            false,
        );
        rig.controller.start_tracking(0).unwrap();
        wait_until("the slow detection", || detector.calls() >= 2);

        assert!(rig.controller.stop_tracking());
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);

        // The detector returns a wink after the stop; it must go nowhere.
        std::thread::sleep(Duration::from_millis(900));
        assert!(rig.injector.events().is_empty(), "{:?}", rig.injector.events());
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);
        assert!(!rig.shared.status.snapshot().held.any());
        assert_eq!(rig.backend.open_handles(), 0);
    }

    #[test]
    fn test_stop_is_bounded_while_injector_hangs() {
        let injector = RecordingInjector::new().with_key_down_delay(Duration::from_millis(1500));
        let mut rig = rig_with_injector(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(left_wink()),
            SessionSettings {
                join_timeout: Duration::from_millis(50),
                ..settings()
            },
            false,
            injector,
        );
        rig.controller.start_tracking(0).unwrap();
        let injector = rig.injector.clone();
        wait_until("left key down started", || {
            injector.count(InjectedKey::Down(Key::LeftAction)) == 1
        });

        let started = Instant::now();
        assert!(rig.controller.stop_tracking());
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert_eq!(rig.controller.state(), SessionState::Idle);
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);
        assert_eq!(rig.backend.open_handles(), 0);

        // Once the press returns, the worker lets the key go on its way out.
        wait_until("left key released", || {
            injector.count(InjectedKey::Up(Key::LeftAction)) == 1
        });
        assert_eq!(injector.count(InjectedKey::Down(Key::LeftAction)), 1);
        assert_eq!(rig.shared.status.snapshot().session, SessionState::Idle);
    }

    #[test]
    fn test_thresholds_apply_to_running_tracker() {
        let loose = Thresholds::new(0.10, 0.20).unwrap();
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(ScriptedDetector::constant(Some(face_with_openness(0.12, 0.30)))),
            SessionSettings {
                thresholds: loose,
                ..settings()
            },
            false,
        );
        rig.controller.start_tracking(0).unwrap();
        let status = rig.shared.status.clone();
        wait_until("processed frames", || status.snapshot().frames_processed >= 5);
        assert!(rig.injector.events().is_empty());

        // 0.12 is below the default close threshold.
        assert!(!rig.controller.apply_settings(settings()).unwrap());
        let injector = rig.injector.clone();
        wait_until("left key down", || {
            injector.count(InjectedKey::Down(Key::LeftAction)) == 1
        });
        assert_eq!(rig.controller.state(), SessionState::Tracking);
        assert_eq!(rig.backend.open_calls(), 1);
    }

    #[test]
    fn test_capture_format_change_restarts_session() {
        let mut rig = rig(ScriptedDetector::constant(None));
        assert!(!rig
            .controller
            .apply_settings(SessionSettings {
                width: 32,
                ..settings()
            })
            .unwrap());
        assert_eq!(rig.backend.open_calls(), 0);

        rig.controller.start_preview(1).unwrap();
        assert!(rig.controller.apply_settings(settings()).unwrap());
        assert_eq!(rig.controller.state(), SessionState::Preview);
        assert_eq!(rig.backend.open_calls(), 2);
        assert_eq!(rig.backend.open_handles(), 1);

        assert!(!rig.controller.apply_settings(settings()).unwrap());
        assert_eq!(rig.backend.open_calls(), 2);

        rig.controller.start_tracking(1).unwrap();
        assert!(rig
            .controller
            .apply_settings(SessionSettings {
                fps: 15,
                ..settings()
            })
            .unwrap());
        assert_eq!(rig.controller.state(), SessionState::Tracking);
        assert_eq!(rig.backend.max_concurrent_handles(), 1);
    }

    #[test]
    fn test_relayed_tracking_frames_mark_eyes() {
        let mut rig = rig_with(
            MockBackend::new(64, 64).with_frame_delay(Duration::from_millis(1)),
            factory(ScriptedDetector::constant(Some(face_with_openness(0.30, 0.30)))),
            SessionSettings {
                show_landmarks: true,
                ..settings()
            },
            true,
        );
        rig.controller.start_tracking(0).unwrap();
        let relay = rig.shared.relay.clone();
        wait_until("a relayed frame", || !relay.is_empty());
        let frame = relay.pop().unwrap();

        // Outer corner of the left eye sits at (0.6, 0.4) of a 64x64 frame.
        let at = (26 * 64 + 38) * 3;
        assert_eq!(&frame.data[at..at + 3], &LANDMARK_COLOR);
        assert_eq!(&frame.data[..3], &[128, 128, 128]);
    }

    #[test]
    fn test_should_process() {
        let picked: Vec<u64> = (0..7).filter(|i| should_process(*i, 3)).collect();
        assert_eq!(picked, vec![0, 3, 6]);
        assert!(should_process(5, 1));
        assert!(should_process(5, 0));
    }
}
