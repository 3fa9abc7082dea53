//! Test doubles for the detector and input-injection ports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::actuation::{InjectError, InputInjector, Key};
use crate::detector::{DetectorError, LandmarkDetector};
use crate::landmarks::{FaceLandmarks, Point, LEFT_EYE_CONTOUR, RIGHT_EYE_CONTOUR};

/// One call observed by [`RecordingInjector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedKey {
    Down(Key),
    Up(Key),
    Tap(Key),
}

/// Injector that records every call. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingInjector {
    events: Arc<Mutex<Vec<InjectedKey>>>,
    fail: bool,
    down_delay: Duration,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls but returns an error from each of them.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Each key-down is recorded, then blocks for `delay` before returning,
    /// like an injector stuck on a slow tool.
    pub fn with_key_down_delay(mut self, delay: Duration) -> Self {
        self.down_delay = delay;
        self
    }

    pub fn events(&self) -> Vec<InjectedKey> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of recorded calls equal to `event`.
    pub fn count(&self, event: InjectedKey) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }

    fn record(&self, event: InjectedKey) -> Result<(), InjectError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        if self.fail {
            Err(InjectError::Unavailable("recording injector set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl InputInjector for RecordingInjector {
    fn key_down(&mut self, key: Key) -> Result<(), InjectError> {
        let result = self.record(InjectedKey::Down(key));
        if !self.down_delay.is_zero() {
            std::thread::sleep(self.down_delay);
        }
        result
    }

    fn key_up(&mut self, key: Key) -> Result<(), InjectError> {
        self.record(InjectedKey::Up(key))
    }

    fn tap(&mut self, key: Key) -> Result<(), InjectError> {
        self.record(InjectedKey::Tap(key))
    }
}

/// Detector that replays a fixed script, then reports the fallback
/// outcome forever. Clones share the script.
#[derive(Clone)]
pub struct ScriptedDetector {
    script: Arc<Mutex<VecDeque<Option<FaceLandmarks>>>>,
    fallback: Option<FaceLandmarks>,
    calls: Arc<Mutex<usize>>,
    slow_call: Option<(usize, Duration)>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Option<FaceLandmarks>>, fallback: Option<FaceLandmarks>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback,
            calls: Arc::default(),
            slow_call: None,
        }
    }

    /// Make the `call`-th detection (counting from 1) take `delay`.
    pub fn with_slow_call(mut self, call: usize, delay: Duration) -> Self {
        self.slow_call = Some((call, delay));
        self
    }

    /// Always reports the same face.
    pub fn constant(face: Option<FaceLandmarks>) -> Self {
        Self::new(Vec::new(), face)
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LandmarkDetector for ScriptedDetector {
    fn detect(
        &mut self,
        _rgb: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Option<FaceLandmarks>, DetectorError> {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            *calls += 1;
            *calls
        };
        if let Some((slow, delay)) = self.slow_call {
            if call == slow {
                std::thread::sleep(delay);
            }
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Build a 468-point mesh whose eyes have the requested openness scores.
///
/// Each eye is drawn with a horizontal span of 0.1 (normalized) so that a
/// square frame reproduces the scores exactly.
pub fn face_with_openness(left: f32, right: f32) -> FaceLandmarks {
    let mut points = vec![Point::new(0.5, 0.5); 468];
    place_eye(&mut points, &LEFT_EYE_CONTOUR, 0.6, left);
    place_eye(&mut points, &RIGHT_EYE_CONTOUR, 0.3, right);
    FaceLandmarks::new(points)
}

fn place_eye(points: &mut [Point], indices: &[usize; 6], x0: f32, score: f32) {
    const SPAN: f32 = 0.1;
    let y = 0.4;
    // Both lid gaps equal `score * SPAN` gives (g + g) / (2 * SPAN) = score.
    let half_gap = score * SPAN / 2.0;
    let xs = [x0, x0 + SPAN / 3.0, x0 + 2.0 * SPAN / 3.0, x0 + SPAN];
    points[indices[0]] = Point::new(xs[0], y);
    points[indices[1]] = Point::new(xs[1], y - half_gap);
    points[indices[2]] = Point::new(xs[2], y - half_gap);
    points[indices[3]] = Point::new(xs[3], y);
    points[indices[4]] = Point::new(xs[2], y + half_gap);
    points[indices[5]] = Point::new(xs[1], y + half_gap);
}
