//! Per-eye open/closed state with two-threshold hysteresis.
//!
//! A single cutoff chatters when the openness score hovers near it. Using a
//! lower threshold to close and a higher one to reopen gives a dead zone in
//! which the previous state is kept.

use serde::Serialize;
use thiserror::Error;

/// Default score below which an open eye is considered closed.
pub const DEFAULT_CLOSE_THRESHOLD: f32 = 0.17;
/// Default score above which a closed eye is considered open again.
pub const DEFAULT_OPEN_THRESHOLD: f32 = 0.22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeState {
    #[default]
    Open,
    Closed,
}

impl EyeState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("thresholds must satisfy 0 < close < open < 1 (got close={close}, open={open})")]
    OutOfOrder { close: f32, open: f32 },
}

/// Validated close/open threshold pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    close: f32,
    open: f32,
}

impl Thresholds {
    pub fn new(close: f32, open: f32) -> Result<Self, ThresholdError> {
        // NaN fails every comparison below and is rejected with the rest.
        if 0.0 < close && close < open && open < 1.0 {
            Ok(Self { close, open })
        } else {
            Err(ThresholdError::OutOfOrder { close, open })
        }
    }

    pub fn close(&self) -> f32 {
        self.close
    }

    pub fn open(&self) -> f32 {
        self.open
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            close: DEFAULT_CLOSE_THRESHOLD,
            open: DEFAULT_OPEN_THRESHOLD,
        }
    }
}

/// Hysteresis state machine for one eye. Starts open.
#[derive(Debug, Clone)]
pub struct EyeStateTracker {
    state: EyeState,
    thresholds: Thresholds,
}

impl EyeStateTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            state: EyeState::Open,
            thresholds,
        }
    }

    /// Feed one openness score. Returns `true` if the state changed.
    pub fn update(&mut self, score: f32) -> bool {
        let next = match self.state {
            EyeState::Open if score < self.thresholds.close => EyeState::Closed,
            EyeState::Closed if score > self.thresholds.open => EyeState::Open,
            current => current,
        };
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Force the eye back to open (face lost, session start or stop).
    pub fn reset(&mut self) {
        self.state = EyeState::Open;
    }

    pub fn state(&self) -> EyeState {
        self.state
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Swap thresholds mid-stream. The current state is kept and the new
    /// band applies from the next score.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }
}
