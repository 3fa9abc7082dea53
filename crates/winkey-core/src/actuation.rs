//! Key actuation with held-key bookkeeping.
//!
//! The OS-level injection call is fire-and-forget with no readback, so the
//! gate records every command it issues as having taken effect. Failures
//! are logged and never propagated: eye tracking must keep running even
//! when input simulation is unavailable.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The two simulated keys driven by eye state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    /// Held while only the left eye is closed.
    LeftAction,
    /// Held while only the right eye is closed.
    RightAction,
}

impl Key {
    pub const ALL: [Key; 2] = [Key::LeftAction, Key::RightAction];

    fn slot(self) -> usize {
        match self {
            Self::LeftAction => 0,
            Self::RightAction => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeftAction => "left-action",
            Self::RightAction => "right-action",
        }
    }
}

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("failed to run injector command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("injector command '{program}' exited with {status}")]
    ExitStatus { program: String, status: String },
    #[error("injector command '{program}' did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("input injection unavailable: {0}")]
    Unavailable(String),
}

/// Port to the OS input-injection service.
pub trait InputInjector: Send {
    fn key_down(&mut self, key: Key) -> Result<(), InjectError>;
    fn key_up(&mut self, key: Key) -> Result<(), InjectError>;
    /// Press and release in one call.
    fn tap(&mut self, key: Key) -> Result<(), InjectError>;
}

impl<T: InputInjector + ?Sized> InputInjector for Box<T> {
    fn key_down(&mut self, key: Key) -> Result<(), InjectError> {
        (**self).key_down(key)
    }

    fn key_up(&mut self, key: Key) -> Result<(), InjectError> {
        (**self).key_up(key)
    }

    fn tap(&mut self, key: Key) -> Result<(), InjectError> {
        (**self).tap(key)
    }
}

/// Snapshot of which keys the gate believes are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeldKeys {
    pub left_action: bool,
    pub right_action: bool,
}

impl HeldKeys {
    pub fn any(&self) -> bool {
        self.left_action || self.right_action
    }
}

/// Idempotent press/release front-end for an [`InputInjector`].
///
/// Dropping the gate releases every held key.
pub struct ActuationGate<I: InputInjector> {
    injector: I,
    held: [bool; 2],
}

impl<I: InputInjector> ActuationGate<I> {
    pub fn new(injector: I) -> Self {
        Self {
            injector,
            held: [false; 2],
        }
    }

    pub fn is_held(&self, key: Key) -> bool {
        self.held[key.slot()]
    }

    pub fn held(&self) -> HeldKeys {
        HeldKeys {
            left_action: self.held[0],
            right_action: self.held[1],
        }
    }

    /// Press and hold `key`. No-op if already held.
    pub fn hold(&mut self, key: Key) {
        if self.is_held(key) {
            return;
        }
        if let Err(e) = self.injector.key_down(key) {
            tracing::error!(key = key.as_str(), error = %e, "key down failed");
        }
        self.held[key.slot()] = true;
    }

    /// Release `key`. No-op if not held.
    pub fn release(&mut self, key: Key) {
        if !self.is_held(key) {
            return;
        }
        if let Err(e) = self.injector.key_up(key) {
            tracing::error!(key = key.as_str(), error = %e, "key up failed");
        }
        self.held[key.slot()] = false;
    }

    /// Release whichever keys are held. Returns `true` if anything was released.
    pub fn release_all(&mut self) -> bool {
        let any = self.held().any();
        for key in Key::ALL {
            self.release(key);
        }
        any
    }

    /// Single press-and-release of `key`. Does not touch the held state.
    pub fn tap(&mut self, key: Key) {
        if let Err(e) = self.injector.tap(key) {
            tracing::error!(key = key.as_str(), error = %e, "key tap failed");
        }
    }
}

impl<I: InputInjector> Drop for ActuationGate<I> {
    fn drop(&mut self) {
        if self.release_all() {
            tracing::info!("actuation gate dropped: released held keys");
        }
    }
}
