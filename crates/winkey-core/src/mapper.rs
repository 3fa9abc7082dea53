//! Dual-eye action mapping.
//!
//! The pair of per-eye states collapses into a [`CombinedState`]; together
//! with the remembered "both were closed" flag that selects one row of a
//! priority-ordered decision table:
//!
//! | priority | condition                          | decision          |
//! |----------|------------------------------------|-------------------|
//! | 1        | both closed, not previously        | [`Decision::BothClosedPulse`] |
//! | 2        | previously both closed, not now    | [`Decision::ExitBothTap`] |
//! | 3        | left only closed                   | [`Decision::HoldLeft`] |
//! | 4        | right only closed                  | [`Decision::HoldRight`] |
//! | 5        | neither closed                     | [`Decision::ReleaseAll`] |
//! | –        | both closed, previously too        | [`Decision::None`] |

use std::time::Duration;

use serde::Serialize;

use crate::actuation::{ActuationGate, InputInjector, Key};
use crate::hysteresis::EyeState;

/// Default hold time of the both-closed pulse.
pub const DEFAULT_PULSE: Duration = Duration::from_millis(50);

/// Joint status of both eyes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinedState {
    NeitherClosed,
    LeftOnlyClosed,
    RightOnlyClosed,
    BothClosed,
}

impl CombinedState {
    pub fn from_states(left: EyeState, right: EyeState) -> Self {
        match (left, right) {
            (EyeState::Open, EyeState::Open) => Self::NeitherClosed,
            (EyeState::Closed, EyeState::Open) => Self::LeftOnlyClosed,
            (EyeState::Open, EyeState::Closed) => Self::RightOnlyClosed,
            (EyeState::Closed, EyeState::Closed) => Self::BothClosed,
        }
    }
}

/// Row of the decision table selected for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Release anything held, then press both keys together. The caller
    /// releases them once the pulse hold has passed.
    BothClosedPulse,
    /// Tap the left-action key to signal leaving the both-closed state.
    ExitBothTap,
    /// Hold left-action (releasing right-action first).
    HoldLeft,
    /// Hold right-action (releasing left-action first).
    HoldRight,
    /// Release whichever key is held.
    ReleaseAll,
    /// Nothing to do.
    None,
}

/// Pure decision function over the combined state and the remembered flag.
pub fn decide(combined: CombinedState, both_were_closed: bool) -> Decision {
    let both_now = combined == CombinedState::BothClosed;
    match combined {
        _ if both_now && !both_were_closed => Decision::BothClosedPulse,
        _ if both_were_closed && !both_now => Decision::ExitBothTap,
        CombinedState::LeftOnlyClosed => Decision::HoldLeft,
        CombinedState::RightOnlyClosed => Decision::HoldRight,
        CombinedState::NeitherClosed => Decision::ReleaseAll,
        CombinedState::BothClosed => Decision::None,
    }
}

/// Stateful mapper: remembers whether both eyes were closed last frame and
/// drives an [`ActuationGate`] accordingly.
#[derive(Debug, Clone)]
pub struct ActionMapper {
    both_were_closed: bool,
    pulse: Duration,
}

impl ActionMapper {
    pub fn new(pulse: Duration) -> Self {
        Self {
            both_were_closed: false,
            pulse,
        }
    }

    pub fn both_were_closed(&self) -> bool {
        self.both_were_closed
    }

    pub fn reset(&mut self) {
        self.both_were_closed = false;
    }

    /// How long both keys stay down after [`Decision::BothClosedPulse`].
    pub fn pulse(&self) -> Duration {
        self.pulse
    }

    /// Apply one frame's eye states. Returns the decision taken.
    ///
    /// A [`Decision::BothClosedPulse`] leaves both keys held; end it with
    /// [`ActuationGate::release_all`] after [`ActionMapper::pulse`]. The wait
    /// is left to the caller so the gate need not stay locked through it.
    /// Otherwise at most one key is held when this returns.
    pub fn apply<I: InputInjector>(
        &mut self,
        left: EyeState,
        right: EyeState,
        gate: &mut ActuationGate<I>,
    ) -> Decision {
        let combined = CombinedState::from_states(left, right);
        let decision = decide(combined, self.both_were_closed);

        match decision {
            Decision::BothClosedPulse => {
                gate.release_all();
                tracing::info!("both eyes closed: pulsing both keys");
                for key in Key::ALL {
                    gate.hold(key);
                }
                self.both_were_closed = true;
            }
            Decision::ExitBothTap => {
                gate.release_all();
                tracing::info!("both eyes reopened: tapping left-action");
                gate.tap(Key::LeftAction);
                self.both_were_closed = false;
            }
            Decision::HoldLeft => {
                if !gate.is_held(Key::LeftAction) {
                    gate.release(Key::RightAction);
                    tracing::info!("left eye closed: holding left-action");
                    gate.hold(Key::LeftAction);
                }
            }
            Decision::HoldRight => {
                if !gate.is_held(Key::RightAction) {
                    gate.release(Key::LeftAction);
                    tracing::info!("right eye closed: holding right-action");
                    gate.hold(Key::RightAction);
                }
            }
            Decision::ReleaseAll => {
                if gate.release_all() {
                    tracing::info!("both eyes open: released held key");
                }
            }
            Decision::None => {}
        }

        decision
    }
}

impl Default for ActionMapper {
    fn default() -> Self {
        Self::new(DEFAULT_PULSE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InjectedKey, RecordingInjector};
    use EyeState::{Closed, Open};

    fn setup() -> (ActionMapper, ActuationGate<RecordingInjector>, RecordingInjector) {
        let injector = RecordingInjector::new();
        let gate = ActuationGate::new(injector.clone());
        (ActionMapper::new(Duration::ZERO), gate, injector)
    }

    /// One frame, ending any pulse straight away.
    fn step(
        mapper: &mut ActionMapper,
        gate: &mut ActuationGate<RecordingInjector>,
        left: EyeState,
        right: EyeState,
    ) -> Decision {
        let decision = mapper.apply(left, right, gate);
        if decision == Decision::BothClosedPulse {
            gate.release_all();
        }
        decision
    }

    #[test]
    fn test_decision_table_is_total() {
        use CombinedState::*;
        let cases = [
            (NeitherClosed, false, Decision::ReleaseAll),
            (LeftOnlyClosed, false, Decision::HoldLeft),
            (RightOnlyClosed, false, Decision::HoldRight),
            (BothClosed, false, Decision::BothClosedPulse),
            (NeitherClosed, true, Decision::ExitBothTap),
            (LeftOnlyClosed, true, Decision::ExitBothTap),
            (RightOnlyClosed, true, Decision::ExitBothTap),
            (BothClosed, true, Decision::None),
        ];
        for (combined, prev, expected) in cases {
            assert_eq!(decide(combined, prev), expected, "{combined:?} prev={prev}");
        }
    }

    #[test]
    fn test_left_only_holds_left_once() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Open, Open);
        step(&mut mapper, &mut gate, Closed, Open);
        step(&mut mapper, &mut gate, Closed, Open);

        assert_eq!(injector.count(InjectedKey::Down(Key::LeftAction)), 1);
        assert_eq!(injector.count(InjectedKey::Down(Key::RightAction)), 0);
        assert!(gate.is_held(Key::LeftAction));
    }

    #[test]
    fn test_switching_eyes_swaps_held_key() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Closed, Open);
        step(&mut mapper, &mut gate, Open, Closed);

        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Down(Key::LeftAction),
                InjectedKey::Up(Key::LeftAction),
                InjectedKey::Down(Key::RightAction),
            ]
        );
        assert!(!gate.is_held(Key::LeftAction));
        assert!(gate.is_held(Key::RightAction));
    }

    #[test]
    fn test_both_closed_pulses_after_releasing() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Open, Open);
        step(&mut mapper, &mut gate, Closed, Open);
        injector.clear();

        let decision = step(&mut mapper, &mut gate, Closed, Closed);
        assert_eq!(decision, Decision::BothClosedPulse);
        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Up(Key::LeftAction),
                InjectedKey::Down(Key::LeftAction),
                InjectedKey::Down(Key::RightAction),
                InjectedKey::Up(Key::LeftAction),
                InjectedKey::Up(Key::RightAction),
            ]
        );
        assert!(mapper.both_were_closed());
        assert!(!gate.held().any());
    }

    #[test]
    fn test_pulse_holds_both_keys_until_released() {
        let (mut mapper, mut gate, injector) = setup();
        assert_eq!(
            mapper.apply(Closed, Closed, &mut gate),
            Decision::BothClosedPulse
        );
        assert!(gate.is_held(Key::LeftAction));
        assert!(gate.is_held(Key::RightAction));
        assert_eq!(mapper.pulse(), Duration::ZERO);

        assert!(gate.release_all());
        assert_eq!(injector.count(InjectedKey::Up(Key::LeftAction)), 1);
        assert_eq!(injector.count(InjectedKey::Up(Key::RightAction)), 1);
    }

    #[test]
    fn test_both_closed_from_open_is_a_single_pulse() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Open, Open);
        step(&mut mapper, &mut gate, Closed, Closed);
        step(&mut mapper, &mut gate, Closed, Closed);
        step(&mut mapper, &mut gate, Closed, Closed);

        assert_eq!(injector.count(InjectedKey::Down(Key::LeftAction)), 1);
        assert_eq!(injector.count(InjectedKey::Down(Key::RightAction)), 1);
        assert_eq!(injector.count(InjectedKey::Up(Key::LeftAction)), 1);
        assert_eq!(injector.count(InjectedKey::Up(Key::RightAction)), 1);
        assert!(mapper.both_were_closed());
    }

    #[test]
    fn test_reopening_after_both_taps_left_once() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Closed, Closed);
        injector.clear();

        let decision = step(&mut mapper, &mut gate, Open, Open);
        assert_eq!(decision, Decision::ExitBothTap);
        assert_eq!(injector.events(), vec![InjectedKey::Tap(Key::LeftAction)]);
        assert!(!mapper.both_were_closed());

        // Steady open afterwards emits nothing.
        step(&mut mapper, &mut gate, Open, Open);
        assert_eq!(injector.events().len(), 1);
    }

    #[test]
    fn test_both_to_single_eye_taps_then_holds_next_frame() {
        let (mut mapper, mut gate, injector) = setup();
        step(&mut mapper, &mut gate, Closed, Closed);
        injector.clear();

        assert_eq!(step(&mut mapper, &mut gate, Closed, Open), Decision::ExitBothTap);
        assert!(!gate.is_held(Key::LeftAction));
        assert_eq!(step(&mut mapper, &mut gate, Closed, Open), Decision::HoldLeft);
        assert_eq!(
            injector.events(),
            vec![
                InjectedKey::Tap(Key::LeftAction),
                InjectedKey::Down(Key::LeftAction),
            ]
        );
    }

    #[test]
    fn test_at_most_one_key_held() {
        let (mut mapper, mut gate, _injector) = setup();
        let sequence = [
            (Closed, Open),
            (Open, Closed),
            (Closed, Closed),
            (Open, Closed),
            (Open, Closed),
            (Closed, Open),
            (Open, Open),
            (Closed, Open),
        ];
        for (left, right) in sequence {
            step(&mut mapper, &mut gate, left, right);
            let held = gate.held();
            assert!(!(held.left_action && held.right_action));
        }
    }

    #[test]
    fn test_reset_clears_flag() {
        let (mut mapper, mut gate, _injector) = setup();
        step(&mut mapper, &mut gate, Closed, Closed);
        mapper.reset();
        assert!(!mapper.both_were_closed());
    }
}
