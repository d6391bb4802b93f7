//! Turn-taking policy: when a live capture stops and becomes a submission.
//!
//! Two mutually exclusive strategies exist per session. `SilenceDetect`
//! drives the gate below with per-frame VAD labels; `PushToTalk` bypasses
//! it entirely and submits only on the user's explicit action.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::vad::VadDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStrategy {
    /// Close the turn automatically after sustained silence.
    SilenceDetect,
    /// Close the turn only on explicit user action.
    PushToTalk,
}

/// Why the gate closed the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReason {
    Silence,
    MaxDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Submit(SubmitReason),
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Continuous silence required to close the turn.
    pub window: Duration,
    /// Minimum capture age before silence may close the turn.
    pub min_capture: Duration,
    /// Capture age at which the turn closes regardless of activity.
    pub max_capture: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2000),
            min_capture: Duration::from_millis(200),
            max_capture: Duration::from_secs(30),
        }
    }
}

/// Silence-window state machine for one capture.
///
/// Holds at most one pending window (`below_since`); any speech frame
/// cancels it, and no new window opens until silence is heard again.
/// Uncertain frames cancel the window too, so a glitching device cannot
/// close a turn. Silence can close the turn only after speech has been
/// heard and the minimum capture age has passed, so a quiet room never
/// auto-submits. Once the gate fires it stays closed; the caller builds a
/// fresh gate per capture.
#[derive(Debug)]
pub struct SilenceGate {
    cfg: GateConfig,
    begun_at: Instant,
    speech_seen: bool,
    below_since: Option<Instant>,
    fired: bool,
}

impl SilenceGate {
    pub fn new(cfg: GateConfig, now: Instant) -> Self {
        Self {
            cfg,
            begun_at: now,
            speech_seen: false,
            below_since: None,
            fired: false,
        }
    }

    /// Feed one frame label.
    pub fn observe(&mut self, decision: VadDecision, now: Instant) -> GateDecision {
        if self.fired {
            return GateDecision::Continue;
        }
        match decision {
            VadDecision::Speech => {
                self.speech_seen = true;
                self.below_since = None;
                self.check_max(now)
            }
            VadDecision::Silence => {
                if self.speech_seen && self.below_since.is_none() {
                    self.below_since = Some(now);
                }
                self.tick(now)
            }
            VadDecision::Uncertain => {
                self.below_since = None;
                self.check_max(now)
            }
        }
    }

    /// Advance time without a frame (capture stalls must still resolve).
    pub fn poll(&mut self, now: Instant) -> GateDecision {
        if self.fired {
            return GateDecision::Continue;
        }
        self.tick(now)
    }

    fn tick(&mut self, now: Instant) -> GateDecision {
        if let GateDecision::Submit(reason) = self.check_max(now) {
            return GateDecision::Submit(reason);
        }
        let Some(since) = self.below_since else {
            return GateDecision::Continue;
        };
        if now.duration_since(self.begun_at) >= self.cfg.min_capture
            && now.duration_since(since) >= self.cfg.window
        {
            self.fired = true;
            return GateDecision::Submit(SubmitReason::Silence);
        }
        GateDecision::Continue
    }

    fn check_max(&mut self, now: Instant) -> GateDecision {
        if now.duration_since(self.begun_at) >= self.cfg.max_capture {
            self.fired = true;
            GateDecision::Submit(SubmitReason::MaxDuration)
        } else {
            GateDecision::Continue
        }
    }

    pub fn speech_seen(&self) -> bool {
        self.speech_seen
    }

    /// True while a silence window is pending.
    pub fn window_pending(&self) -> bool {
        self.below_since.is_some() && !self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VadDecision::{Silence, Speech, Uncertain};

    fn cfg() -> GateConfig {
        GateConfig {
            window: Duration::from_millis(500),
            min_capture: Duration::from_millis(100),
            max_capture: Duration::from_secs(10),
        }
    }

    fn at(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn quiet_room_never_submits() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(cfg(), start);
        for step in 0..50u64 {
            assert_eq!(
                gate.observe(Silence, at(start, step * 100)),
                GateDecision::Continue
            );
        }
        assert!(!gate.window_pending());
    }

    #[test]
    fn silence_after_speech_submits_exactly_once() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(cfg(), start);
        assert_eq!(gate.observe(Speech, at(start, 0)), GateDecision::Continue);
        assert_eq!(gate.observe(Speech, at(start, 100)), GateDecision::Continue);
        assert_eq!(gate.observe(Silence, at(start, 200)), GateDecision::Continue);
        assert!(gate.window_pending());
        assert_eq!(
            gate.observe(Silence, at(start, 700)),
            GateDecision::Submit(SubmitReason::Silence)
        );
        // Further frames never fire again.
        assert_eq!(gate.observe(Silence, at(start, 1500)), GateDecision::Continue);
    }

    #[test]
    fn renewed_speech_cancels_the_pending_window() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(cfg(), start);
        gate.observe(Speech, at(start, 0));
        gate.observe(Silence, at(start, 100));
        assert!(gate.window_pending());
        gate.observe(Speech, at(start, 400));
        assert!(!gate.window_pending());
        // The old window's deadline passes without firing.
        assert_eq!(gate.observe(Speech, at(start, 650)), GateDecision::Continue);
        // A fresh window must run its full course.
        gate.observe(Silence, at(start, 700));
        assert_eq!(gate.observe(Silence, at(start, 1100)), GateDecision::Continue);
        assert_eq!(
            gate.observe(Silence, at(start, 1200)),
            GateDecision::Submit(SubmitReason::Silence)
        );
    }

    #[test]
    fn uncertain_frames_cancel_the_window_without_counting_as_speech() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(cfg(), start);
        gate.observe(Speech, at(start, 0));
        gate.observe(Silence, at(start, 100));
        assert!(gate.window_pending());
        gate.observe(Uncertain, at(start, 200));
        assert!(!gate.window_pending());
        assert!(gate.speech_seen());
    }

    #[test]
    fn min_capture_gates_early_silence() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(
            GateConfig {
                min_capture: Duration::from_millis(2000),
                ..cfg()
            },
            start,
        );
        gate.observe(Speech, at(start, 0));
        gate.observe(Silence, at(start, 50));
        // Window elapsed but capture is younger than min_capture.
        assert_eq!(gate.observe(Silence, at(start, 600)), GateDecision::Continue);
        assert_eq!(
            gate.observe(Silence, at(start, 2100)),
            GateDecision::Submit(SubmitReason::Silence)
        );
    }

    #[test]
    fn max_duration_fires_even_while_speaking() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(
            GateConfig {
                max_capture: Duration::from_millis(1000),
                ..cfg()
            },
            start,
        );
        for step in 0..10u64 {
            if gate.observe(Speech, at(start, step * 100)) != GateDecision::Continue {
                panic!("fired early at step {step}");
            }
        }
        assert_eq!(
            gate.observe(Speech, at(start, 1000)),
            GateDecision::Submit(SubmitReason::MaxDuration)
        );
    }

    #[test]
    fn poll_resolves_stalled_capture() {
        let start = Instant::now();
        let mut gate = SilenceGate::new(cfg(), start);
        gate.observe(Speech, at(start, 0));
        gate.observe(Silence, at(start, 100));
        // No further frames arrive; polling alone closes the turn.
        assert_eq!(gate.poll(at(start, 300)), GateDecision::Continue);
        assert_eq!(
            gate.poll(at(start, 700)),
            GateDecision::Submit(SubmitReason::Silence)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn decision(raw: u8) -> VadDecision {
            match raw % 3 {
                0 => Speech,
                1 => Silence,
                _ => Uncertain,
            }
        }

        proptest! {
            // However labels arrive, one gate fires at most once, and a
            // silence-triggered submit implies speech was actually heard.
            #[test]
            fn at_most_one_submit_per_gate(
                samples in proptest::collection::vec((0u8..3, 1u64..50), 1..200)
            ) {
                let start = Instant::now();
                let mut gate = SilenceGate::new(cfg(), start);
                let mut now = start;
                let mut submits = Vec::new();
                for (raw, dt) in samples {
                    now += Duration::from_millis(dt);
                    if let GateDecision::Submit(reason) = gate.observe(decision(raw), now) {
                        submits.push((reason, gate.speech_seen()));
                    }
                }
                prop_assert!(submits.len() <= 1);
                if let Some((SubmitReason::Silence, speech_seen)) = submits.first() {
                    prop_assert!(*speech_seen);
                }
            }
        }
    }
}
