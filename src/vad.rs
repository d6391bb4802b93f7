//! Voice-activity detection behind one stable engine interface.
//!
//! The default engine classifies frames by meter level against the session
//! threshold; the `vad_earshot` feature adds a model-backed engine behind
//! the same trait.

use serde::{Deserialize, Serialize};

use crate::meter;

/// Per-frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
    Uncertain,
}

/// Which engine a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEngineKind {
    Level,
    Earshot,
}

/// Build the configured engine. Falls back to the level engine when the
/// model-backed one is not compiled in.
pub fn build_engine(
    kind: VadEngineKind,
    threshold: u8,
    sample_rate: u32,
    frame_ms: u64,
) -> Box<dyn VadEngine> {
    match kind {
        VadEngineKind::Level => Box::new(LevelVad::new(threshold)),
        #[cfg(feature = "vad_earshot")]
        VadEngineKind::Earshot => Box::new(EarshotVad::new(threshold, sample_rate, frame_ms)),
        #[cfg(not(feature = "vad_earshot"))]
        VadEngineKind::Earshot => {
            let _ = (sample_rate, frame_ms);
            tracing::debug!("earshot engine not compiled in; using level engine");
            Box::new(LevelVad::new(threshold))
        }
    }
}

/// A frame-by-frame activity classifier.
///
/// Engines are built fresh for every capture, so they carry no
/// cross-capture state to clear.
pub trait VadEngine: Send {
    fn process_frame(&mut self, samples: &[f32]) -> VadDecision;
    fn name(&self) -> &'static str;
}

/// Threshold engine on the 0–100 level scale.
///
/// This matches the original behavior exactly: a frame is speech when its
/// level meets the configured threshold, silence otherwise. Empty frames are
/// uncertain so a stalled device cannot masquerade as silence.
pub struct LevelVad {
    threshold: u8,
}

impl LevelVad {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold: threshold.min(100),
        }
    }
}

impl VadEngine for LevelVad {
    fn process_frame(&mut self, samples: &[f32]) -> VadDecision {
        if samples.is_empty() {
            return VadDecision::Uncertain;
        }
        if meter::level_from_samples(samples) >= self.threshold {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn name(&self) -> &'static str {
        "level_vad"
    }
}

#[cfg(feature = "vad_earshot")]
pub use earshot_engine::EarshotVad;

#[cfg(feature = "vad_earshot")]
mod earshot_engine {
    use super::{VadDecision, VadEngine};
    use earshot::{VoiceActivityDetector, VoiceActivityProfile};

    /// Thin wrapper adapting `earshot` to [`VadEngine`].
    ///
    /// Expects 16 kHz mono input; frames are padded or truncated to the
    /// detector's window.
    pub struct EarshotVad {
        detector: VoiceActivityDetector,
        frame_samples: usize,
        scratch: Vec<i16>,
    }

    fn float_sample_to_i16(sample: f32) -> i16 {
        let clamped = sample.clamp(-1.0, 1.0);
        if clamped >= 0.0 {
            (clamped * i16::MAX as f32).round() as i16
        } else {
            (clamped * 32_768.0).round() as i16
        }
    }

    impl EarshotVad {
        /// Build an Earshot-backed VAD. A lower level threshold maps onto a
        /// more aggressive profile so the two engines stay interchangeable.
        #[must_use]
        pub fn new(level_threshold: u8, sample_rate: u32, frame_ms: u64) -> Self {
            let profile = match level_threshold {
                t if t <= 5 => VoiceActivityProfile::VERY_AGGRESSIVE,
                t if t <= 15 => VoiceActivityProfile::AGGRESSIVE,
                t if t <= 30 => VoiceActivityProfile::LBR,
                _ => VoiceActivityProfile::QUALITY,
            };
            let frame_ms = frame_ms.clamp(10, 30) as usize;
            let frame_samples = ((sample_rate as usize) * frame_ms) / 1000;
            Self {
                detector: VoiceActivityDetector::new(profile),
                frame_samples: frame_samples.max(160),
                scratch: Vec::new(),
            }
        }
    }

    impl VadEngine for EarshotVad {
        fn process_frame(&mut self, samples: &[f32]) -> VadDecision {
            if samples.is_empty() {
                return VadDecision::Uncertain;
            }
            self.scratch.clear();
            self.scratch.reserve(self.frame_samples);
            for sample in samples.iter().copied() {
                self.scratch.push(float_sample_to_i16(sample));
            }
            if self.scratch.len() < self.frame_samples {
                self.scratch.resize(self.frame_samples, 0);
            } else if self.scratch.len() > self.frame_samples {
                self.scratch.truncate(self.frame_samples);
            }
            match self.detector.predict_16khz(&self.scratch) {
                Ok(true) => VadDecision::Speech,
                Ok(false) => VadDecision::Silence,
                Err(_) => VadDecision::Uncertain,
            }
        }

        fn name(&self) -> &'static str {
            "earshot_vad"
        }
    }

}
