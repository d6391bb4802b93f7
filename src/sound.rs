//! Earcon feedback as an explicitly constructed, injected service.
//!
//! The original application reached for a module-level sound manager;
//! here the service is owned by whoever builds the session and torn down
//! with it. Tones are generated, so no audio assets ship with the crate.

use std::sync::Arc;

use tracing::debug;

use crate::audio::output::AudioOutput;
use crate::audio::wav::pcm16_from_f32;

const EARCON_SAMPLE_RATE: u32 = 24_000;

/// The cues the session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Earcon {
    /// Session armed; listening begins.
    SessionStart,
    /// Session released.
    SessionEnd,
    /// A turn or the session failed.
    Failure,
}

/// Short feedback tones shared with the speech output device.
///
/// Earcons append to the playback queue rather than replacing it, so a cue
/// never cuts assistant speech short.
pub struct SoundEffects {
    output: Arc<dyn AudioOutput>,
    enabled: bool,
}

impl SoundEffects {
    pub fn new(output: Arc<dyn AudioOutput>, enabled: bool) -> Self {
        Self { output, enabled }
    }

    pub fn play(&self, earcon: Earcon) {
        if !self.enabled {
            return;
        }
        let samples = match earcon {
            Earcon::SessionStart => tone(880.0, 90),
            Earcon::SessionEnd => tone(440.0, 90),
            Earcon::Failure => tone(220.0, 180),
        };
        if let Err(err) = self.output.append_pcm16(samples, EARCON_SAMPLE_RATE) {
            debug!(error = %err, "earcon dropped");
        }
    }
}

/// A faded sine burst; the 5 ms ramp at each end avoids clicks.
fn tone(freq: f32, duration_ms: u32) -> Vec<i16> {
    let total = (EARCON_SAMPLE_RATE * duration_ms / 1000) as usize;
    let ramp = (EARCON_SAMPLE_RATE / 200) as usize;
    (0..total)
        .map(|i| {
            let t = i as f32 / EARCON_SAMPLE_RATE as f32;
            let envelope = if i < ramp {
                i as f32 / ramp as f32
            } else if i + ramp > total {
                (total - i) as f32 / ramp as f32
            } else {
                1.0
            };
            let sample = (t * freq * std::f32::consts::TAU).sin() * 0.25 * envelope;
            pcm16_from_f32(sample)
        })
        .collect()
}
