//! Session state machine vocabulary shared by every transport.
//!
//! A single enum replaces the separate `isRecording`/`isSpeaking`/
//! `isProcessing` flags the hook variants used to carry, so impossible
//! combinations cannot be represented at all.

use serde::{Deserialize, Serialize};

/// The one authoritative state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    /// No engagement; microphone and output are released.
    Idle,
    /// Transport setup in progress (device acquisition, credential fetch,
    /// channel handshake).
    Connecting,
    /// Microphone live, waiting for the user's turn to close.
    Listening,
    /// A user turn has been submitted; exactly one reply chain in flight.
    Thinking,
    /// Assistant audio is rendering.
    Speaking,
}

impl VoiceState {
    /// True for every state that holds resources needing teardown.
    pub fn is_active(&self) -> bool {
        !matches!(self, VoiceState::Idle)
    }

    pub fn label(&self) -> &'static str {
        match self {
            VoiceState::Idle => "idle",
            VoiceState::Connecting => "connecting",
            VoiceState::Listening => "listening",
            VoiceState::Thinking => "thinking",
            VoiceState::Speaking => "speaking",
        }
    }
}

/// How the session reaches its remote collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Discrete record → transcribe → complete → synthesize cycles.
    TurnBased,
    /// Persistent bidirectional audio channel with a structured event
    /// side-channel.
    RealtimeChannel,
}

/// Whether `to` is a legal successor of `from`.
///
/// `Idle` is reachable from anywhere (stop and error paths); everything else
/// follows the cycle `idle → connecting → listening → thinking → speaking`,
/// with `speaking → listening` closing the loop in continuous mode.
pub fn transition_allowed(from: VoiceState, to: VoiceState) -> bool {
    use VoiceState::*;
    match (from, to) {
        (_, Idle) => true,
        (Idle, Connecting) => true,
        (Connecting, Listening) => true,
        (Listening, Thinking) => true,
        // Realtime transport can stream reply audio without a distinct
        // thinking phase when the server replies immediately.
        (Listening, Speaking) => true,
        (Thinking, Speaking) => true,
        (Thinking, Listening) => true,
        (Speaking, Listening) => true,
        _ => false,
    }
}
