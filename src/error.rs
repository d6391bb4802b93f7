//! Typed session errors so every failure maps onto one user-visible notice.
//!
//! The taxonomy mirrors the boundaries of the session engine: device
//! acquisition, transport setup, remote collaborators, and playback. Remote
//! failures keep their class (`RemoteServiceKind`) so the surface can show a
//! rate-limit message instead of a generic one.

use thiserror::Error;

/// Distinguishable classes of remote-collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteServiceKind {
    /// The service rejected the call because of request-rate pressure (429).
    RateLimited,
    /// The account's quota is exhausted; retrying will not help.
    QuotaExhausted,
    /// Generic service-side failure (5xx, malformed response).
    Service,
    /// The request never reached the service.
    Network,
}

impl RemoteServiceKind {
    /// Compact label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            RemoteServiceKind::RateLimited => "rate_limited",
            RemoteServiceKind::QuotaExhausted => "quota_exhausted",
            RemoteServiceKind::Service => "service",
            RemoteServiceKind::Network => "network",
        }
    }
}

/// Errors surfaced by the voice session engine.
///
/// Every variant is terminal for the operation that produced it; recovery is
/// user-initiated (press the button again), never automatic.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Microphone access was refused or no input device exists.
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// The realtime channel or credential fetch could not be established.
    #[error("transport setup failed: {0}")]
    TransportSetup(String),

    /// A remote collaborator (transcription, completion, synthesis) failed.
    #[error("remote service failure ({}): {message}", .kind.label())]
    Remote {
        kind: RemoteServiceKind,
        message: String,
    },

    /// Synthesized audio could not be decoded or rendered.
    #[error("playback failed: {0}")]
    Playback(String),

    /// A local audio device failed after acquisition.
    #[error("audio device failure: {0}")]
    Audio(String),

    /// An internal channel closed while the session still needed it.
    #[error("session channel closed")]
    ChannelClosed,
}

impl VoiceError {
    pub fn remote(kind: RemoteServiceKind, message: impl Into<String>) -> Self {
        VoiceError::Remote {
            kind,
            message: message.into(),
        }
    }

    /// Short French message suitable for the notification surface.
    ///
    /// The hosting application is French-language throughout; these strings
    /// are what the user actually reads, while `Display` stays technical for
    /// logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => {
                "Accès au microphone refusé. Autorisez le micro puis réessayez."
            }
            VoiceError::TransportSetup(_) => {
                "Connexion au service vocal impossible. Veuillez réessayer."
            }
            VoiceError::Remote {
                kind: RemoteServiceKind::RateLimited,
                ..
            } => "Le service vocal est saturé. Patientez un instant puis réessayez.",
            VoiceError::Remote {
                kind: RemoteServiceKind::QuotaExhausted,
                ..
            } => "Quota du service vocal épuisé. Contactez l'administrateur.",
            VoiceError::Remote {
                kind: RemoteServiceKind::Network,
                ..
            } => "Connexion réseau instable. Vérifiez votre connexion.",
            VoiceError::Remote { .. } => {
                "Le service vocal a rencontré une erreur. Veuillez réessayer."
            }
            VoiceError::Playback(_) => "La lecture de la réponse audio a échoué.",
            VoiceError::Audio(_) => "Périphérique audio indisponible.",
            VoiceError::ChannelClosed => "La session vocale s'est interrompue.",
        }
    }
}
