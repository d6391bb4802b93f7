//! Boundary contracts for the remote speech and language collaborators.
//!
//! The session engine only ever sees these traits; vendor adapters live in
//! the submodules and are injected at construction. This is the seam that
//! collapses the original's seven per-vendor session implementations into
//! one.

pub mod elevenlabs;
pub mod openai;
pub mod token;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RemoteServiceKind, VoiceError};

pub use elevenlabs::ElevenLabsSynthesizer;
pub use openai::{OpenAiCompleter, OpenAiTranscriber};
pub use token::HttpCredentialIssuer;

/// One chat-protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Audio bytes in, transcript out.
///
/// An empty transcript is a valid result ("nothing was said") and must not
/// be reported as an error.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: &[u8]) -> Result<String, VoiceError>;
}

/// Ordered messages in, assistant reply text out.
///
/// Adapters may stream internally; the session only needs the complete
/// reply, so "stream finished" and "reply ready" are the same event here.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VoiceError>;
}

/// Reply text in, encoded speech audio out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoiceError>;
}

/// A short-lived credential for one realtime connection attempt.
///
/// Never cached: the session requests a fresh credential on every start so
/// no long-lived secret ever reaches the client side.
#[derive(Debug, Clone)]
pub struct RealtimeCredential {
    pub url: String,
    pub secret: String,
}

/// Issues ephemeral realtime credentials from a trusted intermediary.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self) -> Result<RealtimeCredential, VoiceError>;
}

/// Map an HTTP failure onto the remote error taxonomy.
///
/// 429 bodies mentioning exhausted quota are distinguished from transient
/// rate limiting so the surface can show the right message.
pub(crate) fn classify_http_failure(status: u16, body: &str) -> VoiceError {
    let kind = if status == 429 {
        if body.contains("insufficient_quota") || body.contains("quota") {
            RemoteServiceKind::QuotaExhausted
        } else {
            RemoteServiceKind::RateLimited
        }
    } else if status == 402 {
        RemoteServiceKind::QuotaExhausted
    } else {
        RemoteServiceKind::Service
    };
    let snippet: String = body.chars().take(200).collect();
    VoiceError::remote(kind, format!("HTTP {status}: {snippet}"))
}

pub(crate) fn network_failure(err: &reqwest::Error) -> VoiceError {
    VoiceError::remote(RemoteServiceKind::Network, err.to_string())
}
