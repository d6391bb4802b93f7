//! Notification surface so session failures reach the user as short messages.
//!
//! The engine never renders anything itself; it posts `Notice`s over a
//! channel and the hosting surface (CLI, UI) decides how to show them. This
//! is the seam the original application filled with toasts.

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::VoiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// One user-visible message.
#[derive(Debug, Clone)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Cloneable sending half of the notification surface.
///
/// Sends never fail loudly: a disconnected receiver means the surface went
/// away, and the session must keep running regardless.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.post(NoticeLevel::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.post(NoticeLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.post(NoticeLevel::Error, message.into());
    }

    /// Post the user-facing message for a session error.
    pub fn session_error(&self, err: &VoiceError) {
        warn!(error = %err, "session error surfaced to user");
        self.post(NoticeLevel::Error, err.user_message().to_string());
    }

    fn post(&self, level: NoticeLevel, message: String) {
        let _ = self.tx.send(Notice { level, message });
    }
}
