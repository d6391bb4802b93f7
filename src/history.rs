//! Append-only conversation log owned by the session manager.
//!
//! UI layers read snapshots; only the session actor mutates. The log lives
//! for the lifetime of one engagement and is cleared on teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered transcript of the current session.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    entries: Vec<Utterance>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content.into());
    }

    fn push(&mut self, role: Role, content: String) {
        self.entries.push(Utterance {
            role,
            content,
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[Utterance] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all turns. Called on session teardown only.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_keep_insertion_order() {
        let mut history = ConversationHistory::new();
        history.push_user("bonjour");
        history.push_assistant("Bonjour, comment puis-je vous aider ?");
        history.push_user("quelle heure est-il ?");

        let roles: Vec<Role> = history.entries().iter().map(|u| u.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(history.entries()[0].content, "bonjour");
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn clear_empties_the_log() {
        let mut history = ConversationHistory::new();
        history.push_user("bonjour");
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn roles_map_to_protocol_strings() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn timestamps_are_monotonic_enough() {
        let mut history = ConversationHistory::new();
        history.push_user("a");
        history.push_assistant("b");
        let entries = history.entries();
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }
}
