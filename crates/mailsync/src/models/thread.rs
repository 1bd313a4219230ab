//! Thread model

use serde::{Deserialize, Serialize};

use super::{LocalMessageId, Message};

/// A thread is identified by the local id of its root message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub LocalMessageId);

impl From<LocalMessageId> for ThreadId {
    fn from(id: LocalMessageId) -> Self {
        Self(id)
    }
}

/// A conversation: all messages sharing one thread root, oldest first
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub messages: Vec<Message>,
}

impl Thread {
    pub fn subject(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.subject.as_str())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// True if any message in the thread is unread
    pub fn is_unread(&self) -> bool {
        self.messages.iter().any(|m| !m.is_read())
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| (m.date, m.id))
    }
}
