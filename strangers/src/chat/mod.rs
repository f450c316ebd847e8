//! Per-session chat state: the message log and the remote typing indicator.
//!
//! Both are plain state containers owned by the session controller. Nothing
//! here outlives a session; the controller clears them at every session
//! boundary.

pub mod typing;

pub use typing::TypingTracker;

use std::fmt;

/// Who a chat line is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    /// The local user.
    You,
    /// The matched partner.
    Stranger,
    /// Session notices ("Connected to a stranger.", ...).
    System,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::You => write!(f, "You"),
            Self::Stranger => write!(f, "Stranger"),
            Self::System => write!(f, "System"),
        }
    }
}

/// One entry of the chat log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Attribution.
    pub sender: Sender,
    /// Text as sent or received.
    pub text: String,
}

impl Message {
    /// A line typed by the local user.
    pub fn you(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::You,
            text: text.into(),
        }
    }

    /// A line received from the partner.
    pub fn stranger(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Stranger,
            text: text.into(),
        }
    }

    /// A session notice.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::System,
            text: text.into(),
        }
    }
}

/// Ordered, append-only record of the active session's messages.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<Message>,
}

impl ChatLog {
    /// Create an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a message at the end of the log.
    pub fn push(&mut self, message: Message) {
        self.entries.push(message);
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard every entry. Cleared history is not archived.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
