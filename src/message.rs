//! Chat message types.
//!
//! A message exists in two shapes: [`NewMessage`] is what a session builds
//! from an inbound frame (timestamp attached, no id yet) and [`Message`] is
//! the record the store hands back once it is durable. Both are immutable
//! after construction.

use serde::{Deserialize, Serialize};

/// Identifier of a connection session (and of its hub subscription).
pub type SessionId = String;

/// Store-assigned message identifier. Opaque to everything but the store.
pub type MessageId = String;

/// A decoded message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub body: String,
    /// Milliseconds since the UNIX epoch, taken when the frame was received.
    pub timestamp: i64,
    pub origin: Option<SessionId>,
}

impl NewMessage {
    /// Build a message stamped with the current time.
    pub fn now(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<SessionId>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Attach the id assigned by the store.
    pub fn into_stored(self, id: MessageId) -> Message {
        Message {
            id,
            sender: self.sender,
            body: self.body,
            timestamp: self.timestamp,
            origin: self.origin,
        }
    }
}

/// A durably appended message. This is also the persisted record layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub body: String,
    pub timestamp: i64,
    /// Session that produced the message; never sent to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionId>,
}
