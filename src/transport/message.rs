//! JSON frames exchanged with clients, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "login")]
    Login { username: String, password: String },
    /// A chat message. Any client-supplied `id` or `timestamp` is ignored.
    #[serde(rename = "message")]
    Chat { sender: String, body: String },
    #[serde(rename = "history")]
    History {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

/// A stored message as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatFrame {
    pub id: String,
    pub sender: String,
    pub body: String,
    pub timestamp: i64,
}

impl From<&Message> for ChatFrame {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            body: msg.body.clone(),
            timestamp: msg.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "authenticated")]
    Authenticated { username: String },
    #[serde(rename = "message")]
    Message(ChatFrame),
    #[serde(rename = "history")]
    History { messages: Vec<ChatFrame> },
    /// The subscriber's queue overflowed and `missed` messages were lost.
    #[serde(rename = "lagged")]
    Lagged { missed: u64 },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn history(messages: &[Message]) -> Self {
        ServerMessage::History {
            messages: messages.iter().map(ChatFrame::from).collect(),
        }
    }
}

impl From<&Message> for ServerMessage {
    fn from(msg: &Message) -> Self {
        ServerMessage::Message(ChatFrame::from(msg))
    }
}
