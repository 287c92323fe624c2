//! Frame codec: WebSocket payloads to domain values and back.

use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientMessage, ServerMessage};
use crate::message::{Message, NewMessage};
use crate::utils::error::DecodeError;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Login { username: String, password: String },
    Chat(NewMessage),
    History { limit: Option<usize> },
}

/// Decode one frame payload. Chat messages are stamped with the current
/// time and tagged with `origin`.
pub fn decode(payload: &[u8], origin: &str) -> Result<Inbound, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Login { username, password } => Ok(Inbound::Login { username, password }),
        ClientMessage::Chat { sender, body } => {
            if sender.trim().is_empty() {
                return Err(DecodeError::EmptySender);
            }
            Ok(Inbound::Chat(NewMessage::now(sender, body).with_origin(origin)))
        }
        ClientMessage::History { limit } => Ok(Inbound::History { limit }),
    }
}

pub fn encode(msg: &ServerMessage) -> Result<WsMessage, serde_json::Error> {
    Ok(WsMessage::text(serde_json::to_string(msg)?))
}

/// Encode a stored message as an outbound `message` frame.
pub fn encode_message(msg: &Message) -> Result<WsMessage, serde_json::Error> {
    encode(&ServerMessage::from(msg))
}

/// Encode a client request; used by the bundled client.
pub fn encode_client(msg: &ClientMessage) -> Result<WsMessage, serde_json::Error> {
    Ok(WsMessage::text(serde_json::to_string(msg)?))
}

/// Parse a server frame; used by the bundled client and tests.
pub fn decode_server(payload: &[u8]) -> Result<ServerMessage, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}
