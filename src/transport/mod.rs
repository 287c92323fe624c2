//! The `transport` module handles network communication with clients over
//! WebSockets: the JSON frame protocol, its codec, and the server that
//! accepts connections and hands them to sessions.

pub mod codec;
pub mod message;
pub mod websocket;


pub use message::{ChatFrame, ClientMessage, ServerMessage};
pub use websocket::{ChatServer, start_websocket_server};
