//! Error types shared by the store, sessions and the server.
//!
//! Overflow of a subscriber queue is deliberately absent: it is an outcome of
//! `BroadcastHub::publish` (see `hub::Delivery`), never an error.

use thiserror::Error;

/// A malformed inbound frame. Local to one session.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("sender must not be empty")]
    EmptySender,
}

/// Failures of the message store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The store cannot be reached at all; sessions drain on this.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The live feed ended or failed; terminal for that tail.
    #[error("tail feed broken")]
    TailBroken,
}

impl PersistenceError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_))
    }
}

impl From<sled::Error> for PersistenceError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => PersistenceError::Unavailable(e.to_string()),
            sled::Error::Corruption { .. } => PersistenceError::Unavailable(err.to_string()),
            other => PersistenceError::Write(other.to_string()),
        }
    }
}

/// Why a session left the `Active` state.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("client closed the connection before logging in")]
    ClosedDuringHandshake,

    #[error("subscription closed by the hub")]
    SubscriptionClosed,

    #[error("server shutting down")]
    ShuttingDown,
}

/// Startup failures of the server binary.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
