//! # chatcast
//!
//! `chatcast` is the broadcast core of a chat service. Clients connect over
//! WebSockets, every accepted message is appended to a durable log, and a
//! fan-out task reads the log's live tail and redistributes each record to
//! every connected session.
//!
//! ## Core Modules
//!
//! - `store`: append-only message log with a live tail (sled backed).
//! - `hub`: in-memory multicast point with bounded per-subscriber queues.
//! - `fanout`: the task bridging the store tail to the hub, plus store health.
//! - `session`: per-connection state machine (login, inbound, outbound, drain).
//! - `auth`: the authenticator interface sessions call on login.
//! - `transport`: the JSON frame protocol and the WebSocket server.
//! - `config`: settings loaded from file and environment.
//! - `utils`: error types and logging setup.

pub mod auth;
pub mod config;
pub mod fanout;
pub mod hub;
pub mod message;
pub mod session;
pub mod store;
pub mod transport;
pub mod utils;
