//! The `store` module is the durable side of the system: an append-only
//! message log with a live tail.
//!
//! [`MessageStore`] is the seam the rest of the crate talks to; the
//! production implementation is [`SledStore`], backed by an embedded `sled`
//! database.

pub mod sled_store;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::message::{Message, NewMessage};
use crate::utils::error::PersistenceError;

pub use sled_store::SledStore;

/// Live feed of appended messages.
///
/// Infinite while healthy; a broken feed yields one
/// `Err(PersistenceError::TailBroken)` and then ends. Dropping the stream
/// detaches it from the store.
pub type Tail = BoxStream<'static, Result<Message, PersistenceError>>;

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Assign an id and persist `msg`. Returns once the write is durable.
    async fn append(&self, msg: NewMessage) -> Result<Message, PersistenceError>;

    /// Attach a live feed of every message appended from now on.
    /// Existing records are not replayed; use [`MessageStore::history`].
    async fn tail(&self) -> Result<Tail, PersistenceError>;

    /// The newest `limit` records, oldest first.
    async fn history(&self, limit: usize) -> Result<Vec<Message>, PersistenceError>;
}
