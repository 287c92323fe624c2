//! Message log backed by `sled`
//!
//! Records live in a single tree keyed by the big-endian `u64` id, so key
//! order is append order and a forward scan yields history chronologically.
//! The live tail is a `watch_prefix` subscription on that tree.
//!
//! Id allocation, insert and retention trimming happen under one short lock
//! so that the order of ids, the order of tail events and the scan order all
//! agree. The lock also guards the count of retained records; sled's
//! `Tree::len` is a full scan and only runs once, at open.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use sled::{Db, Event, Tree};
use tracing::{debug, warn};

use super::{MessageStore, Tail};
use crate::message::{Message, NewMessage};
use crate::utils::error::PersistenceError;

const MESSAGES_TREE: &str = "messages";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
    /// Guards appends; holds the number of retained records.
    write_lock: Arc<Mutex<usize>>,
    max_messages: Option<usize>,
}

impl SledStore {
    /// Open or create a database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        max_messages: Option<usize>,
    ) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Self::from_db(db, max_messages)
    }

    /// A throwaway database, removed when the last handle drops.
    pub fn temporary(max_messages: Option<usize>) -> Result<Self, PersistenceError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, max_messages)
    }

    fn from_db(db: Db, max_messages: Option<usize>) -> Result<Self, PersistenceError> {
        let tree = db.open_tree(MESSAGES_TREE)?;
        let retained = tree.len();
        Ok(Self {
            db,
            tree,
            write_lock: Arc::new(Mutex::new(retained)),
            max_messages,
        })
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        *self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_blocking(&self, msg: NewMessage) -> Result<Message, PersistenceError> {
        let stored = {
            let mut retained = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            // Ids start at 1.
            let id = self.db.generate_id()? + 1;
            let stored = msg.into_stored(id.to_string());
            let value = serde_json::to_vec(&stored)?;
            self.tree.insert(id.to_be_bytes(), value)?;
            *retained += 1;

            // The record is in the tree and on the tail from here on; a failed
            // trim must not turn the append into an error.
            if let Err(e) = self.enforce_retention(&mut retained) {
                warn!(id = %stored.id, error = %e, "retention trim failed");
            }
            stored
        };

        self.tree.flush()?;

        debug!(id = %stored.id, sender = %stored.sender, "message appended");
        Ok(stored)
    }

    /// Drop the oldest records until at most `max_messages` remain. Runs with
    /// the write lock held.
    fn enforce_retention(&self, retained: &mut usize) -> Result<(), PersistenceError> {
        let Some(max) = self.max_messages else {
            return Ok(());
        };

        let mut removed = 0;
        while *retained > max {
            if self.tree.pop_min()?.is_none() {
                *retained = 0;
                break;
            }
            *retained -= 1;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "trimmed message log");
        }
        Ok(())
    }

    fn history_blocking(&self, limit: usize) -> Result<Vec<Message>, PersistenceError> {
        let mut messages = Vec::new();
        for entry in self.tree.iter().rev().take(limit) {
            let (_, value) = entry?;
            messages.push(serde_json::from_slice::<Message>(&value)?);
        }
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn append(&self, msg: NewMessage) -> Result<Message, PersistenceError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append_blocking(msg))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }

    async fn tail(&self) -> Result<Tail, PersistenceError> {
        let subscriber = self.tree.watch_prefix(Vec::<u8>::new());

        let stream = futures::stream::unfold(Some(subscriber), |state| async move {
            let mut subscriber = state?;
            loop {
                match (&mut subscriber).await {
                    Some(Event::Insert { value, .. }) => {
                        let item = serde_json::from_slice::<Message>(&value)
                            .map_err(PersistenceError::from);
                        return Some((item, Some(subscriber)));
                    }
                    // Retention trims show up as removals.
                    Some(Event::Remove { .. }) => continue,
                    None => {
                        warn!("sled watcher closed");
                        return Some((Err(PersistenceError::TailBroken), None));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn history(&self, limit: usize) -> Result<Vec<Message>, PersistenceError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.history_blocking(limit))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("max_messages", &self.max_messages)
            .finish()
    }
}
