//! Keyed reply waits
//!
//! A task that expects an answer from a peer registers under the peer's key and
//! suspends on the returned receiver. The dispatcher completes the wait when the
//! answer arrives; cancelling it (the peer went away) wakes the task with
//! `MeshError::Timeout`, exactly as if the wait had expired.

use crate::error::{MeshError, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct ReplyWaiters<K, V> {
    pending: HashMap<K, oneshot::Sender<V>>,
}

impl<K: Eq + Hash, V> Default for ReplyWaiters<K, V> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> ReplyWaiters<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on `key`; an older wait on the same key is cancelled
    pub fn register(&mut self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key, tx);
        rx
    }

    /// Hand `value` to the task waiting on `key`
    pub fn complete(&mut self, key: &K, value: V) -> bool {
        match self.pending.remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_waiting(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Suspend until the reply arrives, the wait is cancelled or `limit` expires
pub async fn wait_reply<V>(rx: oneshot::Receiver<V>, limit: Duration) -> Result<V> {
    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) | Err(_) => Err(MeshError::Timeout),
    }
}
