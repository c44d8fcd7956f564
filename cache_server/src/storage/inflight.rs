// Single writer admission per key
//
// A write for a key holds a WritePermit. Later writers for the same key wait
// until the permit is dropped and then re-check existence themselves.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Registry of keys with a write in flight
#[derive(Debug, Clone, Default)]
pub struct InflightRegistry {
    entries: Arc<DashMap<String, watch::Receiver<()>>>,
}

/// Exclusive right to write one key; released on drop
#[derive(Debug)]
pub struct WritePermit {
    entries: Arc<DashMap<String, watch::Receiver<()>>>,
    key: String,
    // Dropping the sender wakes every waiter
    _done: watch::Sender<()>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the permit for `key` if nobody holds it
    pub fn try_admit(&self, key: &str) -> Option<WritePermit> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(());
                slot.insert(rx);
                Some(WritePermit {
                    entries: self.entries.clone(),
                    key: key.to_string(),
                    _done: tx,
                })
            }
        }
    }

    /// Wait until the permit for `key` can be taken
    pub async fn admit(&self, key: &str) -> WritePermit {
        loop {
            let waiter = match self.entries.entry(key.to_string()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(());
                    slot.insert(rx);
                    return WritePermit {
                        entries: self.entries.clone(),
                        key: key.to_string(),
                        _done: tx,
                    };
                }
            };

            debug!("Waiting for in-flight write of {}", key);
            let mut waiter = waiter;
            // Errors once the holder drops its sender
            while waiter.changed().await.is_ok() {}
        }
    }

    /// Whether a write for `key` is in flight
    pub fn is_inflight(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WritePermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.entries.remove(&self.key);
    }
}
