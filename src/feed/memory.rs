//! In-process change feed backend.
//!
//! DESIGN
//! ======
//! Documents live in a map per collection behind one mutex. Every write fans
//! out a change event to all live subscribers, including the writer's own
//! subscription, mirroring how a hosted document store echoes a client's
//! writes back to it. Fan-out is best-effort like a board broadcast: a full
//! subscriber channel drops the event with a warning, a closed one is pruned.
//!
//! Used by tests and by the simulation binary when no database is configured.
//! `set_fail_writes` injects backend failures to exercise the no-rollback
//! path.

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChangeEvent, ChangeFeed, ChangeStream, Document, FeedError, MergeGuard, merge_document};
use crate::config::DEFAULT_FEED_CHANNEL_CAPACITY;

#[derive(Default)]
struct Collection {
    documents: HashMap<String, Document>,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
}

impl Collection {
    fn publish(&mut self, collection: &str, event: &ChangeEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%collection, document_id = %event.document_id, "subscriber channel full; dropping change event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn upsert(&mut self, collection: &str, document_id: &str, data: Document) {
        let event = match self.documents.get_mut(document_id) {
            Some(existing) => {
                merge_document(existing, data);
                ChangeEvent::modified(document_id, existing.clone())
            }
            None => {
                self.documents.insert(document_id.to_owned(), data.clone());
                ChangeEvent::added(document_id, data)
            }
        };
        self.publish(collection, &event);
    }

    fn remove(&mut self, collection: &str, document_id: &str) {
        if self.documents.remove(document_id).is_some() {
            self.publish(collection, &ChangeEvent::removed(document_id));
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, Collection>,
    fail_writes: bool,
}

/// Shared in-memory document store. Clones share state.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<Mutex<MemoryInner>>,
    capacity: usize,
}

impl MemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CHANNEL_CAPACITY)
    }

    /// Create a feed whose subscriber channels buffer `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryInner::default())), capacity: capacity.max(1) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent write fail with `Unavailable` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Current stored document, if any.
    #[must_use]
    pub fn document(&self, collection: &str, document_id: &str) -> Option<Document> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.documents.get(document_id).cloned())
    }

    /// Number of stored documents in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// Number of live subscriptions on a collection.
    #[must_use]
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn check_writable(inner: &MemoryInner) -> Result<(), FeedError> {
        if inner.fail_writes {
            return Err(FeedError::Unavailable("write rejected by memory feed".into()));
        }
        Ok(())
    }
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        let mut inner = self.lock();
        let entry = inner.collections.entry(collection.to_owned()).or_default();

        let (tx, rx) = mpsc::channel(self.capacity.max(entry.documents.len() + 1));
        for (document_id, data) in &entry.documents {
            if tx.try_send(ChangeEvent::added(document_id.clone(), data.clone())).is_err() {
                warn!(%collection, %document_id, "snapshot event dropped");
            }
        }
        entry.subscribers.push(tx);
        debug!(%collection, subscribers = entry.subscribers.len(), "memory feed: subscribed");
        Ok(rx)
    }

    async fn write(&self, collection: &str, document_id: &str, data: Document) -> Result<(), FeedError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        inner
            .collections
            .entry(collection.to_owned())
            .or_default()
            .upsert(collection, document_id, data);
        Ok(())
    }

    async fn write_batch(&self, collection: &str, documents: Vec<(String, Document)>) -> Result<(), FeedError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        let entry = inner.collections.entry(collection.to_owned()).or_default();
        for (document_id, data) in documents {
            entry.upsert(collection, &document_id, data);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, document_id: &str) -> Result<(), FeedError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        if let Some(entry) = inner.collections.get_mut(collection) {
            entry.remove(collection, document_id);
        }
        Ok(())
    }

    async fn delete_batch(&self, collection: &str, document_ids: Vec<String>) -> Result<(), FeedError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        if let Some(entry) = inner.collections.get_mut(collection) {
            for document_id in &document_ids {
                entry.remove(collection, document_id);
            }
        }
        Ok(())
    }

    async fn merge_if(
        &self,
        collection: &str,
        document_id: &str,
        guard: &MergeGuard,
        data: Document,
    ) -> Result<bool, FeedError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        let entry = inner.collections.entry(collection.to_owned()).or_default();
        if !guard(entry.documents.get(document_id)) {
            return Ok(false);
        }
        entry.upsert(collection, document_id, data);
        Ok(true)
    }
}
