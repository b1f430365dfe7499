//! Remote sync bridge: moves mutations out and change events in.
//!
//! ARCHITECTURE
//! ============
//! Two background tasks per canvas session:
//! - outbound: drains the store's mutation queue in call order and performs
//!   the matching feed write, with linear back-off retries for transient
//!   failures. Grouped creates go out as one `write_batch`.
//! - inbound: feeds every change event into `ObjectStore::reconcile_remote`
//!   and periodically expires pending creates that were never confirmed.
//!
//! A canvas collection may be subscribed once per session; the
//! `SubscriptionRegistry` enforces that for the bridge and presence alike.
//!
//! ERROR HANDLING
//! ==============
//! Write failures are logged and counted, never rolled back locally. The
//! count is handed to whoever asks through a flush marker.

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::ErrorCode;
use crate::feed::{ChangeFeed, ChangeStream, Document, FeedError, to_document};
use crate::object::now_ms;
use crate::store::{FlushReport, Mutation, ObjectStore};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("collection already subscribed: {0}")]
    AlreadySubscribed(String),
    #[error("subscribe failed: {0}")]
    Subscribe(#[from] FeedError),
}

impl ErrorCode for BridgeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadySubscribed(_) => "E_ALREADY_SUBSCRIBED",
            Self::Subscribe(_) => "E_SUBSCRIBE_FAILED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::AlreadySubscribed(_) => false,
            Self::Subscribe(e) => e.retryable(),
        }
    }
}

// =============================================================================
// SUBSCRIPTION REGISTRY
// =============================================================================

/// Collections with a live subscription in this session.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a collection. The claim is released when dropped.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` if a live claim exists.
    pub fn claim(&self, collection: &str) -> Result<SubscriptionClaim, BridgeError> {
        if !self.lock().insert(collection.to_owned()) {
            return Err(BridgeError::AlreadySubscribed(collection.to_owned()));
        }
        Ok(SubscriptionClaim { registry: self.clone(), collection: collection.to_owned() })
    }

    #[must_use]
    pub fn is_claimed(&self, collection: &str) -> bool {
        self.lock().contains(collection)
    }
}

pub struct SubscriptionClaim {
    registry: SubscriptionRegistry,
    collection: String,
}

impl SubscriptionClaim {
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl Drop for SubscriptionClaim {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.collection);
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

pub struct SyncBridge {
    claim: SubscriptionClaim,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl SyncBridge {
    /// Subscribe to the canvas collection and start both workers.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` on a second connect for the same canvas,
    /// or the feed's error if the subscription fails.
    pub async fn connect(
        feed: Arc<dyn ChangeFeed>,
        registry: &SubscriptionRegistry,
        canvas_id: &str,
        store: ObjectStore,
        mutations: mpsc::UnboundedReceiver<Mutation>,
    ) -> Result<Self, BridgeError> {
        let claim = registry.claim(canvas_id)?;
        let stream = feed.subscribe(canvas_id).await?;
        let config = *store.config();

        info!(
            %canvas_id,
            retries = config.retry.attempts,
            retry_base_ms = config.retry.base_ms,
            sweep_ms = u64::try_from(config.pending_sweep.as_millis()).unwrap_or(u64::MAX),
            "sync bridge connected"
        );

        let outbound = tokio::spawn(run_outbound(feed, canvas_id.to_owned(), mutations, config.retry));
        let inbound = tokio::spawn(run_inbound(stream, canvas_id.to_owned(), store, config.pending_sweep));
        Ok(Self { claim, outbound, inbound })
    }

    #[must_use]
    pub fn canvas_id(&self) -> &str {
        self.claim.collection()
    }

    /// Stop both workers. Queued mutations that have not been attempted are
    /// dropped; flush first to wait for them.
    pub fn shutdown(&self) {
        self.outbound.abort();
        self.inbound.abort();
        info!(canvas_id = %self.claim.collection(), "sync bridge stopped");
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.outbound.abort();
        self.inbound.abort();
    }
}

// =============================================================================
// WORKERS
// =============================================================================

async fn run_outbound(
    feed: Arc<dyn ChangeFeed>,
    canvas_id: String,
    mut rx: mpsc::UnboundedReceiver<Mutation>,
    retry: RetryConfig,
) {
    let mut report = FlushReport::default();
    while let Some(mutation) = rx.recv().await {
        if let Mutation::Flush(reply) = mutation {
            let done = std::mem::take(&mut report);
            debug!(%canvas_id, failed_writes = done.failed_writes, "flush marker reached");
            if reply.send(done).is_err() {
                debug!(%canvas_id, "flush requester went away");
            }
            continue;
        }

        if let Err(e) = write_with_retry(feed.as_ref(), &canvas_id, &mutation, retry).await {
            error!(%canvas_id, error = %e, code = e.error_code(), "remote write failed; local state kept");
            report.failed_writes += 1;
            report.last_error = Some(e.to_string());
        }
    }
    debug!(%canvas_id, "outbound queue closed");
}

async fn write_with_retry(
    feed: &dyn ChangeFeed,
    canvas_id: &str,
    mutation: &Mutation,
    retry: RetryConfig,
) -> Result<(), FeedError> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match apply(feed, canvas_id, mutation).await {
            Ok(()) => return Ok(()),
            Err(e) if e.retryable() && attempt < attempts => {
                warn!(%canvas_id, attempt, attempts, error = %e, "remote write failed; retrying");
                tokio::time::sleep(Duration::from_millis((attempt as u64).saturating_mul(retry.base_ms))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn apply(feed: &dyn ChangeFeed, canvas_id: &str, mutation: &Mutation) -> Result<(), FeedError> {
    match mutation {
        Mutation::Put { object } => feed.write(canvas_id, &object.id, to_document(object)?).await,
        Mutation::PutBatch { objects } => {
            let documents = objects
                .iter()
                .map(|o| Ok((o.id.clone(), to_document(o)?)))
                .collect::<Result<Vec<_>, FeedError>>()?;
            feed.write_batch(canvas_id, documents).await
        }
        Mutation::Patch { id, patch } => {
            // Never resurrect a document someone else deleted as a partial one.
            let exists = |current: Option<&Document>| current.is_some();
            if !feed.merge_if(canvas_id, id, &exists, to_document(patch)?).await? {
                debug!(%canvas_id, object_id = %id, "patch target gone remotely; dropped");
            }
            Ok(())
        }
        Mutation::Delete { id } => feed.delete(canvas_id, id).await,
        Mutation::DeleteBatch { ids } => feed.delete_batch(canvas_id, ids.clone()).await,
        Mutation::Flush(_) => Ok(()),
    }
}

async fn run_inbound(mut stream: ChangeStream, canvas_id: String, store: ObjectStore, sweep: Duration) {
    let mut ticker = tokio::time::interval(sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_event = stream.recv() => {
                let Some(event) = maybe_event else {
                    warn!(%canvas_id, "change feed closed");
                    break;
                };
                store.reconcile_remote(event);
            }
            _ = ticker.tick() => {
                let expired = store.expire_pending(now_ms());
                if !expired.is_empty() {
                    debug!(%canvas_id, count = expired.len(), "pending sweep expired creates");
                }
            }
        }
    }
}
