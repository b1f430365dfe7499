//! Presence tracker: who else is on this canvas, and where their cursor is.
//!
//! DESIGN
//! ======
//! Each user owns one ephemeral document, keyed by user id, on the sibling
//! collection `<canvas>:presence`. Cursor moves are throttled before they
//! reach the backend; a heartbeat refreshes `last_seen` so idle users stay
//! visible. Peers not seen within the stale window drop out of the online
//! list locally; nobody deletes another user's record.

#[cfg(test)]
#[path = "presence_test.rs"]
mod presence_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, SubscriptionClaim, SubscriptionRegistry};
use crate::config::SyncConfig;
use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, FeedError, from_document, to_document};
use crate::object::{UserIdentity, now_ms};

/// Feed collection holding presence records for `canvas_id`.
#[must_use]
pub fn presence_collection(canvas_id: &str) -> String {
    format!("{canvas_id}:presence")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    #[serde(default)]
    pub cursor_x: Option<f64>,
    #[serde(default)]
    pub cursor_y: Option<f64>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: i64,
}

impl PresenceRecord {
    fn joined(user: &UserIdentity, now: i64) -> Self {
        Self {
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            user_color: user.user_color.clone(),
            cursor_x: None,
            cursor_y: None,
            online: true,
            last_seen: now,
        }
    }

    #[must_use]
    pub fn is_fresh_at(&self, now: i64, stale_ms: i64) -> bool {
        self.online && now.saturating_sub(self.last_seen) <= stale_ms
    }
}

type Peers = Arc<Mutex<HashMap<String, PresenceRecord>>>;

fn lock_peers(peers: &Peers) -> MutexGuard<'_, HashMap<String, PresenceRecord>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize)]
struct CursorPatch {
    cursor_x: f64,
    cursor_y: f64,
    online: bool,
    last_seen: i64,
}

#[derive(Serialize)]
struct Heartbeat {
    online: bool,
    last_seen: i64,
}

pub struct PresenceTracker {
    feed: Arc<dyn ChangeFeed>,
    claim: SubscriptionClaim,
    user: UserIdentity,
    peers: Peers,
    last_cursor_write: Mutex<i64>,
    stale_ms: i64,
    throttle_ms: i64,
    task: JoinHandle<()>,
}

impl PresenceTracker {
    /// Subscribe to the presence collection and announce this user.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` if this session already tracks presence
    /// for the canvas, or the feed error if subscribing or announcing fails.
    pub async fn join(
        feed: Arc<dyn ChangeFeed>,
        registry: &SubscriptionRegistry,
        canvas_id: &str,
        user: UserIdentity,
        config: &SyncConfig,
    ) -> Result<Self, BridgeError> {
        let collection = presence_collection(canvas_id);
        let claim = registry.claim(&collection)?;
        let stream = feed.subscribe(&collection).await?;
        let record = PresenceRecord::joined(&user, now_ms());
        feed.write(&collection, &user.user_id, to_document(&record)?).await?;

        let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
        let heartbeat = Duration::from_millis(u64::try_from(config.presence_stale_ms / 2).unwrap_or(1).max(1));
        let task = tokio::spawn(run_presence(
            stream,
            Arc::clone(&feed),
            collection,
            user.user_id.clone(),
            Arc::clone(&peers),
            heartbeat,
        ));

        info!(%canvas_id, user_id = %user.user_id, "presence joined");
        Ok(Self {
            feed,
            claim,
            user,
            peers,
            last_cursor_write: Mutex::new(0),
            stale_ms: config.presence_stale_ms,
            throttle_ms: config.cursor_throttle_ms,
            task,
        })
    }

    /// Publish a cursor position unless the last one went out within the
    /// throttle window. Returns whether a write was made.
    pub async fn update_cursor(&self, x: f64, y: f64) -> bool {
        let now = now_ms();
        {
            let mut last = self.last_cursor_write.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_sub(*last) < self.throttle_ms {
                return false;
            }
            *last = now;
        }
        let patch = CursorPatch { cursor_x: x, cursor_y: y, online: true, last_seen: now };
        match write_own(self.feed.as_ref(), self.claim.collection(), &self.user.user_id, &patch).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "cursor update failed");
                false
            }
        }
    }

    /// Every known record, including this user's.
    #[must_use]
    pub fn peers(&self) -> Vec<PresenceRecord> {
        let mut peers = lock_peers(&self.peers).values().cloned().collect::<Vec<_>>();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    /// Other users seen recently, ordered by name.
    #[must_use]
    pub fn online_users(&self, now: i64) -> Vec<PresenceRecord> {
        let mut online = lock_peers(&self.peers)
            .values()
            .filter(|p| p.user_id != self.user.user_id && p.is_fresh_at(now, self.stale_ms))
            .cloned()
            .collect::<Vec<_>>();
        online.sort_by(|a, b| a.user_name.cmp(&b.user_name).then_with(|| a.user_id.cmp(&b.user_id)));
        online
    }

    /// Remove this user's record and stop tracking.
    pub async fn leave(self) {
        self.task.abort();
        if let Err(e) = self.feed.delete(self.claim.collection(), &self.user.user_id).await {
            warn!(error = %e, "presence leave failed; record will go stale");
        }
        info!(user_id = %self.user.user_id, "presence left");
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn write_own<T: Serialize>(
    feed: &dyn ChangeFeed,
    collection: &str,
    user_id: &str,
    patch: &T,
) -> Result<(), FeedError> {
    feed.write(collection, user_id, to_document(patch)?).await
}

fn apply_event(peers: &Peers, event: ChangeEvent) {
    let ChangeEvent { kind, document_id, data } = event;
    if kind == ChangeKind::Removed {
        lock_peers(peers).remove(&document_id);
        return;
    }
    let Some(data) = data else {
        return;
    };
    match from_document::<PresenceRecord>(data) {
        Ok(record) => {
            lock_peers(peers).insert(document_id, record);
        }
        Err(e) => debug!(%document_id, error = %e, "malformed presence record ignored"),
    }
}

async fn run_presence(
    mut stream: ChangeStream,
    feed: Arc<dyn ChangeFeed>,
    collection: String,
    user_id: String,
    peers: Peers,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_event = stream.recv() => {
                let Some(event) = maybe_event else {
                    warn!(%collection, "presence feed closed");
                    break;
                };
                apply_event(&peers, event);
            }
            _ = ticker.tick() => {
                let beat = Heartbeat { online: true, last_seen: now_ms() };
                if let Err(e) = write_own(feed.as_ref(), &collection, &user_id, &beat).await {
                    warn!(%collection, error = %e, "presence heartbeat failed");
                }
            }
        }
    }
}

