//! Lock manager: advisory leases on canvas objects.
//!
//! DESIGN
//! ======
//! A lease is a hint, never a gate. Acquiring writes `{user, kind,
//! expires_at}` into the object's backend document through a conditional
//! merge that only succeeds when no other user holds an unexpired lease.
//! Whatever the outcome, the caller's action proceeds; a foreign lease only
//! produces a `LockWarning` for the UI.
//!
//! Expiry is evaluated by each reader against its own clock. Nobody clears a
//! stale lease held by someone else; the next writer simply overwrites it.
//!
//! Ids still in the store's pending set are skipped: their backend document
//! may not exist yet, and writing a lease field there would create a partial
//! document.
//!
//! RENEWAL
//! =======
//! Every interaction, a drag or a selection, keeps its lease alive with a
//! task that re-issues the lease every `renew_ms` (always shorter than the
//! TTL). The task stops when the interaction ends or when the conditional
//! write fails because another user has taken over. A plain `acquire_lock`
//! is not renewed.

#[cfg(test)]
#[path = "lock_test.rs"]
mod lock_test;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::feed::{ChangeFeed, Document, FeedError, to_document};
use crate::object::{Lease, LeaseKind, ObjectId, ObjectPatch, UserIdentity, now_ms};
use crate::store::ObjectStore;

/// Lease state of one object as seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    OwnedBySelf,
    Foreign(Lease),
}

/// Shown to the user when they act on an object someone else is holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockWarning {
    pub object_id: ObjectId,
    pub holder_id: String,
    pub holder_name: String,
    pub holder_color: String,
    pub kind: LeaseKind,
    pub expires_at: i64,
}

impl LockWarning {
    fn from_lease(object_id: &str, lease: &Lease) -> Self {
        Self {
            object_id: object_id.to_owned(),
            holder_id: lease.user_id.clone(),
            holder_name: lease.user_name.clone(),
            holder_color: lease.user_color.clone(),
            kind: lease.kind,
            expires_at: lease.expires_at,
        }
    }
}

impl fmt::Display for LockWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            LeaseKind::Select => "has selected",
            LeaseKind::Edit => "is editing",
        };
        write!(f, "{} {verb} this object", self.holder_name)
    }
}

/// Everything a lease write needs, shared with renewal tasks.
#[derive(Clone)]
struct LeaseWriter {
    feed: Arc<dyn ChangeFeed>,
    canvas_id: String,
    store: ObjectStore,
    user: UserIdentity,
    config: LeaseConfig,
}

impl LeaseWriter {
    /// Conditionally write a fresh lease. `Ok(false)` means another user
    /// holds an active lease or the document is gone.
    async fn write(&self, id: &str, kind: LeaseKind) -> Result<bool, FeedError> {
        let now = now_ms();
        let lease = self.user.lease(kind, now.saturating_add(self.config.ttl()));
        let user_id = self.user.user_id.clone();
        let guard = move |current: Option<&Document>| {
            current.is_some_and(|doc| !lease_in(doc).is_some_and(|l| l.is_foreign_active_at(&user_id, now)))
        };
        let patch = to_document(&ObjectPatch::lease(Some(lease.clone())))?;
        let wrote = self.feed.merge_if(&self.canvas_id, id, &guard, patch).await?;
        if wrote {
            self.store.set_lease_local(id, Some(lease));
        }
        Ok(wrote)
    }

    /// Clear the lease only if this user holds it.
    async fn clear(&self, id: &str) -> Result<bool, FeedError> {
        let user_id = self.user.user_id.clone();
        let guard = move |current: Option<&Document>| {
            current.and_then(lease_in).is_some_and(|l| l.user_id == user_id)
        };
        let patch = to_document(&ObjectPatch::lease(None))?;
        let wrote = self.feed.merge_if(&self.canvas_id, id, &guard, patch).await?;
        if wrote {
            self.store.set_lease_local(id, None);
        }
        Ok(wrote)
    }
}

/// Lease stored in a backend document, if any.
fn lease_in(document: &Document) -> Option<Lease> {
    let value = document.get("lock")?;
    if value.is_null() {
        return None;
    }
    match Lease::deserialize(value) {
        Ok(lease) => Some(lease),
        Err(e) => {
            debug!(error = %e, "malformed lease field treated as free");
            None
        }
    }
}

pub struct LockManager {
    writer: LeaseWriter,
    renewals: Mutex<HashMap<ObjectId, JoinHandle<()>>>,
}

impl LockManager {
    #[must_use]
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        canvas_id: impl Into<String>,
        store: ObjectStore,
        user: UserIdentity,
        config: LeaseConfig,
    ) -> Self {
        Self {
            writer: LeaseWriter { feed, canvas_id: canvas_id.into(), store, user, config },
            renewals: Mutex::new(HashMap::new()),
        }
    }

    fn renewals(&self) -> MutexGuard<'_, HashMap<ObjectId, JoinHandle<()>>> {
        self.renewals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn user(&self) -> &UserIdentity {
        &self.writer.user
    }

    /// Try to take a lease. Pending objects are skipped and report success.
    pub async fn acquire_lock(&self, id: &str, kind: LeaseKind) -> bool {
        if self.writer.store.is_pending(id) {
            debug!(object_id = %id, "lease skipped for pending object");
            return true;
        }
        match self.writer.write(id, kind).await {
            Ok(true) => {
                debug!(object_id = %id, ?kind, "lease acquired");
                true
            }
            Ok(false) => {
                debug!(object_id = %id, ?kind, "lease held elsewhere");
                false
            }
            Err(e) => {
                warn!(object_id = %id, error = %e, "lease write failed");
                false
            }
        }
    }

    /// Clear this user's lease. A lease held by anyone else is left alone.
    pub async fn release_lock(&self, id: &str) -> bool {
        self.stop_renewal(id);
        if self.writer.store.is_pending(id) {
            return false;
        }
        match self.writer.clear(id).await {
            Ok(released) => {
                debug!(object_id = %id, released, "lease release");
                released
            }
            Err(e) => {
                warn!(object_id = %id, error = %e, "lease release failed");
                false
            }
        }
    }

    /// Local view of who holds `id`.
    #[must_use]
    pub fn lock_status(&self, id: &str) -> LockStatus {
        let Some(object) = self.writer.store.get(id) else {
            return LockStatus::Free;
        };
        match object.lock {
            Some(lease) if lease.is_active_at(now_ms()) => {
                if lease.is_foreign(&self.writer.user.user_id) {
                    LockStatus::Foreign(lease)
                } else {
                    LockStatus::OwnedBySelf
                }
            }
            _ => LockStatus::Free,
        }
    }

    /// Warning for acting on `id` right now, if someone else holds it.
    #[must_use]
    pub fn warning_for(&self, id: &str) -> Option<LockWarning> {
        match self.lock_status(id) {
            LockStatus::Foreign(lease) => Some(LockWarning::from_lease(id, &lease)),
            LockStatus::Free | LockStatus::OwnedBySelf => None,
        }
    }

    /// Start an interaction: warn if contended, take the lease, and keep it
    /// alive until `end_interaction`. Never blocks the action.
    pub async fn begin_interaction(&self, id: &str, kind: LeaseKind) -> Option<LockWarning> {
        let warning = self.warning_for(id);
        if let Some(w) = &warning {
            info!(object_id = %id, holder = %w.holder_id, "acting on an object leased by another user");
        }
        let acquired = self.acquire_lock(id, kind).await;
        if acquired {
            self.start_renewal(id, kind);
        }
        warning
    }

    pub async fn end_interaction(&self, id: &str) -> bool {
        self.release_lock(id).await
    }

    #[must_use]
    pub fn is_renewing(&self, id: &str) -> bool {
        self.renewals().get(id).is_some_and(|h| !h.is_finished())
    }

    fn start_renewal(&self, id: &str, kind: LeaseKind) {
        let writer = self.writer.clone();
        let object_id = id.to_owned();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(writer.config.renew_interval());
            // The first tick fires immediately; the lease was just written.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if writer.store.is_pending(&object_id) {
                    continue;
                }
                match writer.write(&object_id, kind).await {
                    Ok(true) => debug!(%object_id, "lease renewed"),
                    Ok(false) => {
                        info!(%object_id, "lease taken over; renewal stopped");
                        break;
                    }
                    Err(e) => warn!(%object_id, error = %e, "lease renewal failed"),
                }
            }
        });
        if let Some(previous) = self.renewals().insert(id.to_owned(), handle) {
            previous.abort();
        }
    }

    fn stop_renewal(&self, id: &str) {
        if let Some(handle) = self.renewals().remove(id) {
            handle.abort();
        }
    }

    /// Stop every renewal and release every lease this user holds locally.
    pub async fn release_all(&self) -> usize {
        let mut ids = self
            .renewals()
            .drain()
            .map(|(id, handle)| {
                handle.abort();
                id
            })
            .collect::<Vec<_>>();
        let me = &self.writer.user.user_id;
        for object in self.writer.store.objects() {
            if object.lock.as_ref().is_some_and(|l| &l.user_id == me) && !ids.contains(&object.id) {
                ids.push(object.id);
            }
        }

        let mut released = 0;
        for id in &ids {
            if self.release_lock(id).await {
                released += 1;
            }
        }
        info!(released, "released all leases");
        released
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        for handle in self.renewals().values() {
            handle.abort();
        }
    }
}
