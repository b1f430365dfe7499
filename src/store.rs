//! Local object store: the optimistic in-memory view of one canvas.
//!
//! DESIGN
//! ======
//! Every local mutation applies to the map immediately and enqueues a
//! `Mutation` on an ordered outbound queue; the sync bridge drains it in call
//! order. The store never awaits network I/O, so a user action is visible
//! before the backend has seen it.
//!
//! Locally created ids sit in the pending set until their own write comes
//! back through the change feed. While pending, the lock manager skips lease
//! writes for them (the backend document may not exist yet). Echoes of
//! pending creates are absorbed silently; every other remote change is
//! applied in arrival order, which yields last-write-wins per field.
//!
//! Local deletes leave a tombstone. Adds and modifies for a tombstoned id are
//! stale echoes of writes queued before the delete and are dropped, however
//! late or often they arrive. Creating the id locally again (undo of a
//! delete, a project load) marks the tombstone so the echo of our own delete
//! is absorbed once instead of removing the new object. Tombstones left over
//! are dropped by the pending sweep after the confirmation timeout.
//!
//! ERROR HANDLING
//! ==============
//! Missing ids are tolerated no-ops. A failed remote write never rolls local
//! state back: the bridge counts it and the next `flush` reports it.
//!
//! The mutex guards plain maps and is never held across an `.await`.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::ErrorCode;
use crate::feed::{ChangeEvent, ChangeKind, from_document};
use crate::object::{CanvasObject, Lease, ObjectId, ObjectPatch, ValidationError, now_ms};

// =============================================================================
// TYPES
// =============================================================================

/// One queued remote write, produced by a local mutation.
#[derive(Debug)]
pub enum Mutation {
    Put { object: CanvasObject },
    PutBatch { objects: Vec<CanvasObject> },
    /// Only the applied fields plus `updated_at`.
    Patch { id: ObjectId, patch: ObjectPatch },
    Delete { id: ObjectId },
    DeleteBatch { ids: Vec<ObjectId> },
    /// Answered once every mutation queued before it has been attempted.
    Flush(oneshot::Sender<FlushReport>),
}

/// Outcome of the writes attempted since the previous flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub failed_writes: usize,
    pub last_error: Option<String>,
}

impl FlushReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_writes == 0
    }
}

/// Change notifications for the rendering layer. Echoes of this client's
/// own pending creates produce nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Upserted(ObjectId),
    Removed(ObjectId),
    Reset,
}

/// One rejected item of a batch create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub code: &'static str,
    pub message: String,
}

impl BatchFailure {
    fn new(index: usize, error: &ValidationError) -> Self {
        Self { index, code: error.error_code(), message: error.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub created: Vec<ObjectId>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.created.len()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

#[derive(Default)]
struct StoreInner {
    objects: HashMap<ObjectId, CanvasObject>,
    /// Pending id -> local creation time (ms).
    pending: HashMap<ObjectId, i64>,
    tombstones: HashMap<ObjectId, Tombstone>,
    next_z: i64,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    deleted_at: i64,
    /// Created locally again since the delete.
    recreated: bool,
}

impl StoreInner {
    fn observe_z(&mut self, z: i64) {
        if z >= self.next_z {
            self.next_z = z.saturating_add(1);
        }
    }

    fn insert_local(&mut self, object: CanvasObject, now: i64) {
        self.observe_z(object.z_index);
        self.pending.insert(object.id.clone(), now);
        if let Some(tombstone) = self.tombstones.get_mut(&object.id) {
            tombstone.recreated = true;
        }
        self.objects.insert(object.id.clone(), object);
    }

    fn remove_local(&mut self, id: &str, now: i64) -> bool {
        self.pending.remove(id);
        let existed = self.objects.remove(id).is_some();
        if existed {
            self.tombstones.insert(id.to_owned(), Tombstone { deleted_at: now, recreated: false });
        }
        existed
    }
}

/// Fill in creation timestamps unless the object already carries them, which
/// is the case for snapshots restored by undo/redo.
fn stamp(object: &mut CanvasObject, now: i64) {
    if object.created_at == 0 {
        object.created_at = now;
    }
    if object.updated_at == 0 {
        object.updated_at = now;
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Cloneable handle to one session's object map.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<Mutex<StoreInner>>,
    outbound: mpsc::UnboundedSender<Mutation>,
    events: broadcast::Sender<StoreEvent>,
    config: SyncConfig,
}

impl ObjectStore {
    /// Create an empty store. The receiver is the ordered outbound queue the
    /// sync bridge drains.
    #[must_use]
    pub fn new(config: SyncConfig) -> (Self, mpsc::UnboundedReceiver<Mutation>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.feed_channel_capacity.max(1));
        let store = Self { inner: Arc::new(Mutex::new(StoreInner::default())), outbound, events, config };
        (store, rx)
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, mutation: Mutation) {
        if let Err(e) = self.outbound.send(mutation) {
            warn!(mutation = ?e.0, "outbound queue closed; change stays local");
        }
    }

    fn emit(&self, event: StoreEvent) {
        if self.events.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.events.send(event) {
            debug!(error = %e, "store event dropped");
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to local and remote changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Local mutations
    // -------------------------------------------------------------------------

    /// Insert an object, mark it pending, and schedule its remote write.
    pub fn create(&self, mut object: CanvasObject) -> ObjectId {
        let now = now_ms();
        stamp(&mut object, now);
        let id = object.id.clone();
        self.lock().insert_local(object.clone(), now);
        debug!(object_id = %id, kind = ?object.kind(), "store: created");
        self.enqueue(Mutation::Put { object });
        self.emit(StoreEvent::Upserted(id.clone()));
        id
    }

    /// Insert several objects with one grouped remote write.
    pub fn create_many(&self, objects: Vec<CanvasObject>) -> Vec<ObjectId> {
        if objects.is_empty() {
            return Vec::new();
        }
        let now = now_ms();
        let mut stamped = Vec::with_capacity(objects.len());
        {
            let mut inner = self.lock();
            for mut object in objects {
                stamp(&mut object, now);
                inner.insert_local(object.clone(), now);
                stamped.push(object);
            }
        }
        let ids = stamped.iter().map(|o| o.id.clone()).collect::<Vec<_>>();
        debug!(count = ids.len(), "store: created batch");
        self.enqueue(Mutation::PutBatch { objects: stamped });
        for id in &ids {
            self.emit(StoreEvent::Upserted(id.clone()));
        }
        ids
    }

    /// Validate, clamp, and create a batch. Items fail in isolation; items
    /// past the batch cap fail with `E_BATCH_CAP`.
    pub fn batch_create(&self, objects: Vec<CanvasObject>) -> BatchResult {
        let cap = self.config.batch_cap;
        let bounds = self.config.bounds;
        let mut accepted = Vec::new();
        let mut failed = Vec::new();

        for (index, mut object) in objects.into_iter().enumerate() {
            if index >= cap {
                failed.push(BatchFailure::new(index, &ValidationError::BatchCapExceeded { cap }));
                continue;
            }
            match object.shape.validate(bounds) {
                Ok(()) => {
                    object.shape.clamp_to(bounds);
                    accepted.push(object);
                }
                Err(e) => {
                    warn!(index, error = %e, code = e.error_code(), "batch item rejected");
                    failed.push(BatchFailure::new(index, &e));
                }
            }
        }

        let created = self.create_many(accepted);
        info!(succeeded = created.len(), failed = failed.len(), "store: batch create");
        BatchResult { created, failed }
    }

    /// Merge `patch` into an object. Returns `false` if the id is unknown.
    pub fn update(&self, id: &str, patch: &ObjectPatch) -> bool {
        let effective = {
            let mut inner = self.lock();
            let Some(object) = inner.objects.get_mut(id) else {
                debug!(object_id = %id, "update of unknown object ignored");
                return false;
            };
            let mut effective = object.apply_patch(patch);
            if effective.is_empty() {
                return true;
            }
            let now = now_ms();
            object.updated_at = now;
            effective.updated_at = Some(now);
            if let Some(z) = effective.z_index {
                inner.observe_z(z);
            }
            effective
        };
        self.enqueue(Mutation::Patch { id: id.to_owned(), patch: effective });
        self.emit(StoreEvent::Upserted(id.to_owned()));
        true
    }

    /// Remove an object. Deleting an unknown id is a successful no-op and
    /// sends nothing to the backend. Returns whether the object existed.
    pub fn delete(&self, id: &str) -> bool {
        let existed = self.lock().remove_local(id, now_ms());
        if !existed {
            debug!(object_id = %id, "delete of unknown object ignored");
            return false;
        }
        self.enqueue(Mutation::Delete { id: id.to_owned() });
        self.emit(StoreEvent::Removed(id.to_owned()));
        true
    }

    /// Remove several objects with one grouped remote delete. Returns the
    /// number actually removed.
    pub fn delete_many(&self, ids: &[ObjectId]) -> usize {
        let now = now_ms();
        let removed = {
            let mut inner = self.lock();
            ids.iter().filter(|id| inner.remove_local(id, now)).cloned().collect::<Vec<_>>()
        };
        if removed.is_empty() {
            return 0;
        }
        let count = removed.len();
        for id in &removed {
            self.emit(StoreEvent::Removed(id.clone()));
        }
        self.enqueue(Mutation::DeleteBatch { ids: removed });
        count
    }

    /// Delete every object locally and remotely.
    pub fn clear(&self) -> usize {
        let now = now_ms();
        let ids = {
            let mut inner = self.lock();
            inner.pending.clear();
            inner.next_z = 0;
            let mut ids = inner.objects.drain().map(|(id, _)| id).collect::<Vec<_>>();
            ids.sort();
            for id in &ids {
                inner.tombstones.insert(id.clone(), Tombstone { deleted_at: now, recreated: false });
            }
            ids
        };
        let count = ids.len();
        if count > 0 {
            self.enqueue(Mutation::DeleteBatch { ids });
        }
        info!(count, "store: cleared");
        self.emit(StoreEvent::Reset);
        count
    }

    /// Set or clear the lease field locally only. The lock manager writes the
    /// backend itself through a conditional merge.
    pub fn set_lease_local(&self, id: &str, lease: Option<Lease>) -> bool {
        {
            let mut inner = self.lock();
            let Some(object) = inner.objects.get_mut(id) else {
                return false;
            };
            if object.lock == lease {
                return true;
            }
            object.lock = lease;
        }
        self.emit(StoreEvent::Upserted(id.to_owned()));
        true
    }

    /// Hand out the next stacking position.
    pub fn next_z_index(&self) -> i64 {
        let mut inner = self.lock();
        let z = inner.next_z;
        inner.next_z = z.saturating_add(1);
        z
    }

    /// Queue a flush marker. The receiver resolves once the bridge has
    /// attempted every mutation queued before it.
    #[must_use]
    pub fn flush(&self) -> oneshot::Receiver<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Mutation::Flush(tx));
        rx
    }

    // -------------------------------------------------------------------------
    // Remote reconciliation
    // -------------------------------------------------------------------------

    /// Apply one change-feed event. Safe under duplicate and out-of-order
    /// delivery: applying the same event twice leaves the same state, and an
    /// id deleted here stays deleted until it is created here again.
    pub fn reconcile_remote(&self, event: ChangeEvent) {
        let ChangeEvent { kind, document_id, data } = event;
        if kind == ChangeKind::Removed {
            let existed = {
                let mut inner = self.lock();
                if inner.tombstones.get(&document_id).is_some_and(|t| t.recreated) {
                    inner.tombstones.remove(&document_id);
                    debug!(object_id = %document_id, "store: echo of our delete absorbed after re-create");
                    return;
                }
                inner.pending.remove(&document_id);
                inner.objects.remove(&document_id).is_some()
            };
            if existed {
                debug!(object_id = %document_id, "store: removed remotely");
                self.emit(StoreEvent::Removed(document_id));
            }
            return;
        }

        let Some(data) = data else {
            warn!(object_id = %document_id, "change event without data ignored");
            return;
        };
        let mut remote: CanvasObject = match from_document(data) {
            Ok(object) => object,
            Err(e) => {
                warn!(object_id = %document_id, error = %e, "undecodable remote document ignored");
                return;
            }
        };
        remote.id.clone_from(&document_id);

        {
            let mut inner = self.lock();
            if inner.tombstones.get(&document_id).is_some_and(|t| !t.recreated) {
                debug!(object_id = %document_id, "store: stale event for deleted object ignored");
                return;
            }
            inner.observe_z(remote.z_index);

            if inner.pending.remove(&document_id).is_some() {
                if let Some(local) = inner.objects.get_mut(&document_id) {
                    local.created_at = remote.created_at;
                    local.updated_at = remote.updated_at;
                }
                debug!(object_id = %document_id, "store: pending create confirmed");
                return;
            }

            if inner.objects.get(&document_id) == Some(&remote) {
                return;
            }
            inner.objects.insert(document_id.clone(), remote);
        }
        self.emit(StoreEvent::Upserted(document_id));
    }

    /// Drop pending entries older than the confirmation timeout. The objects
    /// stay; the write is treated as failed. Returns the expired ids.
    ///
    /// Tombstones older than the same timeout are dropped as well.
    pub fn expire_pending(&self, now: i64) -> Vec<ObjectId> {
        let timeout = self.config.pending_timeout_ms;
        let mut expired = {
            let mut inner = self.lock();
            inner.tombstones.retain(|_, t| now.saturating_sub(t.deleted_at) < timeout);
            let expired = inner
                .pending
                .iter()
                .filter(|(_, created)| now.saturating_sub(**created) >= timeout)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            for id in &expired {
                inner.pending.remove(id);
            }
            expired
        };
        expired.sort();
        for id in &expired {
            warn!(object_id = %id, timeout_ms = timeout, "pending create never confirmed; keeping local object");
        }
        expired
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn get(&self, id: &str) -> Option<CanvasObject> {
        self.lock().objects.get(id).cloned()
    }

    /// Snapshot of every object, ordered bottom to top.
    #[must_use]
    pub fn objects(&self) -> Vec<CanvasObject> {
        let mut objects = self.lock().objects.values().cloned().collect::<Vec<_>>();
        objects.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        objects
    }

    /// Snapshots for the given ids, skipping unknown ones, in input order.
    #[must_use]
    pub fn snapshots(&self, ids: &[ObjectId]) -> Vec<CanvasObject> {
        let inner = self.lock();
        ids.iter().filter_map(|id| inner.objects.get(id).cloned()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}
