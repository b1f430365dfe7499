//! Canvas session: one user's connection to one canvas.
//!
//! ARCHITECTURE
//! ============
//! The session is the explicit context object the UI, the AI orchestrator,
//! and project persistence talk to. It owns every component for one canvas:
//!
//! ```text
//!   UI / AI / persistence
//!          │
//!    CanvasSession ── UndoEngine ──┐
//!          │      └── LockManager ─┤
//!          ▼                       ▼
//!     ObjectStore ── mutations ──▶ SyncBridge ──▶ ChangeFeed
//!          ▲                                          │
//!          └────────── reconcile_remote ◀─────────────┘
//! ```
//!
//! Every entry point records undo history around the store mutation it
//! performs, so callers never touch the undo engine for ordinary edits.
//! Manual edits always get an operation id of their own, so an edit made
//! while an AI operation is recording stays a separate undo step.
//!
//! ERROR HANDLING
//! ==============
//! Lease conflicts never fail an action; they come back as `LockWarning`s.
//! Persistence failures only surface from `save`.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeError, SubscriptionRegistry, SyncBridge};
use crate::config::SyncConfig;
use crate::error::ErrorCode;
use crate::feed::ChangeFeed;
use crate::lock::{LockManager, LockWarning};
use crate::object::{
    AiProvenance, CanvasObject, LeaseKind, ObjectId, ObjectPatch, Shape, ShapeKind, UserIdentity, ValidationError,
};
use crate::presence::{PresenceRecord, PresenceTracker};
use crate::store::{BatchResult, ObjectStore};
use crate::undo::{EditSource, UndoEngine};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("{failed_writes} remote write(s) failed; last error: {last_error}")]
    Persistence { failed_writes: usize, last_error: String },
    #[error("sync worker stopped before the flush completed")]
    FlushAborted,
    #[error("no AI operation in progress")]
    NoAiOperation,
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_code(),
            Self::Bridge(e) => e.error_code(),
            Self::Persistence { .. } => "E_PERSISTENCE",
            Self::FlushAborted => "E_FLUSH_ABORTED",
            Self::NoAiOperation => "E_NO_AI_OPERATION",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Bridge(e) => e.retryable(),
            Self::Persistence { .. } => true,
            Self::Validation(_) | Self::FlushAborted | Self::NoAiOperation => false,
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Snapshot of the canvas handed to the AI orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasContext {
    pub canvas_id: String,
    pub objects: Vec<CanvasObject>,
    pub counts: BTreeMap<ShapeKind, usize>,
    pub selection: Vec<ObjectId>,
}

impl CanvasContext {
    #[must_use]
    pub fn total(&self) -> usize {
        self.objects.len()
    }
}

/// AI operation in progress.
#[derive(Debug, Clone)]
struct AiOperation {
    provenance: AiProvenance,
}

#[derive(Default)]
struct Interaction {
    selection: Vec<ObjectId>,
    /// Object id -> snapshot taken when its drag started.
    drags: HashMap<ObjectId, CanvasObject>,
    ai: Option<AiOperation>,
}

// =============================================================================
// SESSION
// =============================================================================

pub struct CanvasSession {
    canvas_id: String,
    config: SyncConfig,
    store: ObjectStore,
    locks: LockManager,
    undo: UndoEngine,
    presence: PresenceTracker,
    bridge: SyncBridge,
    interaction: Mutex<Interaction>,
}

impl CanvasSession {
    /// Connect to a canvas: subscribe to objects and presence, start the sync
    /// workers.
    ///
    /// # Errors
    ///
    /// Returns a bridge error if either subscription fails.
    pub async fn open(
        feed: Arc<dyn ChangeFeed>,
        canvas_id: &str,
        user: UserIdentity,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let registry = SubscriptionRegistry::new();
        let (store, mutations) = ObjectStore::new(config);
        let bridge = SyncBridge::connect(Arc::clone(&feed), &registry, canvas_id, store.clone(), mutations).await?;
        let presence = PresenceTracker::join(Arc::clone(&feed), &registry, canvas_id, user.clone(), &config).await?;
        let locks = LockManager::new(feed, canvas_id, store.clone(), user.clone(), config.lease);
        let undo = UndoEngine::new(store.clone(), config.undo_capacity);

        info!(%canvas_id, user_id = %user.user_id, "canvas session opened");
        Ok(Self {
            canvas_id: canvas_id.to_owned(),
            config,
            store,
            locks,
            undo,
            presence,
            bridge,
            interaction: Mutex::new(Interaction::default()),
        })
    }

    fn interaction(&self) -> MutexGuard<'_, Interaction> {
        self.interaction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    #[must_use]
    pub fn user(&self) -> &UserIdentity {
        self.locks.user()
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn undo_engine(&self) -> &UndoEngine {
        &self.undo
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    fn manual_operation() -> String {
        Uuid::new_v4().to_string()
    }

    fn new_object(&self, shape: Shape) -> CanvasObject {
        CanvasObject::new(self.user().user_id.clone(), self.store.next_z_index(), shape)
    }

    // -------------------------------------------------------------------------
    // Manual edits
    // -------------------------------------------------------------------------

    /// Validate, clamp, and create one object on top of the stack.
    ///
    /// # Errors
    ///
    /// Returns the validation error if the shape cannot be placed.
    pub fn create_object(&self, mut shape: Shape) -> Result<ObjectId, ValidationError> {
        shape.validate(self.config.bounds)?;
        shape.clamp_to(self.config.bounds);
        let id = self.store.create(self.new_object(shape));
        let operation_id = Self::manual_operation();
        self.undo.record_create(self.store.snapshots(&[id.clone()]), EditSource::Manual, Some(&operation_id));
        Ok(id)
    }

    /// Apply a field update. Proceeds even when someone else holds a lease,
    /// in which case the warning is returned. Unknown ids are ignored.
    pub fn update_object(&self, id: &str, patch: &ObjectPatch) -> Option<LockWarning> {
        let ids = [id.to_owned()];
        let previous = self.store.snapshots(&ids);
        if previous.is_empty() {
            debug!(object_id = %id, "update of unknown object ignored");
            return None;
        }
        let warning = self.locks.warning_for(id);
        if self.store.update(id, patch) {
            let operation_id = Self::manual_operation();
            self.undo.record_update(&ids, previous, EditSource::Manual, Some(&operation_id));
        }
        warning
    }

    /// Delete objects as one undo step. Snapshots are taken before deleting.
    pub fn delete_objects(&self, ids: &[ObjectId]) -> Vec<LockWarning> {
        let snapshots = self.store.snapshots(ids);
        if snapshots.is_empty() {
            return Vec::new();
        }
        let warnings = ids.iter().filter_map(|id| self.locks.warning_for(id)).collect::<Vec<_>>();
        self.store.delete_many(ids);
        let operation_id = Self::manual_operation();
        self.undo.record_delete(snapshots, EditSource::Manual, Some(&operation_id));
        self.interaction().selection.retain(|s| !ids.contains(s));
        warnings
    }

    // -------------------------------------------------------------------------
    // Interactions
    // -------------------------------------------------------------------------

    /// Start dragging: take an edit lease (kept alive until `end_drag`) and
    /// remember the starting state for undo.
    pub async fn begin_drag(&self, id: &str) -> Option<LockWarning> {
        let Some(start) = self.store.get(id) else {
            debug!(object_id = %id, "drag of unknown object ignored");
            return None;
        };
        self.interaction().drags.insert(id.to_owned(), start);
        self.locks.begin_interaction(id, LeaseKind::Edit).await
    }

    /// Move a dragged object. Intermediate positions are not recorded.
    pub fn drag_to(&self, id: &str, x: f64, y: f64) -> bool {
        self.store.update(id, &ObjectPatch::position(x, y))
    }

    /// Finish a drag: one undo entry from start to end, edit lease released.
    /// A selected object goes back to a select lease.
    pub async fn end_drag(&self, id: &str) {
        let start = self.interaction().drags.remove(id);
        if let Some(start) = start {
            let operation_id = Self::manual_operation();
            self.undo.record_update(&[id.to_owned()], vec![start], EditSource::Manual, Some(&operation_id));
        }
        self.locks.end_interaction(id).await;
        let selected = self.interaction().selection.iter().any(|s| s == id);
        if selected {
            self.locks.begin_interaction(id, LeaseKind::Select).await;
        }
    }

    /// Replace the selection, moving select leases accordingly. Returns
    /// warnings for newly selected objects held by others.
    pub async fn select(&self, ids: Vec<ObjectId>) -> Vec<LockWarning> {
        let previous = std::mem::replace(&mut self.interaction().selection, ids.clone());
        let keep = ids.iter().collect::<HashSet<_>>();

        for id in previous.iter().filter(|id| !keep.contains(id)) {
            self.locks.release_lock(id).await;
        }

        let mut warnings = Vec::new();
        for id in ids.iter().filter(|id| !previous.contains(id)) {
            if let Some(warning) = self.locks.begin_interaction(id, LeaseKind::Select).await {
                warnings.push(warning);
            }
        }
        warnings
    }

    #[must_use]
    pub fn selection(&self) -> Vec<ObjectId> {
        self.interaction().selection.clone()
    }

    // -------------------------------------------------------------------------
    // AI operations
    // -------------------------------------------------------------------------

    /// Start grouping AI mutations under one operation id. Returns the id.
    pub fn begin_ai_operation(&self, command: &str) -> String {
        let operation_id = self.undo.begin_operation(None);
        let provenance = AiProvenance {
            session_id: format!("{}:{}", self.canvas_id, self.user().user_id),
            command: command.to_owned(),
            operation_id: operation_id.clone(),
        };
        self.interaction().ai = Some(AiOperation { provenance });
        info!(%operation_id, %command, "ai operation started");
        operation_id
    }

    fn ai_provenance(&self) -> Result<AiProvenance, SessionError> {
        self.interaction()
            .ai
            .as_ref()
            .map(|op| op.provenance.clone())
            .ok_or(SessionError::NoAiOperation)
    }

    /// Batch-create AI objects. Invalid shapes fail individually.
    ///
    /// # Errors
    ///
    /// Returns `NoAiOperation` outside `begin_ai_operation`/`end_ai_operation`.
    pub fn ai_create(&self, shapes: Vec<Shape>) -> Result<BatchResult, SessionError> {
        let provenance = self.ai_provenance()?;
        let objects = shapes
            .into_iter()
            .map(|shape| self.new_object(shape).with_ai(provenance.clone()))
            .collect();
        let result = self.store.batch_create(objects);
        self.undo.record_create(self.store.snapshots(&result.created), EditSource::Ai, None);
        Ok(result)
    }

    /// Apply AI field updates. Unknown ids are skipped. Returns how many
    /// objects changed.
    ///
    /// # Errors
    ///
    /// Returns `NoAiOperation` outside an AI operation.
    pub fn ai_update(&self, updates: Vec<(ObjectId, ObjectPatch)>) -> Result<usize, SessionError> {
        self.ai_provenance()?;
        let ids = updates.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let previous = self.store.snapshots(&ids);
        let mut changed = Vec::new();
        for (id, patch) in &updates {
            if self.store.update(id, patch) {
                changed.push(id.clone());
            }
        }
        self.undo.record_update(&changed, previous, EditSource::Ai, None);
        Ok(changed.len())
    }

    /// Delete objects on behalf of the AI. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `NoAiOperation` outside an AI operation.
    pub fn ai_delete(&self, ids: &[ObjectId]) -> Result<usize, SessionError> {
        self.ai_provenance()?;
        let snapshots = self.store.snapshots(ids);
        let removed = self.store.delete_many(ids);
        self.undo.record_delete(snapshots, EditSource::Ai, None);
        Ok(removed)
    }

    pub fn end_ai_operation(&self) {
        if let Some(op) = self.interaction().ai.take() {
            info!(operation_id = %op.provenance.operation_id, "ai operation ended");
        }
        self.undo.end_operation();
    }

    // -------------------------------------------------------------------------
    // History
    // -------------------------------------------------------------------------

    pub fn undo(&self) -> bool {
        self.undo.undo()
    }

    pub fn redo(&self) -> bool {
        self.undo.redo()
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Current optimistic view of the canvas.
    #[must_use]
    pub fn context(&self) -> CanvasContext {
        let objects = self.store.objects();
        let mut counts = BTreeMap::new();
        for object in &objects {
            *counts.entry(object.kind()).or_insert(0) += 1;
        }
        CanvasContext { canvas_id: self.canvas_id.clone(), objects, counts, selection: self.selection() }
    }

    #[must_use]
    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.presence.online_users(crate::object::now_ms())
    }

    // -------------------------------------------------------------------------
    // Project persistence
    // -------------------------------------------------------------------------

    /// Wait for every queued write and return the full object set.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if any remote write failed since the previous
    /// save, or `FlushAborted` if the sync worker is gone.
    pub async fn save(&self) -> Result<Vec<CanvasObject>, SessionError> {
        let report = self.store.flush().await.map_err(|_| SessionError::FlushAborted)?;
        if !report.is_clean() {
            let err = SessionError::Persistence {
                failed_writes: report.failed_writes,
                last_error: report.last_error.unwrap_or_default(),
            };
            warn!(canvas_id = %self.canvas_id, error = %err, "save found failed writes");
            return Err(err);
        }
        Ok(self.store.objects())
    }

    /// Replace the canvas with saved `objects`, keeping their ids, stacking,
    /// and geometry. Leases held here are released and saved leases dropped.
    /// A running AI operation ends; history and selection start over.
    /// Returns how many objects were loaded.
    pub async fn load(&self, objects: Vec<CanvasObject>) -> usize {
        self.locks.release_all().await;
        {
            let mut interaction = self.interaction();
            interaction.selection.clear();
            interaction.drags.clear();
            if let Some(op) = interaction.ai.take() {
                info!(operation_id = %op.provenance.operation_id, "ai operation ended by load");
            }
        }

        self.store.clear();
        let objects = objects
            .into_iter()
            .map(|mut object| {
                object.lock = None;
                object
            })
            .collect();
        let loaded = self.store.create_many(objects).len();
        self.undo.clear();
        info!(canvas_id = %self.canvas_id, loaded, "project loaded");
        loaded
    }

    /// Release leases, flush pending writes, leave presence, stop syncing.
    pub async fn close(self) {
        self.locks.release_all().await;
        match self.store.flush().await {
            Ok(report) if !report.is_clean() => {
                warn!(canvas_id = %self.canvas_id, failed_writes = report.failed_writes, "closing with failed writes");
            }
            Ok(_) => {}
            Err(e) => warn!(canvas_id = %self.canvas_id, error = %e, "flush on close aborted"),
        }
        self.bridge.shutdown();
        self.presence.leave().await;
        info!(canvas_id = %self.canvas_id, "canvas session closed");
    }
}
