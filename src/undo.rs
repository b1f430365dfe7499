//! Undo/redo engine with operation grouping.
//!
//! DESIGN
//! ======
//! Entries hold full object snapshots, not diffs. Every entry carries an
//! operation id; all entries sharing the top entry's operation id undo and
//! redo as one step, so an 11-object generated layout is one undo.
//!
//! Operation ids come from, in order: an explicit id passed by the caller,
//! the id of the operation currently being recorded (`begin_operation`), or
//! a fresh id per call.
//!
//! Undo and redo never touch the backend directly. They call the store's
//! mutation entry points, which queue remote writes like any user edit.
//! Objects brought back by undoing a delete or redoing a create come back
//! without a lease. Restoring a previous state leaves the current lease
//! alone, whoever holds it.

#[cfg(test)]
#[path = "undo_test.rs"]
mod undo_test;

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

use crate::object::{CanvasObject, ObjectId, ObjectPatch, now_ms};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Create,
    Update,
    Delete,
}

/// Who made the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditSource {
    Manual,
    Ai,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub operation_id: String,
    pub kind: EntryKind,
    pub source: EditSource,
    /// Snapshots after the change (create/update) or before it (delete).
    pub objects: Vec<CanvasObject>,
    /// Snapshots before the change. Update entries only.
    pub previous_states: Vec<CanvasObject>,
    pub timestamp: i64,
}

impl UndoEntry {
    fn ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|o| o.id.clone()).collect()
    }

    /// Fold a later entry of the same operation and kind into this one.
    fn absorb(&mut self, later: UndoEntry) {
        self.timestamp = later.timestamp;
        match self.kind {
            EntryKind::Create | EntryKind::Delete => {
                for object in later.objects {
                    match self.objects.iter_mut().find(|o| o.id == object.id) {
                        Some(existing) => *existing = object,
                        None => self.objects.push(object),
                    }
                }
            }
            EntryKind::Update => {
                for (object, previous) in later.objects.into_iter().zip(later.previous_states) {
                    if let Some(existing) = self.objects.iter_mut().find(|o| o.id == object.id) {
                        // Keep the earliest previous state, take the latest result.
                        *existing = object;
                    } else {
                        self.objects.push(object);
                        self.previous_states.push(previous);
                    }
                }
            }
        }
    }
}

/// Whether calls are currently being grouped under one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording(String),
}

struct History {
    undo: Vec<UndoEntry>,
    redo: Vec<UndoEntry>,
    state: RecorderState,
}

pub struct UndoEngine {
    store: ObjectStore,
    capacity: usize,
    history: Mutex<History>,
}

fn without_lease(mut object: CanvasObject) -> CanvasObject {
    object.lock = None;
    object
}

impl UndoEngine {
    #[must_use]
    pub fn new(store: ObjectStore, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            history: Mutex::new(History { undo: Vec::new(), redo: Vec::new(), state: RecorderState::Idle }),
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Grouping
    // -------------------------------------------------------------------------

    /// Start grouping records under one operation id, generating one if not
    /// given. Returns the id in use.
    pub fn begin_operation(&self, operation_id: Option<String>) -> String {
        let id = operation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut history = self.history();
        if let RecorderState::Recording(previous) = &history.state {
            debug!(%previous, next = %id, "operation replaced before it ended");
        }
        history.state = RecorderState::Recording(id.clone());
        id
    }

    pub fn end_operation(&self) {
        self.history().state = RecorderState::Idle;
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.history().state.clone()
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record freshly created objects (snapshots taken after the create).
    pub fn record_create(&self, objects: Vec<CanvasObject>, source: EditSource, operation_id: Option<&str>) {
        self.record(EntryKind::Create, objects, Vec::new(), source, operation_id);
    }

    /// Record an update. `previous_states` are the snapshots taken before the
    /// change; the current state of `ids` is read from the store.
    pub fn record_update(
        &self,
        ids: &[ObjectId],
        previous_states: Vec<CanvasObject>,
        source: EditSource,
        operation_id: Option<&str>,
    ) {
        let mut objects = Vec::with_capacity(ids.len());
        let mut previous = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(before) = previous_states.iter().find(|o| &o.id == id) else {
                continue;
            };
            let Some(after) = self.store.get(id) else {
                continue;
            };
            objects.push(after);
            previous.push(before.clone());
        }
        self.record(EntryKind::Update, objects, previous, source, operation_id);
    }

    /// Record a delete. Snapshots must be captured before the delete runs.
    pub fn record_delete(&self, deleted: Vec<CanvasObject>, source: EditSource, operation_id: Option<&str>) {
        self.record(EntryKind::Delete, deleted, Vec::new(), source, operation_id);
    }

    fn record(
        &self,
        kind: EntryKind,
        objects: Vec<CanvasObject>,
        previous_states: Vec<CanvasObject>,
        source: EditSource,
        operation_id: Option<&str>,
    ) {
        if objects.is_empty() {
            return;
        }
        let mut history = self.history();
        let operation_id = match (operation_id, &history.state) {
            (Some(id), _) => id.to_owned(),
            (None, RecorderState::Recording(id)) => id.clone(),
            (None, RecorderState::Idle) => Uuid::new_v4().to_string(),
        };
        let entry = UndoEntry { operation_id, kind, source, objects, previous_states, timestamp: now_ms() };
        debug!(operation_id = %entry.operation_id, ?kind, count = entry.objects.len(), "undo: recorded");

        match history.undo.last_mut() {
            Some(top) if top.operation_id == entry.operation_id && top.kind == kind => top.absorb(entry),
            _ => history.undo.push(entry),
        }
        history.redo.clear();
        self.truncate(&mut history.undo);
    }

    /// Drop whole operation groups from the bottom until under capacity.
    fn truncate(&self, undo: &mut Vec<UndoEntry>) {
        while undo.len() > self.capacity {
            let oldest = undo[0].operation_id.clone();
            let group = undo.iter().take_while(|e| e.operation_id == oldest).count();
            undo.drain(..group);
            debug!(operation_id = %oldest, "undo: oldest step dropped at capacity");
        }
    }

    // -------------------------------------------------------------------------
    // Undo / redo
    // -------------------------------------------------------------------------

    /// Revert the most recent operation. Returns `false` when there is
    /// nothing to undo.
    pub fn undo(&self) -> bool {
        let group = {
            let mut history = self.history();
            pop_group(&mut history.undo)
        };
        if group.is_empty() {
            return false;
        }
        for entry in &group {
            self.revert(entry);
        }
        info!(operation_id = %group[0].operation_id, entries = group.len(), "undo applied");
        self.history().redo.extend(group);
        true
    }

    /// Re-apply the most recently undone operation. Returns `false` when
    /// there is nothing to redo.
    pub fn redo(&self) -> bool {
        let group = {
            let mut history = self.history();
            pop_group(&mut history.redo)
        };
        if group.is_empty() {
            return false;
        }
        for entry in &group {
            self.reapply(entry);
        }
        info!(operation_id = %group[0].operation_id, entries = group.len(), "redo applied");
        self.history().undo.extend(group);
        true
    }

    fn revert(&self, entry: &UndoEntry) {
        match entry.kind {
            EntryKind::Create => {
                self.store.delete_many(&entry.ids());
            }
            EntryKind::Delete => {
                self.store.create_many(entry.objects.iter().cloned().map(without_lease).collect());
            }
            EntryKind::Update => {
                for previous in &entry.previous_states {
                    if !self.store.update(&previous.id, &ObjectPatch::from_snapshot(previous)) {
                        debug!(object_id = %previous.id, "undo target no longer exists");
                    }
                }
            }
        }
    }

    fn reapply(&self, entry: &UndoEntry) {
        match entry.kind {
            EntryKind::Create => {
                self.store.create_many(entry.objects.iter().cloned().map(without_lease).collect());
            }
            EntryKind::Delete => {
                self.store.delete_many(&entry.ids());
            }
            EntryKind::Update => {
                for object in &entry.objects {
                    if !self.store.update(&object.id, &ObjectPatch::from_snapshot(object)) {
                        debug!(object_id = %object.id, "redo target no longer exists");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.history().undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.history().redo.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.history().undo.len()
    }

    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.history().redo.len()
    }

    /// Top undo entry, for inspection.
    #[must_use]
    pub fn peek_undo(&self) -> Option<UndoEntry> {
        self.history().undo.last().cloned()
    }

    /// Forget all history and stop any recording.
    pub fn clear(&self) {
        let mut history = self.history();
        history.undo.clear();
        history.redo.clear();
        history.state = RecorderState::Idle;
    }
}

/// Pop every consecutive entry sharing the top entry's operation id, most
/// recent first.
fn pop_group(stack: &mut Vec<UndoEntry>) -> Vec<UndoEntry> {
    let Some(top) = stack.last() else {
        return Vec::new();
    };
    let operation_id = top.operation_id.clone();
    let mut group = Vec::new();
    while stack.last().is_some_and(|e| e.operation_id == operation_id) {
        if let Some(entry) = stack.pop() {
            group.push(entry);
        }
    }
    group
}
