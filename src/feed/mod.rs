//! Change feed: the transport contract between clients and the shared backend.
//!
//! ARCHITECTURE
//! ============
//! The sync core never talks to a concrete backend. It depends only on:
//! - `subscribe(collection)` → stream of `{added|modified|removed, id, data}`
//! - `write` / `write_batch` → shallow field merge keyed by document id
//! - `delete` / `delete_batch`
//! - `merge_if` → merge guarded by a predicate evaluated atomically against
//!   the current document (used for the lease precondition)
//!
//! Documents are flat JSON maps. A write merges top-level keys into the stored
//! document (an explicit `null` overwrites), which is what makes field-level
//! last-write-wins possible.
//!
//! Backends: [`memory::MemoryFeed`] (in-process) and [`pg::PgFeed`]
//! (Postgres `jsonb` + `LISTEN/NOTIFY`).

pub mod memory;
pub mod pg;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ErrorCode;

/// Flat JSON document as stored by the backend.
pub type Document = serde_json::Map<String, Value>;

/// Inbound change notifications for one subscription.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// Precondition for [`ChangeFeed::merge_if`]. Receives the current document,
/// or `None` if it does not exist.
pub type MergeGuard = dyn Fn(Option<&Document>) -> bool + Send + Sync;

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One notification from the change feed. `data` is the full document after
/// the change, absent for removals.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub document_id: String,
    pub data: Option<Document>,
}

impl ChangeEvent {
    #[must_use]
    pub fn added(document_id: impl Into<String>, data: Document) -> Self {
        Self { kind: ChangeKind::Added, document_id: document_id.into(), data: Some(data) }
    }

    #[must_use]
    pub fn modified(document_id: impl Into<String>, data: Document) -> Self {
        Self { kind: ChangeKind::Modified, document_id: document_id.into(), data: Some(data) }
    }

    #[must_use]
    pub fn removed(document_id: impl Into<String>) -> Self {
        Self { kind: ChangeKind::Removed, document_id: document_id.into(), data: None }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("value is not a JSON object")]
    NotAnObject,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for FeedError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_FEED_UNAVAILABLE",
            Self::NotAnObject => "E_NOT_AN_OBJECT",
            Self::Serialization(_) => "E_SERIALIZATION",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Shared document backend with a change feed.
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to a collection. The stream starts with an `Added` event for
    /// every existing document, then carries live changes.
    async fn subscribe(&self, collection: &str) -> Result<ChangeStream, FeedError>;

    /// Merge `data` into the document, creating it if absent.
    async fn write(&self, collection: &str, document_id: &str, data: Document) -> Result<(), FeedError>;

    /// Merge several documents atomically: either all land or none do.
    async fn write_batch(&self, collection: &str, documents: Vec<(String, Document)>) -> Result<(), FeedError>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, document_id: &str) -> Result<(), FeedError>;

    /// Delete several documents atomically.
    async fn delete_batch(&self, collection: &str, document_ids: Vec<String>) -> Result<(), FeedError>;

    /// Merge `data` only if `guard` accepts the current document. Returns
    /// whether the write happened.
    async fn merge_if(
        &self,
        collection: &str,
        document_id: &str,
        guard: &MergeGuard,
        data: Document,
    ) -> Result<bool, FeedError>;
}

// =============================================================================
// HELPERS
// =============================================================================

/// Shallow merge: every top-level key of `patch` overwrites `target`.
pub fn merge_document(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

/// Serialize a value that must encode as a JSON object.
///
/// # Errors
///
/// Returns `NotAnObject` if the value is not a map, or a serialization error.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, FeedError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(FeedError::NotAnObject),
    }
}

/// Deserialize a document into a typed value.
///
/// # Errors
///
/// Returns a serialization error if the document does not match `T`.
pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, FeedError> {
    Ok(serde_json::from_value(Value::Object(document))?)
}
