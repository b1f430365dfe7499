//! Postgres change feed backend.
//!
//! DESIGN
//! ======
//! Documents are rows of `canvas_documents(collection, doc_id, data jsonb)`.
//! Writes upsert with `data || patch`, which is exactly the shallow field
//! merge the contract asks for. Batches run in one transaction so a generated
//! layout is never half-visible to other clients.
//!
//! The change feed rides on `LISTEN/NOTIFY`: a trigger publishes
//! `{collection, doc_id, op}` for every row change and each subscription
//! fetches the current row for inserts and updates. Payloads stay small that
//! way, well below the notify size limit.
//!
//! ERROR HANDLING
//! ==============
//! A listener error ends that subscription's forwarding task; the receiver
//! then sees the stream close and the owner decides whether to resubscribe.

#[cfg(test)]
#[path = "pg_test.rs"]
mod pg_test;

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeFeed, ChangeStream, Document, FeedError, MergeGuard};
use crate::config::DEFAULT_FEED_CHANNEL_CAPACITY;

/// Notify channel populated by the `canvas_documents_notify` trigger.
pub const NOTIFY_CHANNEL: &str = "canvas_documents";

const UPSERT_SQL: &str = "INSERT INTO canvas_documents (collection, doc_id, data) VALUES ($1, $2, $3) \
     ON CONFLICT (collection, doc_id) DO UPDATE SET \
         data = canvas_documents.data || EXCLUDED.data, updated_at = now()";

/// Row-change notification published by the trigger.
#[derive(Debug, Deserialize)]
struct RowChange {
    collection: String,
    doc_id: String,
    op: String,
}

#[derive(Clone)]
pub struct PgFeed {
    pool: PgPool,
    capacity: usize,
}

impl PgFeed {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool, capacity: DEFAULT_FEED_CHANNEL_CAPACITY }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

fn as_document(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ChangeFeed for PgFeed {
    async fn subscribe(&self, collection: &str) -> Result<ChangeStream, FeedError> {
        // Listen before reading the snapshot so no change falls in between.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let snapshot = sqlx::query_as::<_, (String, Value)>(
            "SELECT doc_id, data FROM canvas_documents WHERE collection = $1 ORDER BY doc_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let (tx, rx) = mpsc::channel(self.capacity.max(snapshot.len() + 1));
        for (doc_id, data) in snapshot {
            let Some(document) = as_document(data) else {
                warn!(%collection, %doc_id, "skipping non-object document in snapshot");
                continue;
            };
            if tx.try_send(ChangeEvent::added(doc_id, document)).is_err() {
                warn!(%collection, "snapshot event dropped");
            }
        }

        info!(%collection, "pg feed: subscribed");
        tokio::spawn(forward_notifications(listener, self.pool.clone(), collection.to_owned(), tx));
        Ok(rx)
    }

    async fn write(&self, collection: &str, document_id: &str, data: Document) -> Result<(), FeedError> {
        sqlx::query(UPSERT_SQL)
            .bind(collection)
            .bind(document_id)
            .bind(Value::Object(data))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_batch(&self, collection: &str, documents: Vec<(String, Document)>) -> Result<(), FeedError> {
        let mut tx = self.pool.begin().await?;
        for (document_id, data) in documents {
            sqlx::query(UPSERT_SQL)
                .bind(collection)
                .bind(&document_id)
                .bind(Value::Object(data))
                .execute(tx.as_mut())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, document_id: &str) -> Result<(), FeedError> {
        sqlx::query("DELETE FROM canvas_documents WHERE collection = $1 AND doc_id = $2")
            .bind(collection)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_batch(&self, collection: &str, document_ids: Vec<String>) -> Result<(), FeedError> {
        sqlx::query("DELETE FROM canvas_documents WHERE collection = $1 AND doc_id = ANY($2)")
            .bind(collection)
            .bind(&document_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_if(
        &self,
        collection: &str,
        document_id: &str,
        guard: &MergeGuard,
        data: Document,
    ) -> Result<bool, FeedError> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM canvas_documents WHERE collection = $1 AND doc_id = $2 FOR UPDATE",
        )
        .bind(collection)
        .bind(document_id)
        .fetch_optional(tx.as_mut())
        .await?
        .and_then(as_document);

        if !guard(current.as_ref()) {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(UPSERT_SQL)
            .bind(collection)
            .bind(document_id)
            .bind(Value::Object(data))
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

/// Translate notifications for one collection into change events until the
/// subscriber goes away or the listener fails.
async fn forward_notifications(
    mut listener: PgListener,
    pool: PgPool,
    collection: String,
    tx: mpsc::Sender<ChangeEvent>,
) {
    loop {
        let notification = tokio::select! {
            () = tx.closed() => break,
            received = listener.recv() => match received {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, %collection, "pg feed: listener failed; closing subscription");
                    break;
                }
            },
        };

        let change = match serde_json::from_str::<RowChange>(notification.payload()) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, "pg feed: malformed notification payload");
                continue;
            }
        };
        if change.collection != collection {
            continue;
        }

        let event = match change.op.as_str() {
            "DELETE" => ChangeEvent::removed(change.doc_id),
            "INSERT" | "UPDATE" => {
                let fetched = sqlx::query_scalar::<_, Value>(
                    "SELECT data FROM canvas_documents WHERE collection = $1 AND doc_id = $2",
                )
                .bind(&collection)
                .bind(&change.doc_id)
                .fetch_optional(&pool)
                .await;
                let document = match fetched {
                    Ok(Some(value)) => as_document(value),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, doc_id = %change.doc_id, "pg feed: fetch after notify failed");
                        None
                    }
                };
                // EDGE: the row may already be gone again; its DELETE notify follows.
                let Some(document) = document else {
                    continue;
                };
                if change.op == "INSERT" {
                    ChangeEvent::added(change.doc_id, document)
                } else {
                    ChangeEvent::modified(change.doc_id, document)
                }
            }
            other => {
                debug!(op = %other, "pg feed: ignoring notification");
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
    debug!(%collection, "pg feed: forwarding stopped");
}
