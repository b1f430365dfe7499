use serde_json::json;
use tokio::time::{Duration, timeout};

use super::*;
use crate::feed::ChangeKind;

const CANVAS: &str = "canvas-1";

fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

async fn next_event(rx: &mut ChangeStream) -> ChangeEvent {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("stream closed")
}

async fn assert_no_event(rx: &mut ChangeStream) {
    assert!(
        timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "expected stream to stay quiet"
    );
}

#[tokio::test]
async fn subscribe_replays_existing_documents_as_added() {
    let feed = MemoryFeed::new();
    feed.write(CANVAS, "a", doc(json!({"x": 1}))).await.unwrap();
    feed.write(CANVAS, "b", doc(json!({"x": 2}))).await.unwrap();

    let mut rx = feed.subscribe(CANVAS).await.unwrap();
    let mut ids = vec![next_event(&mut rx).await, next_event(&mut rx).await]
        .into_iter()
        .map(|e| {
            assert_eq!(e.kind, ChangeKind::Added);
            e.document_id
        })
        .collect::<Vec<_>>();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn write_merges_fields_and_emits_modified() {
    let feed = MemoryFeed::new();
    let mut rx = feed.subscribe(CANVAS).await.unwrap();

    feed.write(CANVAS, "a", doc(json!({"x": 1, "y": 2}))).await.unwrap();
    let added = next_event(&mut rx).await;
    assert_eq!(added.kind, ChangeKind::Added);

    feed.write(CANVAS, "a", doc(json!({"x": 10}))).await.unwrap();
    let modified = next_event(&mut rx).await;
    assert_eq!(modified.kind, ChangeKind::Modified);
    let data = modified.data.unwrap();
    assert_eq!(data.get("x"), Some(&json!(10)));
    assert_eq!(data.get("y"), Some(&json!(2)), "untouched field survives the merge");
}

#[tokio::test]
async fn explicit_null_overwrites_field() {
    let feed = MemoryFeed::new();
    feed.write(CANVAS, "a", doc(json!({"lock": {"user_id": "u1"}}))).await.unwrap();
    feed.write(CANVAS, "a", doc(json!({"lock": null}))).await.unwrap();
    let stored = feed.document(CANVAS, "a").unwrap();
    assert_eq!(stored.get("lock"), Some(&serde_json::Value::Null));
}

#[tokio::test]
async fn delete_missing_document_is_silent() {
    let feed = MemoryFeed::new();
    let mut rx = feed.subscribe(CANVAS).await.unwrap();
    feed.delete(CANVAS, "ghost").await.unwrap();
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn delete_batch_emits_removed_per_document() {
    let feed = MemoryFeed::new();
    feed.write_batch(
        CANVAS,
        vec![("a".into(), doc(json!({"x": 1}))), ("b".into(), doc(json!({"x": 2})))],
    )
    .await
    .unwrap();
    let mut rx = feed.subscribe(CANVAS).await.unwrap();
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    feed.delete_batch(CANVAS, vec!["a".into(), "b".into()]).await.unwrap();
    assert_eq!(next_event(&mut rx).await.kind, ChangeKind::Removed);
    assert_eq!(next_event(&mut rx).await.kind, ChangeKind::Removed);
    assert_eq!(feed.len(CANVAS), 0);
}

#[tokio::test]
async fn failing_writes_leave_documents_untouched() {
    let feed = MemoryFeed::new();
    feed.set_fail_writes(true);
    let err = feed
        .write_batch(CANVAS, vec![("a".into(), doc(json!({"x": 1})))])
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Unavailable(_)));
    assert_eq!(feed.len(CANVAS), 0);

    feed.set_fail_writes(false);
    feed.write(CANVAS, "a", doc(json!({"x": 1}))).await.unwrap();
    assert_eq!(feed.len(CANVAS), 1);
}

#[tokio::test]
async fn merge_if_respects_guard() {
    let feed = MemoryFeed::new();
    feed.write(CANVAS, "a", doc(json!({"owner": "u1"}))).await.unwrap();

    let reject = |_: Option<&Document>| false;
    let wrote = feed
        .merge_if(CANVAS, "a", &reject, doc(json!({"owner": "u2"})))
        .await
        .unwrap();
    assert!(!wrote);
    assert_eq!(feed.document(CANVAS, "a").unwrap().get("owner"), Some(&json!("u1")));

    let exists = |d: Option<&Document>| d.is_some();
    let wrote = feed
        .merge_if(CANVAS, "a", &exists, doc(json!({"owner": "u2"})))
        .await
        .unwrap();
    assert!(wrote);
    assert_eq!(feed.document(CANVAS, "a").unwrap().get("owner"), Some(&json!("u2")));

    let wrote = feed
        .merge_if(CANVAS, "missing", &exists, doc(json!({"owner": "u2"})))
        .await
        .unwrap();
    assert!(!wrote);
    assert!(feed.document(CANVAS, "missing").is_none());
}

#[tokio::test]
async fn dropped_subscribers_are_pruned() {
    let feed = MemoryFeed::new();
    let rx = feed.subscribe(CANVAS).await.unwrap();
    assert_eq!(feed.subscriber_count(CANVAS), 1);
    drop(rx);
    feed.write(CANVAS, "a", doc(json!({"x": 1}))).await.unwrap();
    assert_eq!(feed.subscriber_count(CANVAS), 0);
}

#[tokio::test]
async fn collections_are_isolated() {
    let feed = MemoryFeed::new();
    let mut other = feed.subscribe("canvas-2").await.unwrap();
    feed.write(CANVAS, "a", doc(json!({"x": 1}))).await.unwrap();
    assert_no_event(&mut other).await;
}
