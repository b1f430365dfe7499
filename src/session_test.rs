use std::time::Duration;

use tokio::time::timeout;

use super::*;
use crate::feed::memory::MemoryFeed;
use crate::object::test_helpers::{circle, rect, text};
use crate::presence::presence_collection;
use crate::store::StoreEvent;

const CANVAS: &str = "canvas-1";

async fn open(feed: &MemoryFeed, user_id: &str, name: &str) -> CanvasSession {
    CanvasSession::open(
        Arc::new(feed.clone()),
        CANVAS,
        UserIdentity::new(user_id, name, "#118844"),
        SyncConfig::default(),
    )
    .await
    .expect("open should succeed")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn width_of(session: &CanvasSession, id: &str) -> f64 {
    session.store().get(id).map_or(f64::NAN, |o| o.shape.bounding_box().width)
}

/// Lease field of the backend document, `None` when absent or null.
fn remote_lease(feed: &MemoryFeed, id: &str) -> Option<serde_json::Value> {
    feed.document(CANVAS, id).and_then(|d| d.get("lock").cloned()).filter(|l| !l.is_null())
}

fn lease_holder(feed: &MemoryFeed, id: &str) -> Option<String> {
    remote_lease(feed, id).and_then(|l| l["user_id"].as_str().map(str::to_owned))
}

// =============================================================================
// manual edits
// =============================================================================

#[tokio::test]
async fn rectangle_create_undo_redo_round_trip() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    let id = session.create_object(rect(100.0, 100.0, 400.0, 300.0)).expect("valid rectangle");
    let snapshot = session.store().get(&id).unwrap();

    assert!(session.undo());
    assert_eq!(session.context().total(), 0);

    assert!(session.redo());
    let objects = session.context().objects;
    assert_eq!(objects, vec![snapshot]);
}

#[tokio::test]
async fn invalid_shapes_are_rejected_without_history() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    let err = session.create_object(rect(9_000.0, 9_000.0, 10.0, 10.0)).unwrap_err();
    assert_eq!(err.error_code(), "E_OUT_OF_BOUNDS");
    assert!(session.store().is_empty());
    assert!(!session.undo_engine().can_undo());
}

#[tokio::test]
async fn created_objects_are_clamped_and_stacked() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    let first = session.create_object(rect(4_900.0, 10.0, 400.0, 300.0)).unwrap();
    let second = session.create_object(circle(50.0, 50.0, 20.0)).unwrap();

    let clamped = session.store().get(&first).unwrap().shape.bounding_box();
    assert!(clamped.x + clamped.width <= 5_000.0);
    assert!(session.store().get(&second).unwrap().z_index > session.store().get(&first).unwrap().z_index);
}

#[tokio::test]
async fn width_update_undoes_to_the_exact_previous_value() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let id = session.create_object(rect(0.0, 0.0, 400.0, 300.0)).unwrap();

    let warning = session.update_object(&id, &ObjectPatch { width: Some(800.0), ..ObjectPatch::default() });
    assert!(warning.is_none());
    assert!((width_of(&session, &id) - 800.0).abs() < f64::EPSILON);

    assert!(session.undo());
    assert!((width_of(&session, &id) - 400.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn updates_and_deletes_of_unknown_ids_are_no_ops() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    assert!(session.update_object("ghost", &ObjectPatch::position(1.0, 1.0)).is_none());
    assert!(session.delete_objects(&["ghost".to_owned()]).is_empty());
    assert!(!session.undo_engine().can_undo());
}

#[tokio::test]
async fn multi_delete_is_one_undo_step() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let ids = vec![
        session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap(),
        session.create_object(circle(100.0, 100.0, 5.0)).unwrap(),
        session.create_object(text(200.0, 200.0, "hi")).unwrap(),
    ];
    let before = session.context().objects;

    session.delete_objects(&ids);
    assert!(session.store().is_empty());

    assert!(session.undo());
    assert_eq!(session.context().objects, before);
}

// =============================================================================
// AI operations
// =============================================================================

#[tokio::test]
async fn eleven_object_ai_form_undoes_in_one_call() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    let before = session.context().total();

    let operation_id = session.begin_ai_operation("create a login form");
    let shapes = (0..11_i32)
        .map(|i| rect(100.0, 100.0 + 40.0 * f64::from(i), 300.0, 30.0))
        .collect();
    let result = session.ai_create(shapes).unwrap();
    session.end_ai_operation();

    assert_eq!(result.succeeded(), 11);
    assert_eq!(session.context().total(), before + 11);
    let sample = session.store().get(&result.created[0]).unwrap();
    let provenance = sample.ai.expect("ai provenance recorded");
    assert_eq!(provenance.operation_id, operation_id);
    assert_eq!(provenance.command, "create a login form");

    assert!(session.undo());
    assert_eq!(session.context().total(), before);
}

#[tokio::test]
async fn ai_batch_partial_failure_keeps_the_good_items() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    session.begin_ai_operation("scatter");
    let result = session
        .ai_create(vec![rect(10.0, 10.0, 20.0, 20.0), rect(-500.0, -500.0, 10.0, 10.0), circle(60.0, 60.0, 5.0)])
        .unwrap();
    session.end_ai_operation();

    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].index, 1);
    assert_eq!(result.failed[0].code, "E_OUT_OF_BOUNDS");
    assert_eq!(session.context().total(), 2);
}

#[tokio::test]
async fn ai_edits_group_with_their_operation() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let keep = session.create_object(rect(0.0, 0.0, 100.0, 100.0)).unwrap();
    let doomed = session.create_object(circle(300.0, 300.0, 10.0)).unwrap();

    session.begin_ai_operation("tidy up");
    let created = session.ai_create(vec![text(50.0, 50.0, "title")]).unwrap();
    let changed = session
        .ai_update(vec![(keep.clone(), ObjectPatch { width: Some(250.0), ..ObjectPatch::default() })])
        .unwrap();
    let removed = session.ai_delete(&[doomed.clone()]).unwrap();
    session.end_ai_operation();
    assert_eq!((changed, removed), (1, 1));

    assert!(session.undo(), "whole ai operation reverts at once");
    assert!(session.store().get(&created.created[0]).is_none());
    assert!(session.store().get(&doomed).is_some());
    assert!((width_of(&session, &keep) - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn ai_calls_outside_an_operation_are_refused() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    let err = session.ai_create(vec![rect(0.0, 0.0, 10.0, 10.0)]).unwrap_err();
    assert!(matches!(err, SessionError::NoAiOperation));
    assert_eq!(err.error_code(), "E_NO_AI_OPERATION");
    assert!(session.store().is_empty());
}

#[tokio::test]
async fn manual_edit_during_an_ai_operation_is_its_own_step() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    session.begin_ai_operation("make a row of boxes");
    let generated = session.ai_create(vec![rect(0.0, 0.0, 10.0, 10.0), rect(20.0, 0.0, 10.0, 10.0)]).unwrap();
    let manual = session.create_object(circle(300.0, 300.0, 10.0)).unwrap();
    session.end_ai_operation();

    assert!(session.undo());
    assert!(session.store().get(&manual).is_none());
    assert_eq!(session.store().len(), 2);

    assert!(session.undo());
    assert!(generated.created.iter().all(|id| session.store().get(id).is_none()));
    assert!(session.store().is_empty());
}

#[tokio::test]
async fn undone_create_stays_gone_when_its_echo_arrives() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let mut events = session.store().subscribe();

    let id = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    assert!(session.undo());
    session.save().await.unwrap();
    // The feed is ordered: once a later create is confirmed, every earlier
    // echo has been reconciled.
    let marker = session.create_object(circle(50.0, 50.0, 5.0)).unwrap();
    wait_until(|| !session.store().is_pending(&marker)).await;

    assert!(session.store().get(&id).is_none());
    assert!(feed.document(CANVAS, &id).is_none());
    let mut upserts = 0;
    while let Ok(event) = events.try_recv() {
        if event == StoreEvent::Upserted(id.clone()) {
            upserts += 1;
        }
    }
    assert_eq!(upserts, 1, "only the local create shows the object");
}

// =============================================================================
// interactions between sessions
// =============================================================================

#[tokio::test]
async fn undo_leaves_another_users_lease_alone() {
    let feed = MemoryFeed::new();
    let ann = open(&feed, "u1", "Ann").await;
    let bob = open(&feed, "u2", "Bob").await;

    let id = ann.create_object(rect(100.0, 100.0, 400.0, 300.0)).unwrap();
    wait_until(|| !ann.store().is_pending(&id) && bob.store().get(&id).is_some()).await;
    assert!(ann.update_object(&id, &ObjectPatch { width: Some(800.0), ..ObjectPatch::default() }).is_none());
    ann.save().await.unwrap();

    assert!(bob.begin_drag(&id).await.is_none());
    wait_until(|| lease_holder(&feed, &id).as_deref() == Some("u2")).await;

    assert!(ann.undo());
    ann.save().await.unwrap();
    assert_eq!(feed.document(CANVAS, &id).unwrap()["width"], serde_json::json!(400.0));
    assert_eq!(lease_holder(&feed, &id).as_deref(), Some("u2"));

    assert!(ann.redo());
    ann.save().await.unwrap();
    assert_eq!(feed.document(CANVAS, &id).unwrap()["width"], serde_json::json!(800.0));
    assert_eq!(lease_holder(&feed, &id).as_deref(), Some("u2"));

    bob.end_drag(&id).await;
}

#[tokio::test]
async fn contended_drag_warns_but_still_moves() {
    let feed = MemoryFeed::new();
    let ann = open(&feed, "u1", "Ann").await;
    let bob = open(&feed, "u2", "Bob").await;

    let id = ann.create_object(rect(100.0, 100.0, 50.0, 50.0)).unwrap();
    wait_until(|| !ann.store().is_pending(&id) && bob.store().get(&id).is_some()).await;

    assert!(ann.begin_drag(&id).await.is_none());
    wait_until(|| bob.store().get(&id).is_some_and(|o| o.lock.is_some())).await;

    let warning = bob.begin_drag(&id).await.expect("bob sees ann's lease");
    assert_eq!(warning.holder_name, "Ann");
    assert_eq!(warning.to_string(), "Ann is editing this object");

    assert!(bob.drag_to(&id, 300.0, 300.0));
    bob.end_drag(&id).await;
    assert_eq!(bob.store().get(&id).unwrap().shape.position(), (300.0, 300.0));
    ann.end_drag(&id).await;
}

#[tokio::test]
async fn drag_records_one_step_and_releases_the_lease() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let id = session.create_object(rect(10.0, 10.0, 50.0, 50.0)).unwrap();
    wait_until(|| !session.store().is_pending(&id)).await;
    let steps = session.undo_engine().undo_len();

    session.begin_drag(&id).await;
    assert!(session.locks().is_renewing(&id));
    for x in [20.0, 30.0, 40.0] {
        session.drag_to(&id, x, 10.0);
    }
    session.end_drag(&id).await;

    assert!(!session.locks().is_renewing(&id));
    wait_until(|| session.store().get(&id).is_some_and(|o| o.lock.is_none())).await;
    assert_eq!(session.undo_engine().undo_len(), steps + 1);

    assert!(session.undo());
    assert_eq!(session.store().get(&id).unwrap().shape.position(), (10.0, 10.0));
}

#[tokio::test]
async fn selection_moves_select_leases() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let a = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    let b = session.create_object(rect(50.0, 0.0, 10.0, 10.0)).unwrap();
    wait_until(|| session.store().pending_len() == 0).await;

    assert!(session.select(vec![a.clone()]).await.is_empty());
    assert!(session.locks().is_renewing(&a));
    wait_until(|| session.store().get(&a).and_then(|o| o.lock).map(|l| l.kind) == Some(LeaseKind::Select)).await;

    session.select(vec![b.clone()]).await;
    assert!(!session.locks().is_renewing(&a));
    assert!(session.locks().is_renewing(&b));
    wait_until(|| {
        let store = session.store();
        store.get(&a).is_some_and(|o| o.lock.is_none()) && store.get(&b).is_some_and(|o| o.lock.is_some())
    })
    .await;
    assert_eq!(session.context().selection, vec![b]);
}

#[tokio::test]
async fn dragging_a_selected_object_returns_to_a_select_lease() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let id = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    wait_until(|| !session.store().is_pending(&id)).await;

    session.select(vec![id.clone()]).await;
    session.begin_drag(&id).await;
    assert_eq!(remote_lease(&feed, &id).unwrap()["kind"], serde_json::json!("edit"));

    session.drag_to(&id, 40.0, 40.0);
    session.end_drag(&id).await;
    assert_eq!(remote_lease(&feed, &id).unwrap()["kind"], serde_json::json!("select"));
    assert!(session.locks().is_renewing(&id));
}

#[tokio::test]
async fn peers_show_up_as_online_users() {
    let feed = MemoryFeed::new();
    let ann = open(&feed, "u1", "Ann").await;
    let bob = open(&feed, "u2", "Bob").await;

    wait_until(|| ann.online_users().len() == 1).await;
    assert_eq!(ann.online_users()[0].user_name, "Bob");

    bob.close().await;
    wait_until(|| ann.online_users().is_empty()).await;
    assert!(feed.document(&presence_collection(CANVAS), "u2").is_none());
}

// =============================================================================
// persistence boundary
// =============================================================================

#[tokio::test]
async fn save_surfaces_failed_writes_once() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    feed.set_fail_writes(true);
    let id = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    let err = session.save().await.unwrap_err();
    assert!(matches!(err, SessionError::Persistence { failed_writes: 1, .. }));
    assert!(err.retryable());
    assert!(session.store().get(&id).is_some(), "local state survives the failure");

    feed.set_fail_writes(false);
    let saved = session.save().await.expect("later saves are clean");
    assert_eq!(saved.len(), 1);
}

#[tokio::test]
async fn load_replaces_the_canvas_and_history() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();

    let project = vec![
        CanvasObject::new("u9", 0, rect(10.0, 10.0, 20.0, 20.0)),
        CanvasObject::new("u9", 1, circle(80.0, 80.0, 10.0)),
        CanvasObject::new("u9", 2, circle(120.0, 80.0, 10.0)),
    ];
    assert_eq!(session.load(project).await, 3);

    assert!(!session.undo_engine().can_undo());
    let context = session.context();
    assert_eq!(context.total(), 3);
    assert_eq!(context.counts.get(&ShapeKind::Circle), Some(&2));
    assert_eq!(context.counts.get(&ShapeKind::Rectangle), Some(&1));

    wait_until(|| feed.len(CANVAS) == 3).await;
}

#[tokio::test]
async fn load_keeps_every_saved_object_as_saved() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;

    let mut project = (0..600_i32)
        .map(|i| {
            let (col, row) = (f64::from(i % 50), f64::from(i / 50));
            CanvasObject::new("u9", i64::from(i) * 2, rect(col * 90.0, row * 90.0, 40.0, 40.0))
        })
        .collect::<Vec<_>>();
    // Larger than a fresh create would allow; loading must not clamp it.
    project.push(CanvasObject::new("u9", 5_000, rect(4_900.0, 10.0, 400.0, 300.0)));

    assert_eq!(session.load(project.clone()).await, 601);
    assert_eq!(session.store().len(), 601);
    for saved in [&project[0], &project[599], &project[600]] {
        let loaded = session.store().get(&saved.id).expect("id kept");
        assert_eq!(loaded.shape, saved.shape);
        assert_eq!(loaded.z_index, saved.z_index);
    }
    assert_eq!(session.store().next_z_index(), 5_001);
    wait_until(|| feed.len(CANVAS) == 601).await;
}

#[tokio::test]
async fn load_releases_leases_and_ends_the_ai_operation() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let id = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    wait_until(|| !session.store().is_pending(&id)).await;
    session.select(vec![id.clone()]).await;
    assert_eq!(lease_holder(&feed, &id).as_deref(), Some("u1"));
    session.begin_ai_operation("tidy up");

    let saved = session.save().await.unwrap();
    assert!(saved[0].lock.is_some());
    assert_eq!(session.load(saved).await, 1);

    assert!(!session.locks().is_renewing(&id));
    assert!(session.selection().is_empty());
    assert!(session.store().get(&id).unwrap().lock.is_none());
    assert!(matches!(session.ai_create(vec![rect(0.0, 0.0, 5.0, 5.0)]), Err(SessionError::NoAiOperation)));

    session.save().await.unwrap();
    assert!(feed.document(CANVAS, &id).is_some());
    assert_eq!(remote_lease(&feed, &id), None);
}

#[tokio::test]
async fn close_releases_leases_and_flushes() {
    let feed = MemoryFeed::new();
    let session = open(&feed, "u1", "Ann").await;
    let id = session.create_object(rect(0.0, 0.0, 10.0, 10.0)).unwrap();
    wait_until(|| !session.store().is_pending(&id)).await;
    session.select(vec![id.clone()]).await;
    let other = session.create_object(circle(40.0, 40.0, 5.0)).unwrap();

    session.close().await;

    let document = feed.document(CANVAS, &id).expect("object persisted");
    assert!(document.get("lock").is_none_or(serde_json::Value::is_null));
    assert!(feed.document(CANVAS, &other).is_some(), "queued write flushed before close");
    assert!(feed.document(&presence_collection(CANVAS), "u1").is_none());
}

#[test]
fn session_error_codes() {
    let persistence = SessionError::Persistence { failed_writes: 2, last_error: "boom".into() };
    assert_eq!(persistence.error_code(), "E_PERSISTENCE");
    assert_eq!(persistence.to_string(), "2 remote write(s) failed; last error: boom");
    assert_eq!(SessionError::FlushAborted.error_code(), "E_FLUSH_ABORTED");
    assert!(!SessionError::FlushAborted.retryable());
    let invalid = SessionError::from(ValidationError::BatchCapExceeded { cap: 5 });
    assert_eq!(invalid.error_code(), "E_BATCH_CAP");
}
