use tokio::sync::mpsc;

use super::*;
use crate::config::SyncConfig;
use crate::object::test_helpers::{lease, rect};
use crate::object::{LeaseKind, Shape};
use crate::store::Mutation;

struct Fixture {
    store: ObjectStore,
    undo: UndoEngine,
    outbound: mpsc::UnboundedReceiver<Mutation>,
}

fn fixture(capacity: usize) -> Fixture {
    let (store, outbound) = ObjectStore::new(SyncConfig::default());
    let undo = UndoEngine::new(store.clone(), capacity);
    Fixture { store, undo, outbound }
}

fn create(f: &Fixture, shape: Shape, source: EditSource, op: Option<&str>) -> ObjectId {
    let z = f.store.next_z_index();
    let id = f.store.create(CanvasObject::new("u1", z, shape));
    f.undo.record_create(f.store.snapshots(&[id.clone()]), source, op);
    id
}

fn width(f: &Fixture, id: &str) -> f64 {
    f.store.get(id).map_or(f64::NAN, |o| o.shape.bounding_box().width)
}

// =============================================================================
// scenarios
// =============================================================================

#[test]
fn create_undo_redo_restores_identical_snapshot() {
    let f = fixture(50);
    let id = create(&f, rect(100.0, 100.0, 400.0, 300.0), EditSource::Manual, None);
    let snapshot = f.store.get(&id).unwrap();
    let Shape::Rectangle(r) = &snapshot.shape else {
        panic!("expected rectangle");
    };
    assert_eq!(r.fill, "#0000FF");

    assert!(f.undo.undo());
    assert_eq!(f.store.len(), 0);

    assert!(f.undo.redo());
    assert_eq!(f.store.get(&id), Some(snapshot));
}

#[test]
fn ai_batch_of_eleven_undoes_in_one_step() {
    let f = fixture(50);
    let operation_id = f.undo.begin_operation(None);
    let objects = (0..11)
        .map(|i| CanvasObject::new("u1", i, rect(50.0 + 60.0 * i as f64, 100.0, 50.0, 30.0)))
        .collect();
    let result = f.store.batch_create(objects);
    f.undo.record_create(f.store.snapshots(&result.created), EditSource::Ai, None);
    f.undo.end_operation();

    let top = f.undo.peek_undo().unwrap();
    assert_eq!(top.operation_id, operation_id);
    assert_eq!(top.source, EditSource::Ai);
    assert_eq!(top.objects.len(), 11);

    assert!(f.undo.undo());
    assert_eq!(f.store.len(), 0);
    assert!(!f.undo.can_undo());
}

#[test]
fn width_change_undoes_to_previous_value() {
    let f = fixture(50);
    let id = create(&f, rect(0.0, 0.0, 400.0, 300.0), EditSource::Manual, None);

    let before = f.store.snapshots(&[id.clone()]);
    f.store.update(&id, &ObjectPatch { width: Some(800.0), ..ObjectPatch::default() });
    f.undo.record_update(&[id.clone()], before, EditSource::Manual, None);
    assert!((width(&f, &id) - 800.0).abs() < f64::EPSILON);

    assert!(f.undo.undo());
    assert!((width(&f, &id) - 400.0).abs() < f64::EPSILON);

    assert!(f.undo.redo());
    assert!((width(&f, &id) - 800.0).abs() < f64::EPSILON);
}

#[test]
fn grouped_delete_restores_every_object_with_original_ids() {
    let f = fixture(50);
    let ids = (0..3_i32)
        .map(|i| create(&f, rect(10.0 * f64::from(i), 0.0, 5.0, 5.0), EditSource::Manual, None))
        .collect::<Vec<_>>();

    let snapshots = f.store.snapshots(&ids);
    f.store.delete_many(&ids);
    f.undo.record_delete(snapshots.clone(), EditSource::Manual, Some("delete-3"));
    assert!(f.store.is_empty());

    assert!(f.undo.undo());
    assert_eq!(f.store.len(), 3);
    for snapshot in &snapshots {
        assert_eq!(f.store.get(&snapshot.id).as_ref(), Some(snapshot));
    }
}

#[test]
fn mixed_kinds_under_one_operation_form_one_step() {
    let f = fixture(50);
    f.undo.begin_operation(Some("op-mixed".into()));
    let id = create(&f, rect(0.0, 0.0, 100.0, 100.0), EditSource::Ai, None);
    let before = f.store.snapshots(&[id.clone()]);
    f.store.update(&id, &ObjectPatch { width: Some(200.0), ..ObjectPatch::default() });
    f.undo.record_update(&[id.clone()], before, EditSource::Ai, None);
    f.undo.end_operation();
    assert_eq!(f.undo.undo_len(), 2);

    assert!(f.undo.undo());
    assert!(f.store.get(&id).is_none());
    assert_eq!(f.undo.redo_len(), 2);

    assert!(f.undo.redo());
    assert!((width(&f, &id) - 200.0).abs() < f64::EPSILON);
}

// =============================================================================
// recording rules
// =============================================================================

#[test]
fn repeated_updates_keep_the_earliest_previous_state() {
    let f = fixture(50);
    let id = create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None);

    for x in [10.0, 20.0] {
        let before = f.store.snapshots(&[id.clone()]);
        f.store.update(&id, &ObjectPatch::position(x, 0.0));
        f.undo.record_update(&[id.clone()], before, EditSource::Manual, Some("drag"));
    }
    assert_eq!(f.undo.undo_len(), 2, "create + one merged update");

    assert!(f.undo.undo());
    assert_eq!(f.store.get(&id).unwrap().shape.position(), (0.0, 0.0));
}

#[test]
fn capacity_drops_oldest_steps() {
    let f = fixture(3);
    let ids = (0..5)
        .map(|_| create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None))
        .collect::<Vec<_>>();
    assert_eq!(f.undo.undo_len(), 3);

    while f.undo.undo() {}
    assert!(f.store.get(&ids[0]).is_some(), "oldest creates are beyond reach");
    assert!(f.store.get(&ids[1]).is_some());
    assert!(f.store.get(&ids[4]).is_none());
}

#[test]
fn new_record_clears_redo() {
    let f = fixture(50);
    create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None);
    assert!(f.undo.undo());
    assert!(f.undo.can_redo());

    create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None);
    assert!(!f.undo.can_redo());
    assert!(!f.undo.redo());
}

#[test]
fn empty_stacks_report_false() {
    let f = fixture(50);
    assert!(!f.undo.undo());
    assert!(!f.undo.redo());
}

#[test]
fn empty_records_are_ignored() {
    let f = fixture(50);
    f.undo.record_create(Vec::new(), EditSource::Manual, None);
    f.undo.record_update(&["ghost".into()], Vec::new(), EditSource::Manual, None);
    assert!(!f.undo.can_undo());
}

#[test]
fn restored_objects_carry_no_lease() {
    let f = fixture(50);
    let id = create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None);
    f.store.set_lease_local(&id, Some(lease("u1", LeaseKind::Edit, i64::MAX)));

    let snapshots = f.store.snapshots(&[id.clone()]);
    f.store.delete(&id);
    f.undo.record_delete(snapshots, EditSource::Manual, None);

    assert!(f.undo.undo());
    assert!(f.store.get(&id).unwrap().lock.is_none());
}

#[test]
fn restoring_a_previous_state_keeps_the_current_lease() {
    let mut f = fixture(50);
    let id = create(&f, rect(0.0, 0.0, 400.0, 300.0), EditSource::Manual, None);
    let before = f.store.snapshots(&[id.clone()]);
    f.store.update(&id, &ObjectPatch { width: Some(800.0), ..ObjectPatch::default() });
    f.undo.record_update(&[id.clone()], before, EditSource::Manual, None);

    f.store.set_lease_local(&id, Some(lease("u2", LeaseKind::Edit, i64::MAX)));
    while f.outbound.try_recv().is_ok() {}

    assert!(f.undo.undo());
    assert_eq!(f.store.get(&id).unwrap().lock.map(|l| l.user_id), Some("u2".to_owned()));
    let Ok(Mutation::Patch { patch, .. }) = f.outbound.try_recv() else {
        panic!("expected a patch");
    };
    assert!(patch.lock.is_none(), "undo must not write the lease field");

    assert!(f.undo.redo());
    assert_eq!(f.store.get(&id).unwrap().lock.map(|l| l.user_id), Some("u2".to_owned()));
}

#[test]
fn recorder_state_follows_operations() {
    let f = fixture(50);
    assert_eq!(f.undo.state(), RecorderState::Idle);
    let op = f.undo.begin_operation(None);
    assert_eq!(f.undo.state(), RecorderState::Recording(op.clone()));

    // An explicit id wins over the recording one.
    create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, Some("explicit"));
    assert_eq!(f.undo.peek_undo().unwrap().operation_id, "explicit");

    f.undo.end_operation();
    assert_eq!(f.undo.state(), RecorderState::Idle);
}

#[test]
fn clear_forgets_history() {
    let f = fixture(50);
    create(&f, rect(0.0, 0.0, 10.0, 10.0), EditSource::Manual, None);
    f.undo.begin_operation(None);
    f.undo.clear();
    assert!(!f.undo.can_undo());
    assert_eq!(f.undo.state(), RecorderState::Idle);
}
