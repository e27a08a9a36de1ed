//! Engine end to end: two instances over one synced tree, background
//! triggers, drains, identity adoption.

mod fixtures;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use folio_sync::core::{Limits, LogKind};
use folio_sync::engine::SyncEngine;
use folio_sync::paths::{self, override_data_dir_for_tests};
use folio_sync::sd::SdMarker;
use folio_sync::{FolderId, InstanceId, NoteId, SdId};

use tempfile::TempDir;

use fixtures::docs::FakeStore;

/// Background triggers quiet enough that explicit sync calls are the
/// only replay source — keeps affected-set assertions deterministic.
fn isolated_limits() -> Limits {
    Limits {
        watch_debounce_ms: 600_000,
        activity_poll_interval_ms: 3_600_000,
        deletion_poll_interval_ms: 3_600_000,
        ..Limits::default()
    }
}

/// Background triggers fast, for tests that exercise them.
fn quick_limits() -> Limits {
    Limits {
        watch_debounce_ms: 50,
        activity_poll_interval_ms: 100,
        deletion_poll_interval_ms: 200,
        ..Limits::default()
    }
}

/// Two engine instances sharing one storage directory root, each with
/// its own app data dir — the single-machine stand-in for two synced
/// machines.
struct TwoInstances {
    _temp: TempDir,
    root: std::path::PathBuf,
    a: SyncEngine,
    b: SyncEngine,
    store_b: Arc<FakeStore>,
    sd_a: SdId,
    sd_b: SdId,
}

impl TwoInstances {
    fn new(limits: Limits) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("Notes");

        let store_a = FakeStore::new();
        let store_b = FakeStore::new();

        let a = SyncEngine::new(
            InstanceId::generate(),
            limits.clone(),
            Arc::clone(&store_a) as Arc<dyn folio_sync::DocumentStore>,
        );
        let b = SyncEngine::new(
            InstanceId::generate(),
            limits,
            Arc::clone(&store_b) as Arc<dyn folio_sync::DocumentStore>,
        );

        let sd_a = {
            let _data = override_data_dir_for_tests(Some(temp.path().join("data-a")));
            a.setup_sd(&root).unwrap()
        };
        let sd_b = {
            let _data = override_data_dir_for_tests(Some(temp.path().join("data-b")));
            b.setup_sd(&root).unwrap()
        };
        assert_eq!(sd_a, sd_b);

        Self {
            _temp: temp,
            root,
            a,
            b,
            store_b,
            sd_a,
            sd_b,
        }
    }
}

#[test]
fn local_edit_replays_on_the_other_instance() {
    let rig = TwoInstances::new(isolated_limits());
    let note = NoteId::generate();

    rig.a
        .record_update(rig.sd_a, note, b"hello from a".to_vec().into())
        .unwrap();

    let affected = rig.b.sync_from_other_instances(rig.sd_b).unwrap();
    assert!(affected.contains(&note));

    let marks = rig.b.get_watermarks(rig.sd_b).unwrap();
    let row = marks
        .iter()
        .find(|r| r.kind == LogKind::Activity && r.origin == rig.a.instance_id())
        .expect("watermark for instance a");
    assert_eq!(row.watermark.seq(), 1);

    // Nothing new: the next pass is a no-op.
    let again = rig.b.sync_from_other_instances(rig.sd_b).unwrap();
    assert!(again.is_empty());
}

#[test]
fn deletion_beats_concurrent_edits_across_instances() {
    let rig = TwoInstances::new(isolated_limits());
    let note = NoteId::generate();

    rig.a
        .record_update(rig.sd_a, note, b"v1".to_vec().into())
        .unwrap();
    rig.b.sync_from_other_instances(rig.sd_b).unwrap();

    // B hard-deletes while A keeps editing.
    rig.b.record_deletion(rig.sd_b, note).unwrap();
    rig.a
        .record_update(rig.sd_a, note, b"v2".to_vec().into())
        .unwrap();

    // A learns about the deletion; its local copy dies.
    let affected = rig.a.sync_from_other_instances(rig.sd_a).unwrap();
    assert!(affected.contains(&note));
    assert!(!paths::note_dir(&rig.root, note).exists());

    // B replays A's stale v2 record without resurrecting anything.
    let affected = rig.b.sync_from_other_instances(rig.sd_b).unwrap();
    assert!(!affected.contains(&note));
    assert!(!paths::note_dir(&rig.root, note).exists());

    // Editing a dead note is refused at the source from now on.
    assert!(
        rig.b
            .record_update(rig.sd_b, note, b"v3".to_vec().into())
            .is_err()
    );
}

#[test]
fn background_triggers_report_affected_notes() {
    let rig = TwoInstances::new(quick_limits());
    let note = NoteId::generate();
    let reports = rig.b.reports();

    rig.a
        .record_update(rig.sd_a, note, b"background".to_vec().into())
        .unwrap();

    // Either the watcher or the poll backstop must deliver this.
    let report = reports
        .recv_timeout(Duration::from_secs(10))
        .expect("background sync report");
    assert!(report.affected.contains(&note));
    assert_eq!(report.sd_id, rig.sd_b);
}

#[test]
fn wait_for_pending_syncs_drains_the_queue() {
    let rig = TwoInstances::new(isolated_limits());
    let note = NoteId::generate();
    rig.a
        .record_update(rig.sd_a, note, b"drain me".to_vec().into())
        .unwrap();

    assert!(rig.b.wait_for_pending_syncs(Duration::from_secs(10)));
    // After the drain the startup phase is past the grace period.
    assert_eq!(
        rig.b.sync_phase(rig.sd_b).unwrap(),
        folio_sync::SyncPhase::Steady
    );
}

#[test]
fn watermarks_and_skips_are_inspectable() {
    let rig = TwoInstances::new(isolated_limits());

    // A record for a note B cannot materialize becomes a skipped
    // entry, visible to diagnostics and gone once it resolves.
    let stuck = NoteId::generate();
    rig.store_b.set_unavailable(stuck);
    rig.a
        .record_update(rig.sd_a, stuck, b"stuck".to_vec().into())
        .unwrap();
    rig.b.sync_from_other_instances(rig.sd_b).unwrap();

    let skipped = rig.b.load_skipped_entries(rig.sd_b).unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].note_id, Some(stuck));
    assert_eq!(skipped[0].origin, rig.a.instance_id());

    rig.store_b.set_available(stuck);
    let affected = rig.b.sync_from_other_instances(rig.sd_b).unwrap();
    assert!(affected.contains(&stuck));
    assert!(rig.b.load_skipped_entries(rig.sd_b).unwrap().is_empty());

    let marks = rig.b.get_watermarks(rig.sd_b).unwrap();
    assert!(
        marks
            .iter()
            .any(|row| row.origin == rig.a.instance_id() && row.watermark.seq() == 1)
    );
}

#[test]
fn note_moves_between_directories_via_engine() {
    let temp = TempDir::new().unwrap();
    let _data = override_data_dir_for_tests(Some(temp.path().join("data")));

    let store = FakeStore::new();
    let engine = SyncEngine::new(
        InstanceId::generate(),
        isolated_limits(),
        Arc::clone(&store) as Arc<dyn folio_sync::DocumentStore>,
    );

    let source_root = temp.path().join("Personal");
    let target_root = temp.path().join("Work");
    let source_sd = engine.setup_sd(&source_root).unwrap();
    let target_sd = engine.setup_sd(&target_root).unwrap();

    let note = NoteId::generate();
    let logs = paths::note_logs_dir(&source_root, note);
    fs::create_dir_all(&logs).unwrap();
    fs::write(logs.join("0.crdtlog"), b"doc").unwrap();

    engine
        .move_note(source_sd, target_sd, note, FolderId::generate())
        .unwrap();

    assert!(!paths::note_dir(&source_root, note).exists());
    assert!(paths::note_logs_dir(&target_root, note).exists());
    assert!(engine.get_stale_moves(source_sd).unwrap().is_empty());
}

#[test]
fn replaced_marker_is_adopted_during_sync() {
    let temp = TempDir::new().unwrap();
    let _data = override_data_dir_for_tests(Some(temp.path().join("data")));

    let store = FakeStore::new();
    let engine = SyncEngine::new(
        InstanceId::generate(),
        isolated_limits(),
        Arc::clone(&store) as Arc<dyn folio_sync::DocumentStore>,
    );
    let root = temp.path().join("Notes");
    let original = engine.setup_sd(&root).unwrap();

    // The sync layer resolves a cross-machine creation race against
    // us: a different marker lands in the tree.
    let winner = SdMarker::new(SdId::generate(), 1);
    fs::write(
        paths::sd_marker_path(&root),
        serde_json::to_vec(&winner).unwrap(),
    )
    .unwrap();

    // The pass reconciles and adopts; afterwards the directory
    // answers to the new identity.
    engine.sync_from_other_instances(original).unwrap();
    assert!(engine.get_watermarks(winner.sd_id).is_ok());
    assert!(engine.get_watermarks(original).is_err());
}

#[test]
fn cleanup_watchers_tears_down_one_directory() {
    let temp = TempDir::new().unwrap();
    let _data = override_data_dir_for_tests(Some(temp.path().join("data")));

    let store = FakeStore::new();
    let engine = SyncEngine::new(
        InstanceId::generate(),
        isolated_limits(),
        Arc::clone(&store) as Arc<dyn folio_sync::DocumentStore>,
    );
    let keep = engine.setup_sd(&temp.path().join("Keep")).unwrap();
    let gone = engine.setup_sd(&temp.path().join("Gone")).unwrap();

    engine.cleanup_watchers(gone).unwrap();
    assert!(engine.sync_from_other_instances(gone).is_err());
    assert!(engine.sync_from_other_instances(keep).is_ok());

    // Tearing down an unknown directory is an error, not a panic.
    assert!(engine.cleanup_watchers(gone).is_err());

    engine.cleanup_all_watchers();
    assert!(engine.sync_from_other_instances(keep).is_err());
}
