//! Checkpoint and recovery scenarios: the recovered state must be a
//! consistent prefix of each session's operations.

mod common;

use common::{key, val};
use hybridlog::{FileDevice, RawFunctions, Settings, Status, Store};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

fn settings(dir: &Path, use_snapshot: bool) -> Settings {
    Settings {
        index_buckets: 256,
        page_size_bits: 12,
        memory_size_bits: 15,
        segment_size_bits: 20,
        checkpoint_dir: dir.join("checkpoints"),
        use_snapshot_file: use_snapshot,
        ..Settings::default()
    }
}

fn open_store(dir: &Path, use_snapshot: bool) -> Store<RawFunctions> {
    let device = FileDevice::new(dir.join("log"), 20).unwrap();
    Store::new(settings(dir, use_snapshot), Arc::new(device), RawFunctions).unwrap()
}

fn checkpoint_crash_recover(use_snapshot: bool) {
    common::trace_init();
    let dir = tempfile::tempdir().unwrap();
    let guid: Uuid;
    let token: Uuid;

    // First life: two acknowledged upserts, a completed checkpoint, and
    // one post-checkpoint upsert that must not survive.
    {
        let store = open_store(dir.path(), use_snapshot);
        let mut session = store.start_session();
        guid = session.guid();

        assert_eq!(session.upsert(&key(1), &val(1), 1), Status::Ok);
        assert_eq!(session.upsert(&key(2), &val(2), 2), Status::Ok);

        token = store.take_full_checkpoint().unwrap();
        session.complete_checkpoint().unwrap();

        assert_eq!(session.upsert(&key(3), &val(3), 3), Status::Ok);
        // Crash: the store is dropped without another checkpoint.
        session.stop();
    }

    // Second life.
    let store = open_store(dir.path(), use_snapshot);
    store.recover(token, token).unwrap();

    let (mut session, serial) = store.continue_session(guid).unwrap();
    assert_eq!(serial, 2);

    let mut out = Vec::new();
    assert_eq!(session.read(&key(1), &[], &mut out, 3), Status::Ok);
    assert_eq!(out, val(1));
    assert_eq!(session.read(&key(2), &[], &mut out, 4), Status::Ok);
    assert_eq!(out, val(2));
    assert_eq!(session.read(&key(3), &[], &mut out, 5), Status::NotFound);
}

#[test]
fn full_checkpoint_recovers_prefix_foldover() {
    checkpoint_crash_recover(false);
}

#[test]
fn full_checkpoint_recovers_prefix_snapshot() {
    checkpoint_crash_recover(true);
}

#[test]
fn recovered_store_accepts_new_writes() {
    let dir = tempfile::tempdir().unwrap();
    let token;
    {
        let store = open_store(dir.path(), false);
        let mut session = store.start_session();
        for i in 0..100u64 {
            assert_eq!(session.upsert(&key(i), &val(i * 10), i + 1), Status::Ok);
        }
        token = store.take_full_checkpoint().unwrap();
        session.complete_checkpoint().unwrap();
        session.stop();
    }

    let store = open_store(dir.path(), false);
    store.recover(token, token).unwrap();
    let mut session = store.start_session();

    let mut out = Vec::new();
    for i in 0..100u64 {
        assert_eq!(session.read(&key(i), &[], &mut out, i + 1), Status::Ok);
        assert_eq!(out, val(i * 10));
    }
    // The recovered log keeps accepting writes and reads them back.
    assert_eq!(session.upsert(&key(7), &val(777), 200), Status::Ok);
    assert_eq!(session.read(&key(7), &[], &mut out, 201), Status::Ok);
    assert_eq!(out, val(777));
}

#[test]
fn index_only_checkpoint_returns_to_rest() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), false);
    let mut session = store.start_session();
    for i in 0..10u64 {
        session.upsert(&key(i), &val(i), i + 1);
    }
    let token = store.take_index_checkpoint().unwrap();
    session.complete_checkpoint().unwrap();

    let token_dir = dir.path().join("checkpoints").join(token.to_string());
    assert!(token_dir.join("index.meta").is_file());
    assert!(token_dir.join("ht.dat").is_file());
    assert!(token_dir.join("ofb.dat").is_file());
    // Index-only checkpoints write no hybrid-log metadata.
    assert!(!token_dir.join("hlog.meta").exists());

    // The store is live afterwards.
    assert_eq!(session.upsert(&key(99), &val(99), 50), Status::Ok);
}

#[test]
fn recover_rejects_wrong_token() {
    let dir = tempfile::tempdir().unwrap();
    let token;
    {
        let store = open_store(dir.path(), false);
        let mut session = store.start_session();
        session.upsert(&key(1), &val(1), 1);
        token = store.take_full_checkpoint().unwrap();
        session.complete_checkpoint().unwrap();
        session.stop();
    }
    let store = open_store(dir.path(), false);
    let bogus = Uuid::new_v4();
    assert!(store.recover(bogus, token).is_err());
}

#[test]
fn checkpoint_under_concurrent_rmw_loses_no_update() {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::new(dir.path().join("log"), 20).unwrap();
    let store: Store<common::SumFunctions> = Store::new(
        settings(dir.path(), false),
        Arc::new(device),
        common::SumFunctions,
    )
    .unwrap();

    const UPDATES: u64 = 500;
    let writer = {
        let store = store.clone();
        std::thread::spawn(move || {
            let mut session = store.start_session();
            for serial in 1..=UPDATES {
                assert_ne!(session.rmw(&key(11), &val(1), serial), Status::Error);
                if serial % 16 == 0 {
                    session.refresh();
                    session.complete_pending(false);
                }
            }
            session.complete_pending(true);
            session.stop();
        })
    };

    // Drive a hybrid-log checkpoint through the middle of the updates.
    let mut coordinator = store.start_session();
    let _token = loop {
        match store.take_hybrid_log_checkpoint() {
            Ok(token) => break token,
            Err(_) => std::thread::yield_now(),
        }
    };
    coordinator.complete_checkpoint().unwrap();
    writer.join().unwrap();

    let mut out = Vec::new();
    assert_eq!(coordinator.read(&key(11), &[], &mut out, 1), Status::Ok);
    assert_eq!(out, val(UPDATES), "an update was lost around the version boundary");
}
