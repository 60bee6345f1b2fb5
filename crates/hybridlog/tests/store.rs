//! In-memory operation scenarios: insert/read, RMW creation, overwrite
//! semantics, and two-writer races.

mod common;

use common::{key, memory_store, memory_sum_store, val, SumFunctions};
use hybridlog::{NullDevice, Settings, Status, Store};
use pretty_assertions::{assert_eq, assert_ne};
use std::sync::Arc;

#[test]
fn insert_then_read() {
    let store = memory_store();
    let mut session = store.start_session();

    assert_eq!(session.upsert(&key(7), &val(42), 1), Status::Ok);

    let mut out = Vec::new();
    assert_eq!(session.read(&key(7), &[], &mut out, 2), Status::Ok);
    assert_eq!(out, val(42));
}

#[test]
fn read_missing_key() {
    let store = memory_store();
    let mut session = store.start_session();
    let mut out = Vec::new();
    assert_eq!(session.read(&key(404), &[], &mut out, 1), Status::NotFound);
}

#[test]
fn rmw_first_update_creates() {
    let store = memory_sum_store();
    let mut session = store.start_session();

    // First RMW reports NotFound: the record was created, not modified.
    assert_eq!(session.rmw(&key(9), &val(5), 1), Status::NotFound);

    let mut out = Vec::new();
    assert_eq!(session.read(&key(9), &[], &mut out, 2), Status::Ok);
    assert_eq!(out, val(5));

    assert_eq!(session.rmw(&key(9), &val(3), 3), Status::Ok);
    assert_eq!(session.read(&key(9), &[], &mut out, 4), Status::Ok);
    assert_eq!(out, val(8));
}

#[test]
fn read_your_writes_within_session() {
    let store = memory_store();
    let mut session = store.start_session();
    let mut out = Vec::new();
    for serial in 1..100u64 {
        assert_eq!(session.upsert(&key(1), &val(serial), serial * 2 - 1), Status::Ok);
        assert_eq!(session.read(&key(1), &[], &mut out, serial * 2), Status::Ok);
        assert_eq!(out, val(serial));
    }
}

#[test]
fn upsert_with_different_size_appends() {
    let store = memory_store();
    let mut session = store.start_session();

    assert_eq!(session.upsert(b"k", b"short", 1), Status::Ok);
    let tail_before = store.log_tail_address();
    // Same size: updated in place, the tail does not move.
    assert_eq!(session.upsert(b"k", b"shirt", 2), Status::Ok);
    assert_eq!(store.log_tail_address(), tail_before);
    // A longer value cannot fit in place and appends a new record.
    assert_eq!(session.upsert(b"k", b"substantially longer", 3), Status::Ok);
    assert!(store.log_tail_address() > tail_before);

    let mut out = Vec::new();
    assert_eq!(session.read(b"k", &[], &mut out, 4), Status::Ok);
    assert_eq!(out, b"substantially longer");
}

#[test]
fn oversized_record_is_an_error() {
    let store = memory_store();
    let mut session = store.start_session();
    let huge = vec![0u8; 1 << 15]; // larger than the 16K page
    assert_eq!(session.upsert(b"big", &huge, 1), Status::Error);
}

#[test]
fn two_writer_race_settles_on_one_value() {
    let store = memory_store();
    let writers: Vec<_> = [100u64, 200]
        .into_iter()
        .map(|value| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut session = store.start_session();
                for serial in 1..=1000u64 {
                    assert_ne!(session.upsert(&key(3), &val(value), serial), Status::Error);
                }
                session.complete_pending(true);
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let mut session = store.start_session();
    let mut out = Vec::new();
    assert_eq!(session.read(&key(3), &[], &mut out, 1), Status::Ok);
    assert!(out == val(100) || out == val(200), "got {out:?}");
}

#[test]
fn entry_count_tracks_distinct_keys() {
    let store = memory_store();
    let mut session = store.start_session();
    for i in 0..64u64 {
        session.upsert(&key(i), &val(i), i + 1);
    }
    // Overwrites do not add entries.
    for i in 0..64u64 {
        session.upsert(&key(i), &val(i + 1), 100 + i);
    }
    assert_eq!(store.entry_count(), 64);
}

#[test]
fn sum_functions_accumulate_across_mixed_ops() {
    let store: Store<SumFunctions> = Store::new(
        Settings {
            index_buckets: 64,
            page_size_bits: 14,
            memory_size_bits: 21,
            segment_size_bits: 24,
            ..Settings::default()
        },
        Arc::new(NullDevice),
        SumFunctions,
    )
    .unwrap();
    let mut session = store.start_session();

    assert_eq!(session.upsert(&key(5), &val(10), 1), Status::Ok);
    assert_eq!(session.rmw(&key(5), &val(7), 2), Status::Ok);
    let mut out = Vec::new();
    assert_eq!(session.read(&key(5), &[], &mut out, 3), Status::Ok);
    assert_eq!(out, val(17));
}
