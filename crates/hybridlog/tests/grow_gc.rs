//! Index growth and log truncation scenarios.

mod common;

use common::{key, memory_store, val};
use hybridlog::{FileDevice, RawFunctions, Status, Store};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

#[test]
fn grow_preserves_every_key() {
    let store = memory_store();
    let mut session = store.start_session();
    for i in 0..500u64 {
        assert_eq!(session.upsert(&key(i), &val(i), i + 1), Status::Ok);
    }

    let before = store.index_size();
    store.grow_index().unwrap();
    session.complete_checkpoint().unwrap();
    assert_eq!(store.index_size(), before * 2);

    let mut out = Vec::new();
    for i in 0..500u64 {
        assert_eq!(session.read(&key(i), &[], &mut out, 600 + i), Status::Ok);
        assert_eq!(out, val(i));
    }
}

#[test]
fn grow_under_load() {
    let store = memory_store();
    const SESSIONS: u64 = 4;
    const OPS: u64 = 2_000;

    let workers: Vec<_> = (0..SESSIONS)
        .map(|worker| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(worker);
                let mut session = store.start_session();
                let mut written = Vec::new();
                for serial in 1..=OPS {
                    let k = worker * OPS + rng.gen_range(0..OPS);
                    match rng.gen_range(0..3) {
                        0 | 1 => {
                            assert_ne!(
                                session.upsert(&key(k), &val(k + 1), serial),
                                Status::Error
                            );
                            written.push(k);
                        }
                        _ => {
                            let mut out = Vec::new();
                            assert_ne!(
                                session.read(&key(k), &[], &mut out, serial),
                                Status::Error
                            );
                        }
                    }
                    if serial % 64 == 0 {
                        session.refresh();
                    }
                }
                session.complete_pending(true);
                session.stop();
                written
            })
        })
        .collect();

    // Double the index while the workers hammer it.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let before = store.index_size();
    store.grow_index().unwrap();

    let written: Vec<u64> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();

    // Finish the split if the workers left any chunk unclaimed.
    let mut session = store.start_session();
    session.complete_checkpoint().unwrap();
    assert_eq!(store.index_size(), before * 2);

    let mut out = Vec::new();
    for (i, k) in written.iter().enumerate() {
        assert_eq!(
            session.read(&key(*k), &[], &mut out, i as u64 + 1),
            Status::Ok,
            "key {k} lost across grow"
        );
    }
}

#[test]
fn shift_begin_truncates_and_gc_sweeps() {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::new(dir.path().join("log"), 20).unwrap();
    let store: Store<RawFunctions> = Store::new(
        common::disk_settings(&dir.path().join("checkpoints")),
        Arc::new(device),
        RawFunctions,
    )
    .unwrap();
    let mut session = store.start_session();

    assert_eq!(session.upsert(&key(1), b"old", 1), Status::Ok);
    let old_tail = store.log_tail_address();

    let mut serial = 1u64;
    let mut filler = 3_000_000u64;
    while store.log_head_address() <= old_tail {
        serial += 1;
        assert_ne!(session.upsert(&key(filler), &val(filler), serial), Status::Error);
        filler += 1;
        if filler % 64 == 0 {
            session.refresh();
        }
    }

    serial += 1;
    assert_eq!(session.upsert(&key(2), b"new", serial), Status::Ok);

    let cut = store.log_head_address();
    store.shift_begin_address(cut).unwrap();
    session.refresh();
    assert_eq!(store.log_begin_address(), cut);

    // Entries below the cut are swept: the old key is simply gone.
    let mut out = Vec::new();
    serial += 1;
    assert_eq!(session.read(&key(1), &[], &mut out, serial), Status::NotFound);

    // Keys at or above the cut survive.
    serial += 1;
    assert_eq!(session.read(&key(2), &[], &mut out, serial), Status::Ok);
    assert_eq!(out, b"new");
}

#[test]
fn watermarks_stay_ordered_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::new(dir.path().join("log"), 20).unwrap();
    let store: Store<RawFunctions> = Store::new(
        common::disk_settings(&dir.path().join("checkpoints")),
        Arc::new(device),
        RawFunctions,
    )
    .unwrap();
    let mut session = store.start_session();

    let mut last = (
        store.log_begin_address(),
        store.log_head_address(),
        store.log_safe_read_only_address(),
        store.log_read_only_address(),
        store.log_tail_address(),
    );
    for i in 0..3_000u64 {
        assert_ne!(session.upsert(&key(i), &val(i), i + 1), Status::Error);
        let now = (
            store.log_begin_address(),
            store.log_head_address(),
            store.log_safe_read_only_address(),
            store.log_read_only_address(),
            store.log_tail_address(),
        );
        // Ordered, and each watermark non-decreasing.
        assert!(now.0 <= now.1 && now.1 <= now.2 && now.2 <= now.3 && now.3 <= now.4);
        assert!(now.0 >= last.0 && now.1 >= last.1 && now.2 >= last.2 && now.3 >= last.3);
        last = now;
        if i % 64 == 0 {
            session.refresh();
        }
    }
}
