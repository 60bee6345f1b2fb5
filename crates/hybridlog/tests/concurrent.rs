//! Concurrency invariants: commutative RMWs land exactly once each, and
//! concurrent writers always settle on exactly one written value.

mod common;

use common::{key, memory_sum_store, val};
use hybridlog::Status;

#[test]
fn concurrent_rmw_adds_land_exactly_once() {
    let store = memory_sum_store();
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 500;

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut session = store.start_session();
                for serial in 1..=PER_THREAD {
                    assert_ne!(session.rmw(&key(42), &val(1), serial), Status::Error);
                    if serial % 32 == 0 {
                        session.refresh();
                        session.complete_pending(false);
                    }
                }
                session.complete_pending(true);
                session.stop();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let mut session = store.start_session();
    let mut out = Vec::new();
    assert_eq!(session.read(&key(42), &[], &mut out, 1), Status::Ok);
    assert_eq!(out, val(THREADS * PER_THREAD));
}

#[test]
fn concurrent_upserts_settle_on_last_writer() {
    let store = memory_sum_store();
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 400;

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut session = store.start_session();
                for serial in 1..=PER_THREAD {
                    let value = t * PER_THREAD + serial;
                    assert_ne!(session.upsert(&key(9), &val(value), serial), Status::Error);
                }
                session.complete_pending(true);
                session.stop();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    // The surviving value is exactly one of the written ones.
    let mut session = store.start_session();
    let mut out = Vec::new();
    assert_eq!(session.read(&key(9), &[], &mut out, 1), Status::Ok);
    let survivor = u64::from_le_bytes(out.as_slice().try_into().unwrap());
    assert!(survivor >= 1 && survivor <= THREADS * PER_THREAD);
}

#[test]
fn mixed_keys_stay_independent_under_contention() {
    let store = memory_sum_store();
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 300;

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut session = store.start_session();
                for serial in 1..=PER_THREAD {
                    // Every thread bumps the shared key and its own key.
                    assert_ne!(
                        session.rmw(&key(0), &val(1), serial * 2 - 1),
                        Status::Error
                    );
                    assert_ne!(
                        session.rmw(&key(100 + t), &val(2), serial * 2),
                        Status::Error
                    );
                }
                session.complete_pending(true);
                session.stop();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let mut session = store.start_session();
    let mut out = Vec::new();
    assert_eq!(session.read(&key(0), &[], &mut out, 1), Status::Ok);
    assert_eq!(out, val(THREADS * PER_THREAD));
    for t in 0..THREADS {
        assert_eq!(session.read(&key(100 + t), &[], &mut out, 2 + t), Status::Ok);
        assert_eq!(out, val(2 * PER_THREAD));
    }
}
