//! Shared fixtures for the scenario tests.
#![allow(dead_code)] // each test binary uses its own subset

use hybridlog::{Functions, NullDevice, RawFunctions, Settings, Store};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Little-endian u64 counters: RMW adds the input delta, concurrent
/// variants go through atomics so racing sessions never tear a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumFunctions;

fn as_atomic(value: &[u8]) -> &AtomicU64 {
    assert_eq!(value.len(), 8);
    assert_eq!(value.as_ptr() as usize % 8, 0);
    unsafe { &*(value.as_ptr() as *const AtomicU64) }
}

impl Functions for SumFunctions {
    fn initial_value_size(&self, _key: &[u8], _input: &[u8]) -> usize {
        8
    }

    fn updated_value_size(&self, _key: &[u8], _input: &[u8], _old: &[u8]) -> usize {
        8
    }

    fn single_reader(&self, _key: &[u8], _input: &[u8], value: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend_from_slice(value);
    }

    fn concurrent_reader(&self, _key: &[u8], _input: &[u8], value: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend_from_slice(&as_atomic(value).load(Ordering::Acquire).to_le_bytes());
    }

    fn single_writer(&self, _key: &[u8], src: &[u8], value: &mut [u8]) {
        value.copy_from_slice(src);
    }

    fn concurrent_writer(&self, _key: &[u8], src: &[u8], value: &mut [u8]) -> bool {
        if src.len() != value.len() {
            return false;
        }
        as_atomic(value).store(u64::from_le_bytes(src.try_into().unwrap()), Ordering::Release);
        true
    }

    fn initial_updater(&self, _key: &[u8], input: &[u8], value: &mut [u8]) {
        value.copy_from_slice(input);
    }

    fn copy_updater(&self, _key: &[u8], input: &[u8], old: &[u8], value: &mut [u8]) {
        let sum = u64::from_le_bytes(old.try_into().unwrap())
            .wrapping_add(u64::from_le_bytes(input.try_into().unwrap()));
        value.copy_from_slice(&sum.to_le_bytes());
    }

    fn in_place_updater(&self, _key: &[u8], input: &[u8], value: &mut [u8]) -> bool {
        let delta = u64::from_le_bytes(input.try_into().unwrap());
        as_atomic(value).fetch_add(delta, Ordering::AcqRel);
        true
    }
}

/// Route engine tracing into the test harness; `RUST_LOG` filters it.
#[allow(dead_code)]
pub fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

pub fn val(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

/// A memory-only store: the buffer is large enough that nothing the
/// tests write ever evicts below the head.
pub fn memory_settings() -> Settings {
    Settings {
        index_buckets: 512,
        page_size_bits: 14,
        memory_size_bits: 21,
        segment_size_bits: 24,
        ..Settings::default()
    }
}

#[allow(dead_code)]
pub fn memory_store() -> Store<RawFunctions> {
    Store::new(memory_settings(), Arc::new(NullDevice), RawFunctions).unwrap()
}

#[allow(dead_code)]
pub fn memory_sum_store() -> Store<SumFunctions> {
    Store::new(memory_settings(), Arc::new(NullDevice), SumFunctions).unwrap()
}

/// A store whose tiny buffer forces eviction to the file device after a
/// few pages of writes.
#[allow(dead_code)]
pub fn disk_settings(checkpoint_dir: &Path) -> Settings {
    Settings {
        index_buckets: 512,
        page_size_bits: 12,
        memory_size_bits: 14,
        segment_size_bits: 20,
        mutable_fraction: 0.5,
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        ..Settings::default()
    }
}
