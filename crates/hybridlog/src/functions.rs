//! The user-callback capability.
//!
//! The engine is agnostic to key and value contents: it sees byte-slice
//! views and asks the `Functions` implementation to read, write, and
//! update them in place. Callbacks must not block, and the `concurrent_*`
//! variants must tolerate concurrent invocation on the same record.

/// User callbacks invoked by the operation engine.
///
/// `single_*` variants run on records no other thread can be mutating (a
/// freshly allocated tail record, or a record in the immutable region);
/// `concurrent_*` variants run inside the mutable region where racing
/// readers and writers are possible.
pub trait Functions: Send + Sync + 'static {
    /// Value size for a first-time RMW of `key` with `input`.
    fn initial_value_size(&self, key: &[u8], input: &[u8]) -> usize;

    /// Value size for an RMW of `input` applied over `old`.
    fn updated_value_size(&self, key: &[u8], input: &[u8], old: &[u8]) -> usize;

    fn single_reader(&self, key: &[u8], input: &[u8], value: &[u8], output: &mut Vec<u8>);

    fn concurrent_reader(&self, key: &[u8], input: &[u8], value: &[u8], output: &mut Vec<u8>);

    /// Write `src` into a freshly allocated value slot.
    fn single_writer(&self, key: &[u8], src: &[u8], value: &mut [u8]);

    /// Overwrite a mutable-region value in place. Return false to refuse
    /// (e.g. the sizes no longer match); the engine then appends a new
    /// record instead.
    fn concurrent_writer(&self, key: &[u8], src: &[u8], value: &mut [u8]) -> bool;

    /// Populate the value for a first-time RMW.
    fn initial_updater(&self, key: &[u8], input: &[u8], value: &mut [u8]);

    /// Produce the updated value from the previous version's value.
    fn copy_updater(&self, key: &[u8], input: &[u8], old: &[u8], value: &mut [u8]);

    /// Apply `input` to a mutable-region value in place. Return false to
    /// refuse; the engine falls back to a copy-update.
    fn in_place_updater(&self, key: &[u8], input: &[u8], value: &mut [u8]) -> bool;
}

/// Verbatim byte semantics: upserts copy the value, RMWs overwrite the
/// value with the input. Reads copy the value out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFunctions;

impl Functions for RawFunctions {
    fn initial_value_size(&self, _key: &[u8], input: &[u8]) -> usize {
        input.len()
    }

    fn updated_value_size(&self, _key: &[u8], input: &[u8], _old: &[u8]) -> usize {
        input.len()
    }

    fn single_reader(&self, _key: &[u8], _input: &[u8], value: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend_from_slice(value);
    }

    fn concurrent_reader(&self, _key: &[u8], _input: &[u8], value: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend_from_slice(value);
    }

    fn single_writer(&self, _key: &[u8], src: &[u8], value: &mut [u8]) {
        value.copy_from_slice(src);
    }

    fn concurrent_writer(&self, _key: &[u8], src: &[u8], value: &mut [u8]) -> bool {
        if src.len() != value.len() {
            return false;
        }
        value.copy_from_slice(src);
        true
    }

    fn initial_updater(&self, _key: &[u8], input: &[u8], value: &mut [u8]) {
        value.copy_from_slice(input);
    }

    fn copy_updater(&self, _key: &[u8], input: &[u8], _old: &[u8], value: &mut [u8]) {
        value.copy_from_slice(input);
    }

    fn in_place_updater(&self, _key: &[u8], input: &[u8], value: &mut [u8]) -> bool {
        if input.len() != value.len() {
            return false;
        }
        value.copy_from_slice(input);
        true
    }
}
