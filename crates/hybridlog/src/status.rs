//! Operation status kinds: the public surface and the internal
//! dispatcher vocabulary.

/// Status returned to callers of `read`/`upsert`/`rmw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    /// The operation parked on a disk read or a deferred retry; drain it
    /// with `Session::complete_pending`.
    Pending,
    Error,
}

/// Internal statuses flowing between the state machines and
/// `handle_operation_status`. `RetryNow` never escapes the engine: it is
/// resolved by a bounded re-execution loop and promoted to `RetryLater`
/// past the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationStatus {
    Success,
    NotFound,
    RetryNow,
    RetryLater,
    RecordOnDisk,
    CprShiftDetected,
}

/// Cap on immediate CAS-loser re-executions before deferring to the
/// retry queue.
pub(crate) const MAX_IMMEDIATE_RETRIES: u32 = 64;
