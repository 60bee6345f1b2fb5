//! Sessions: the per-thread execution contexts through which every
//! operation runs.
//!
//! A session owns an epoch slot, a monotone serial number, and the
//! queues that park pending work: a retry queue for deferred operations
//! and a pending-I/O map keyed by request id, fed by a response channel
//! the device completions post into. There is no hidden thread-local
//! state; a `Session` can be moved across threads between operations.

use crate::address::Address;
use crate::functions::Functions;
use crate::hlog::IoResponse;
use crate::state::Phase;
use crate::status::Status;
use crate::store::StoreInner;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a pending operation drained by
/// [`Session::complete_pending`]. `output` is empty for upserts and
/// RMWs.
#[derive(Debug, Clone)]
pub struct CompletedOp {
    pub serial: u64,
    pub status: Status,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Upsert,
    Rmw,
}

/// Everything needed to resume an operation that went pending: the
/// operation inputs (owned), the index entry observed at issue time, and
/// the logical address the disk read targets.
pub(crate) struct PendingContext {
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub input: Vec<u8>,
    pub value: Vec<u8>,
    pub serial: u64,
    pub version: u32,
    pub hash: u64,
    pub entry_word: u64,
    pub logical: Address,
    /// An RMW that parked while holding the bucket's shared latch keeps
    /// it across the pend, blocking conflicting next-version updates.
    pub held_shared: bool,
}

pub(crate) struct ExecutionContext {
    pub guid: Uuid,
    pub version: u32,
    pub phase: Phase,
    pub serial_num: u64,
    pub slot: epoch::Slot,
    pub retry_queue: VecDeque<PendingContext>,
    pub io_pending: HashMap<u64, PendingContext>,
    pub total_pending: u64,
    pub response_tx: Sender<IoResponse>,
    pub response_rx: Receiver<IoResponse>,
    pub completed: Vec<CompletedOp>,
}

impl ExecutionContext {
    pub(crate) fn new(guid: Uuid, version: u32, slot: epoch::Slot) -> ExecutionContext {
        let (response_tx, response_rx) = crossbeam_channel::unbounded();
        ExecutionContext {
            guid,
            version,
            phase: Phase::Rest,
            serial_num: 0,
            slot,
            retry_queue: VecDeque::new(),
            io_pending: HashMap::new(),
            total_pending: 0,
            response_tx,
            response_rx,
            completed: Vec::new(),
        }
    }

    /// Any parked work issued before `version`? Gates the wait-pending
    /// checkpoint phase.
    pub(crate) fn has_pending_below(&self, version: u32) -> bool {
        self.io_pending.values().any(|p| p.version < version)
            || self.retry_queue.iter().any(|p| p.version < version)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.io_pending.is_empty() || !self.retry_queue.is_empty()
    }
}

/// A handle for one session of operations against a [`crate::Store`].
///
/// Operations carry a caller-assigned, per-session monotone serial
/// number; after recovery, `continue_session` reports the last serial
/// whose effects are guaranteed present.
pub struct Session<F: Functions> {
    pub(crate) inner: Arc<StoreInner<F>>,
    pub(crate) ctx: ExecutionContext,
}

impl<F: Functions> Session<F> {
    pub fn guid(&self) -> Uuid {
        self.ctx.guid
    }

    /// Read `key`, writing the result through the reader callback into
    /// `output`. `input` is passed through to the callbacks untouched.
    pub fn read(&mut self, key: &[u8], input: &[u8], output: &mut Vec<u8>, serial: u64) -> Status {
        let status = self.inner.read(&mut self.ctx, key, input, output, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Insert or blindly overwrite `key`'s value.
    pub fn upsert(&mut self, key: &[u8], value: &[u8], serial: u64) -> Status {
        let status = self.inner.upsert(&mut self.ctx, key, value, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Read-modify-write `key` with `input`. Returns `NotFound` when the
    /// update created the record (first write for this key).
    pub fn rmw(&mut self, key: &[u8], input: &[u8], serial: u64) -> Status {
        let status = self.inner.rmw(&mut self.ctx, key, input, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Re-publish this session's epoch and observe any global phase
    /// change, performing the phase's entry actions.
    pub fn refresh(&mut self) {
        self.inner.refresh(&mut self.ctx);
    }

    /// Drain pending I/O completions and deferred retries, returning the
    /// operations that reached a terminal status. With `wait`, loops
    /// (refreshing) until nothing is parked.
    pub fn complete_pending(&mut self, wait: bool) -> Vec<CompletedOp> {
        self.inner.complete_pending(&mut self.ctx, wait);
        std::mem::take(&mut self.ctx.completed)
    }

    /// Drive the running checkpoint (or GC/grow cycle) to completion from
    /// this session. Errors if the device failed while flushing.
    pub fn complete_checkpoint(&mut self) -> Result<()> {
        loop {
            self.refresh();
            self.inner.complete_pending(&mut self.ctx, false);
            if self.inner.log_io_failed() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device write failed during checkpoint",
                )));
            }
            if self.inner.at_rest(&self.ctx) {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// End the session, draining pending work first.
    pub fn stop(mut self) {
        self.inner.complete_pending(&mut self.ctx, true);
        // Drop runs the deregistration.
    }
}

impl<F: Functions> Drop for Session<F> {
    fn drop(&mut self) {
        self.inner.deregister_session(&self.ctx);
    }
}
