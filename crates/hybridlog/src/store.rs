//! The operation engine: the READ, UPSERT and RMW state machines, their
//! pending-I/O continuations, and the public store surface.
//!
//! Every operation shares a preamble: hash the key, help any orthogonal
//! maintenance cycle (GC sweep, index split) when the system is not at
//! rest, then resolve the key's index entry and dispatch on which log
//! region holds the record. The checkpoint phase machine adds bucket
//! latching and version checks on top (the CPR entry protocol); see
//! `checkpoint.rs` for the phase transitions themselves.

use crate::address::Address;
use crate::checkpoint::CheckpointCtx;
use crate::device::Device;
use crate::functions::Functions;
use crate::hlog::{Allocation, HybridLog};
use crate::index::{entry_address, entry_with_address, key_hash, HashIndex};
use crate::record::{record_size, DiskRecord, RecordInfo, RecordPtr, VERSION_MASK};
use crate::session::{CompletedOp, ExecutionContext, OpKind, PendingContext, Session};
use crate::state::{AtomicSystemState, Phase, SystemState};
use crate::status::{OperationStatus, Status, MAX_IMMEDIATE_RETRIES};
use crate::{Error, Result, Settings};
use epoch::LightEpoch;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Which bucket latch an operation currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchOp {
    None,
    Shared,
    Exclusive,
}

/// True when the record's stored 13-bit version is *newer* than the
/// session's, modulo wrap.
#[inline]
pub(crate) fn version_newer(record: u32, session: u32) -> bool {
    let session = session & VERSION_MASK;
    record != session && record.wrapping_sub(session) & VERSION_MASK <= VERSION_MASK / 2
}

/// True when the chain head is strictly older than the session version
/// (or absent), i.e. safe to supersede with a session-version record.
#[inline]
fn version_older(record: Option<u32>, session: u32) -> bool {
    match record {
        None => true,
        Some(v) => v != session & VERSION_MASK && !version_newer(v, session),
    }
}

pub(crate) struct StoreInner<F: Functions> {
    pub settings: Settings,
    pub functions: F,
    pub epoch: Arc<LightEpoch>,
    pub state: AtomicSystemState,
    pub hlog: Arc<HybridLog>,
    pub index: HashIndex,
    pub checkpoint: Mutex<CheckpointCtx>,
    /// CAS-loser re-executions, exposed for contention diagnostics.
    pub retry_now_count: AtomicU64,
}

/// The store handle. Cheap to clone; all clones share state. Operations
/// go through a [`Session`] obtained from `start_session`.
pub struct Store<F: Functions> {
    pub(crate) inner: Arc<StoreInner<F>>,
}

impl<F: Functions> Clone for Store<F> {
    fn clone(&self) -> Self {
        Store {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Functions> Store<F> {
    pub fn new(settings: Settings, device: Arc<dyn Device>, functions: F) -> Result<Store<F>> {
        settings.validate()?;
        if device.segment_size() < settings.page_size() {
            return Err(Error::BadGeometry(device.segment_size()));
        }
        let epoch = Arc::new(LightEpoch::new());
        let hlog = Arc::new(HybridLog::new(&settings, device, Arc::clone(&epoch)));
        let index = HashIndex::new(settings.index_buckets);
        Ok(Store {
            inner: Arc::new(StoreInner {
                settings,
                functions,
                epoch,
                state: AtomicSystemState::new(SystemState::new(Phase::Rest, 1)),
                hlog,
                index,
                checkpoint: Mutex::new(CheckpointCtx::default()),
                retry_now_count: AtomicU64::new(0),
            }),
        })
    }

    /// Open a new session. Sessions must refresh (or complete pending
    /// work) periodically for checkpoints and log maintenance to make
    /// progress.
    pub fn start_session(&self) -> Session<F> {
        let guid = Uuid::new_v4();
        self.session_with_guid(guid, 0)
    }

    /// Resume a recovered session, returning the last serial number whose
    /// effects the recovered state is guaranteed to contain.
    pub fn continue_session(&self, guid: Uuid) -> Result<(Session<F>, u64)> {
        let serial = self
            .inner
            .checkpoint
            .lock()
            .continue_tokens
            .get(&guid)
            .copied()
            .ok_or(Error::UnknownSession(guid))?;
        let mut session = self.session_with_guid(guid, serial);
        session.ctx.serial_num = serial;
        Ok((session, serial))
    }

    fn session_with_guid(&self, guid: Uuid, serial: u64) -> Session<F> {
        let slot = self.inner.epoch.acquire();
        self.inner.epoch.protect(slot);
        let version = self.inner.state.load().version;
        let mut ctx = ExecutionContext::new(guid, version, slot);
        ctx.serial_num = serial;
        self.inner.checkpoint.lock().live_sessions.insert(guid);
        Session {
            inner: Arc::clone(&self.inner),
            ctx,
        }
    }

    pub fn take_full_checkpoint(&self) -> Result<Uuid> {
        self.inner.begin_checkpoint(crate::checkpoint::CheckpointKind::Full)
    }

    pub fn take_index_checkpoint(&self) -> Result<Uuid> {
        self.inner.begin_checkpoint(crate::checkpoint::CheckpointKind::IndexOnly)
    }

    pub fn take_hybrid_log_checkpoint(&self) -> Result<Uuid> {
        self.inner.begin_checkpoint(crate::checkpoint::CheckpointKind::HybridLogOnly)
    }

    /// Load a checkpointed index and log. The store must be freshly
    /// constructed: at rest, with no live sessions.
    pub fn recover(&self, index_token: Uuid, hlog_token: Uuid) -> Result<()> {
        self.inner.recover(index_token, hlog_token)
    }

    /// Begin doubling the hash index. Live sessions drive the split as
    /// they refresh; the cycle ends back at rest.
    pub fn grow_index(&self) -> Result<()> {
        let inner = &self.inner;
        let _serialize = inner.checkpoint.lock();
        let cur = inner.state.load();
        if cur.phase != Phase::Rest {
            return Err(Error::Busy);
        }
        inner.index.start_grow();
        if !inner
            .state
            .global_move_to_next_state(cur, SystemState::new(Phase::PrepareGrow, cur.version))
        {
            return Err(Error::Busy);
        }
        tracing::info!(new_size = inner.index.size() * 2, "index grow started");
        let moved = Arc::clone(inner);
        inner.epoch.bump(Box::new(move || {
            // Every session has drained out of rest-phase operations; flip
            // lookups over to the new generation and open the split.
            moved.index.flip_version();
            moved.state.global_move_to_next_state(
                SystemState::new(Phase::PrepareGrow, cur.version),
                SystemState::new(Phase::InProgressGrow, cur.version),
            );
        }));
        Ok(())
    }

    /// Truncate the log below `addr`: storage is reclaimed after the
    /// epoch drains, and stale index entries are swept out.
    pub fn shift_begin_address(&self, addr: Address) -> Result<()> {
        let inner = &self.inner;
        {
            let _serialize = inner.checkpoint.lock();
            let cur = inner.state.load();
            if cur.phase != Phase::Rest {
                return Err(Error::Busy);
            }
            inner.hlog.shift_begin(addr);
            inner.index.start_gc(addr);
            if !inner
                .state
                .global_move_to_next_state(cur, SystemState::new(Phase::Gc, cur.version))
            {
                return Err(Error::Busy);
            }
        }
        // Sweep on the caller's thread; concurrent sessions help through
        // their own refreshes.
        while !inner.index.gc_help() {
            std::hint::spin_loop();
        }
        let cur = inner.state.load();
        if cur.phase == Phase::Gc {
            inner
                .state
                .global_move_to_next_state(cur, SystemState::new(Phase::Rest, cur.version));
        }
        Ok(())
    }

    pub fn log_tail_address(&self) -> Address {
        self.inner.hlog.tail_address()
    }

    pub fn log_read_only_address(&self) -> Address {
        self.inner.hlog.read_only_address()
    }

    pub fn log_head_address(&self) -> Address {
        self.inner.hlog.head_address()
    }

    pub fn log_begin_address(&self) -> Address {
        self.inner.hlog.begin_address()
    }

    pub fn log_safe_read_only_address(&self) -> Address {
        self.inner.hlog.safe_read_only_address()
    }

    pub fn index_size(&self) -> u64 {
        self.inner.index.size()
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.index.entry_count()
    }

    /// How many times an operation lost a publish CAS and re-executed.
    pub fn contention_retries(&self) -> u64 {
        self.inner.retry_now_count.load(Ordering::Relaxed)
    }

    /// Flush-and-close the device. Sessions must have been stopped.
    pub fn dispose(self) {
        self.inner.hlog.device().close();
    }
}

impl<F: Functions> StoreInner<F> {
    pub(crate) fn log_io_failed(&self) -> bool {
        self.hlog.io_failed()
    }

    pub(crate) fn at_rest(&self, ctx: &ExecutionContext) -> bool {
        let global = self.state.load();
        global.phase == Phase::Rest && ctx.phase == Phase::Rest && ctx.version == global.version
    }

    /// Publish this session's epoch and align its `{phase, version}` with
    /// the global state, performing any phase entry actions.
    pub(crate) fn refresh(self: &Arc<Self>, ctx: &mut ExecutionContext) {
        self.epoch.protect(ctx.slot);
        let global = self.state.load();
        match global.phase {
            Phase::Rest => {
                ctx.phase = Phase::Rest;
                ctx.version = global.version;
            }
            Phase::Gc => {
                if self.index.gc_help() {
                    self.state
                        .global_move_to_next_state(global, SystemState::new(Phase::Rest, global.version));
                }
            }
            Phase::PrepareGrow => {
                // Wait out the flip in heavy_enter; nothing to do here.
            }
            Phase::InProgressGrow => {
                if self.index.grow_help(&self.hlog) {
                    self.finish_grow(global);
                }
            }
            _ => self.handle_checkpoint_phase(ctx, global),
        }
    }

    fn finish_grow(self: &Arc<Self>, global: SystemState) {
        if self
            .state
            .global_move_to_next_state(global, SystemState::new(Phase::Rest, global.version))
        {
            let inner = Arc::clone(self);
            self.epoch.bump(Box::new(move || inner.index.finish_grow()));
            tracing::info!(size = self.index.size(), "index grow complete");
        }
    }

    /// Per-operation help for orthogonal cycles, run whenever the system
    /// is not at rest.
    fn heavy_enter(self: &Arc<Self>, hash: u64, ctx: &mut ExecutionContext) {
        loop {
            let global = self.state.load();
            match global.phase {
                Phase::Gc => {
                    if self.index.gc_help() {
                        self.state.global_move_to_next_state(
                            global,
                            SystemState::new(Phase::Rest, global.version),
                        );
                    }
                    return;
                }
                Phase::PrepareGrow => {
                    // All operations block until the split opens.
                    self.epoch.protect(ctx.slot);
                    std::hint::spin_loop();
                }
                Phase::InProgressGrow => {
                    self.index.split_for_hash(hash, &self.hlog);
                    return;
                }
                _ => return,
            }
        }
    }

    pub(crate) fn deregister_session(self: &Arc<Self>, ctx: &ExecutionContext) {
        {
            let mut ckpt = self.checkpoint.lock();
            ckpt.live_sessions.remove(&ctx.guid);
            ckpt.phase_marks.remove(&ctx.guid);
        }
        self.epoch.release(ctx.slot);
        // The departed session may have been the last unmarked one.
        self.maybe_advance_after_departure();
    }

    // ---- Allocation ----

    /// Allocate log space, backing off while the tail page's frame is
    /// still flushing or evicting. The only blocking point in the engine.
    fn block_allocate(self: &Arc<Self>, ctx: &mut ExecutionContext, size: u64) -> Address {
        loop {
            match self.hlog.allocate(size) {
                Allocation::Done(addr) => return addr,
                Allocation::Retry => continue,
                Allocation::Pending(blocked) => {
                    self.epoch.protect(ctx.slot);
                    if blocked >= self.hlog.read_only_address() {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Allocation::TooLarge => {
                    // Guarded by the record-size check in the public ops.
                    unreachable!("record larger than a log page")
                }
            }
        }
    }

    fn record_fits(&self, key: &[u8], value_len: usize) -> bool {
        record_size(key.len(), value_len) <= self.settings.page_size()
    }

    // ---- READ ----

    pub(crate) fn read(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        output: &mut Vec<u8>,
        serial: u64,
    ) -> Status {
        let mut pending = None;
        let mut status = self.internal_read(ctx, key, input, output, serial, &mut pending);
        if status == OperationStatus::CprShiftDetected {
            self.refresh(ctx);
            pending = None;
            status = self.internal_read(ctx, key, input, output, serial, &mut pending);
            debug_assert!(status != OperationStatus::CprShiftDetected);
        }
        self.handle_operation_status(ctx, status, pending)
    }

    fn internal_read(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        output: &mut Vec<u8>,
        serial: u64,
        pending: &mut Option<PendingContext>,
    ) -> OperationStatus {
        let hash = key_hash(key);
        if self.state.load().phase != Phase::Rest {
            self.heavy_enter(hash, ctx);
        }

        let Some((slot, entry)) = self.index.find_tag(hash) else {
            return OperationStatus::NotFound;
        };
        let mut logical = entry_address(entry);
        if !logical.is_valid() {
            return OperationStatus::NotFound;
        }

        let head = self.hlog.head_address();
        let mut latest_version = None;
        if logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            latest_version = Some(rec.info().version());
            if rec.info().invalid() || rec.key() != key {
                logical = self.trace_back_for_key_match(rec.info().previous_address(), key, head);
            }
        }

        if ctx.phase == Phase::Prepare {
            if let Some(v) = latest_version {
                if version_newer(v, ctx.version) {
                    return OperationStatus::CprShiftDetected;
                }
            }
        }

        let safe_ro = self.hlog.safe_read_only_address();
        let begin = self.hlog.begin_address();

        if logical.is_valid() && logical >= safe_ro {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if rec.info().tombstone() {
                return OperationStatus::NotFound;
            }
            self.functions.concurrent_reader(key, input, rec.value(), output);
            OperationStatus::Success
        } else if logical.is_valid() && logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if rec.info().tombstone() {
                return OperationStatus::NotFound;
            }
            self.functions.single_reader(key, input, rec.value(), output);
            OperationStatus::Success
        } else if logical.is_valid() && logical >= begin {
            if ctx.phase == Phase::Prepare {
                // Probe the latch: an exclusive holder means a newer
                // version is being installed under this bucket.
                if !slot.bucket().try_acquire_shared() {
                    return OperationStatus::CprShiftDetected;
                }
                slot.bucket().release_shared();
            }
            *pending = Some(PendingContext {
                kind: OpKind::Read,
                key: key.to_vec(),
                input: input.to_vec(),
                value: Vec::new(),
                serial,
                version: ctx.version,
                hash,
                entry_word: entry,
                logical,
                held_shared: false,
            });
            OperationStatus::RecordOnDisk
        } else {
            OperationStatus::NotFound
        }
    }

    fn trace_back_for_key_match(&self, start: Address, key: &[u8], head: Address) -> Address {
        let mut cur = start;
        while cur.is_valid() && cur >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(cur)) };
            if !rec.info().invalid() && rec.key() == key {
                return cur;
            }
            cur = rec.info().previous_address();
        }
        cur
    }

    // ---- UPSERT ----

    pub(crate) fn upsert(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        value: &[u8],
        serial: u64,
    ) -> Status {
        if !self.record_fits(key, value.len()) {
            return Status::Error;
        }
        let mut cpr_retries = 0u32;
        let mut spins = 0u32;
        loop {
            let status = self.internal_upsert(ctx, key, value, serial);
            match status {
                OperationStatus::RetryNow => {
                    spins += 1;
                    if spins > MAX_IMMEDIATE_RETRIES {
                        let pending = self.pending_for(OpKind::Upsert, ctx, key, &[], value, serial);
                        return self.handle_operation_status(ctx, OperationStatus::RetryLater, Some(pending));
                    }
                }
                OperationStatus::CprShiftDetected => {
                    debug_assert!(cpr_retries == 0, "repeated CPR shift in one operation");
                    cpr_retries += 1;
                    self.refresh(ctx);
                }
                OperationStatus::RetryLater => {
                    let pending = self.pending_for(OpKind::Upsert, ctx, key, &[], value, serial);
                    return self.handle_operation_status(ctx, status, Some(pending));
                }
                _ => return self.handle_operation_status(ctx, status, None),
            }
        }
    }

    fn pending_for(
        &self,
        kind: OpKind,
        ctx: &ExecutionContext,
        key: &[u8],
        input: &[u8],
        value: &[u8],
        serial: u64,
    ) -> PendingContext {
        PendingContext {
            kind,
            key: key.to_vec(),
            input: input.to_vec(),
            value: value.to_vec(),
            serial,
            version: ctx.version,
            hash: key_hash(key),
            entry_word: 0,
            logical: Address::INVALID,
            held_shared: false,
        }
    }

    fn internal_upsert(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        value: &[u8],
        _serial: u64,
    ) -> OperationStatus {
        let hash = key_hash(key);
        if self.state.load().phase != Phase::Rest {
            self.heavy_enter(hash, ctx);
        }

        let (slot, entry) = self.index.find_or_create_tag(hash);
        let mut logical = entry_address(entry);
        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let mut latest_version = None;
        if logical.is_valid() && logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            latest_version = Some(rec.info().version());
            if rec.info().invalid() || rec.key() != key {
                logical = self.trace_back_for_key_match(rec.info().previous_address(), key, head);
            }
        }

        // Fast path: at rest, record in the mutable region.
        if ctx.phase == Phase::Rest && logical.is_valid() && logical >= read_only {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if !rec.info().tombstone()
                && self.functions.concurrent_writer(key, value, rec.value_mut())
            {
                return OperationStatus::Success;
            }
            return self.create_record_upsert(ctx, key, value, slot, entry);
        }

        // CPR entry protocol.
        let mut latch = LatchOp::None;
        let mut divert_create = false;
        match ctx.phase {
            Phase::Prepare => {
                if !slot.bucket().try_acquire_shared() {
                    return OperationStatus::CprShiftDetected;
                }
                latch = LatchOp::Shared;
                if latest_version.map_or(false, |v| version_newer(v, ctx.version)) {
                    slot.bucket().release_shared();
                    return OperationStatus::CprShiftDetected;
                }
            }
            Phase::InProgress => {
                if version_older(latest_version, ctx.version) {
                    if !slot.bucket().try_acquire_exclusive() {
                        return OperationStatus::RetryLater;
                    }
                    latch = LatchOp::Exclusive;
                    divert_create = true;
                }
            }
            Phase::WaitPending => {
                if version_older(latest_version, ctx.version) {
                    if !slot.bucket().no_shared_latches() {
                        return OperationStatus::RetryLater;
                    }
                    divert_create = true;
                }
            }
            Phase::WaitFlush => {
                if version_older(latest_version, ctx.version) {
                    divert_create = true;
                }
            }
            _ => {}
        }

        let status = if !divert_create && logical.is_valid() && logical >= read_only {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if !rec.info().tombstone()
                && self.functions.concurrent_writer(key, value, rec.value_mut())
            {
                OperationStatus::Success
            } else {
                self.create_record_upsert(ctx, key, value, slot, entry)
            }
        } else {
            self.create_record_upsert(ctx, key, value, slot, entry)
        };

        match latch {
            LatchOp::Shared => slot.bucket().release_shared(),
            LatchOp::Exclusive => slot.bucket().release_exclusive(),
            LatchOp::None => {}
        }
        status
    }

    fn create_record_upsert(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        value: &[u8],
        slot: crate::index::SlotRef,
        entry: u64,
    ) -> OperationStatus {
        let size = record_size(key.len(), value.len());
        let addr = self.block_allocate(ctx, size);
        let info = RecordInfo::new(ctx.version, entry_address(entry), false);
        let rec = unsafe { RecordPtr::write_new(self.hlog.get_physical(addr), info, key, value.len()) };
        self.functions.single_writer(key, value, rec.value_mut());

        if slot.cas(entry, entry_with_address(entry, addr)) {
            OperationStatus::Success
        } else {
            // Another writer published first; orphan our record.
            rec.set_invalid();
            self.retry_now_count.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(addr = %addr, "upsert lost publish race");
            OperationStatus::RetryNow
        }
    }

    // ---- RMW ----

    pub(crate) fn rmw(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        serial: u64,
    ) -> Status {
        if !self.record_fits(key, self.functions.initial_value_size(key, input)) {
            return Status::Error;
        }
        let mut cpr_retries = 0u32;
        let mut spins = 0u32;
        loop {
            let mut pending = None;
            let status = self.internal_rmw(ctx, key, input, serial, &mut pending);
            match status {
                OperationStatus::RetryNow => {
                    spins += 1;
                    if spins > MAX_IMMEDIATE_RETRIES {
                        let pending = self.pending_for(OpKind::Rmw, ctx, key, input, &[], serial);
                        return self.handle_operation_status(ctx, OperationStatus::RetryLater, Some(pending));
                    }
                }
                OperationStatus::CprShiftDetected => {
                    debug_assert!(cpr_retries == 0, "repeated CPR shift in one operation");
                    cpr_retries += 1;
                    self.refresh(ctx);
                }
                OperationStatus::RetryLater => {
                    // The latch-refusal branches defer without a context
                    // of their own; build one here.
                    let pending = pending.unwrap_or_else(|| {
                        self.pending_for(OpKind::Rmw, ctx, key, input, &[], serial)
                    });
                    return self.handle_operation_status(ctx, status, Some(pending));
                }
                _ => return self.handle_operation_status(ctx, status, pending),
            }
        }
    }

    fn internal_rmw(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        serial: u64,
        pending: &mut Option<PendingContext>,
    ) -> OperationStatus {
        let hash = key_hash(key);
        if self.state.load().phase != Phase::Rest {
            self.heavy_enter(hash, ctx);
        }

        let (slot, entry) = self.index.find_or_create_tag(hash);
        let mut logical = entry_address(entry);
        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        let begin = self.hlog.begin_address();
        let mut latest_version = None;
        if logical.is_valid() && logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            latest_version = Some(rec.info().version());
            if rec.info().invalid() || rec.key() != key {
                logical = self.trace_back_for_key_match(rec.info().previous_address(), key, head);
            }
        }

        // Fast path: at rest, record in the mutable region.
        if ctx.phase == Phase::Rest && logical.is_valid() && logical >= read_only {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if !rec.info().tombstone()
                && self.functions.in_place_updater(key, input, rec.value_mut())
            {
                return OperationStatus::Success;
            }
            let old = (!rec.info().tombstone()).then(|| rec.value().to_vec());
            return self.create_record_rmw(ctx, key, input, old.as_deref(), slot, entry);
        }

        let mut latch = LatchOp::None;
        let mut divert_create = false;
        match ctx.phase {
            Phase::Prepare => {
                if !slot.bucket().try_acquire_shared() {
                    return OperationStatus::CprShiftDetected;
                }
                latch = LatchOp::Shared;
                if latest_version.map_or(false, |v| version_newer(v, ctx.version)) {
                    slot.bucket().release_shared();
                    return OperationStatus::CprShiftDetected;
                }
            }
            Phase::InProgress => {
                if version_older(latest_version, ctx.version) {
                    if !slot.bucket().try_acquire_exclusive() {
                        return OperationStatus::RetryLater;
                    }
                    latch = LatchOp::Exclusive;
                    divert_create = true;
                }
            }
            Phase::WaitPending => {
                if version_older(latest_version, ctx.version) {
                    if !slot.bucket().no_shared_latches() {
                        return OperationStatus::RetryLater;
                    }
                    divert_create = true;
                }
            }
            Phase::WaitFlush => {
                if version_older(latest_version, ctx.version) {
                    divert_create = true;
                }
            }
            _ => {}
        }

        let status = self.rmw_dispatch(
            ctx,
            key,
            input,
            serial,
            slot,
            entry,
            logical,
            divert_create,
            (head, read_only, safe_read_only, begin),
            &mut latch,
            pending,
        );

        match latch {
            LatchOp::Shared => slot.bucket().release_shared(),
            LatchOp::Exclusive => slot.bucket().release_exclusive(),
            LatchOp::None => {}
        }
        status
    }

    /// Region dispatch shared by the primary RMW path and the pending
    /// retry path. On the paths that park the operation (`RetryLater` in
    /// the fuzzy region, `RecordOnDisk`), a held shared latch transfers
    /// into the pending context instead of being released, so the bucket
    /// keeps excluding next-version updates until the retry lands.
    #[allow(clippy::too_many_arguments)]
    fn rmw_dispatch(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        serial: u64,
        slot: crate::index::SlotRef,
        entry: u64,
        logical: Address,
        divert_create: bool,
        regions: (Address, Address, Address, Address),
        latch: &mut LatchOp,
        pending: &mut Option<PendingContext>,
    ) -> OperationStatus {
        let (head, read_only, safe_read_only, begin) = regions;

        if !divert_create && logical.is_valid() && logical >= read_only {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            if !rec.info().tombstone()
                && self.functions.in_place_updater(key, input, rec.value_mut())
            {
                return OperationStatus::Success;
            }
            let old = (!rec.info().tombstone()).then(|| rec.value().to_vec());
            return self.create_record_rmw(ctx, key, input, old.as_deref(), slot, entry);
        }

        if !divert_create && logical.is_valid() && logical >= safe_read_only {
            // Fuzzy region: the record may still be receiving in-place
            // writes from racing sessions. Park and retry once frozen.
            let mut pctx = self.pending_for(OpKind::Rmw, ctx, key, input, &[], serial);
            pctx.entry_word = entry;
            pctx.logical = logical;
            pctx.held_shared = *latch == LatchOp::Shared;
            if pctx.held_shared {
                *latch = LatchOp::None;
            }
            *pending = Some(pctx);
            return OperationStatus::RetryLater;
        }

        if logical.is_valid() && logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            let old = (!rec.info().tombstone()).then(|| rec.value().to_vec());
            return self.create_record_rmw(ctx, key, input, old.as_deref(), slot, entry);
        }

        if logical.is_valid() && logical >= begin {
            let mut pctx = self.pending_for(OpKind::Rmw, ctx, key, input, &[], serial);
            pctx.entry_word = entry;
            pctx.logical = logical;
            pctx.held_shared = *latch == LatchOp::Shared;
            if pctx.held_shared {
                *latch = LatchOp::None;
            }
            *pending = Some(pctx);
            return OperationStatus::RecordOnDisk;
        }

        // First write for this key: create through the initial updater.
        self.create_record_rmw(ctx, key, input, None, slot, entry)
    }

    fn create_record_rmw(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        key: &[u8],
        input: &[u8],
        old: Option<&[u8]>,
        slot: crate::index::SlotRef,
        entry: u64,
    ) -> OperationStatus {
        let value_len = match old {
            Some(old) => self.functions.updated_value_size(key, input, old),
            None => self.functions.initial_value_size(key, input),
        };
        if !self.record_fits(key, value_len) {
            tracing::error!(key_len = key.len(), value_len, "updated record exceeds page size");
            return OperationStatus::NotFound;
        }
        let addr = self.block_allocate(ctx, record_size(key.len(), value_len));
        let info = RecordInfo::new(ctx.version, entry_address(entry), false);
        let rec = unsafe { RecordPtr::write_new(self.hlog.get_physical(addr), info, key, value_len) };
        match old {
            Some(old) => self.functions.copy_updater(key, input, old, rec.value_mut()),
            None => self.functions.initial_updater(key, input, rec.value_mut()),
        }

        if slot.cas(entry, entry_with_address(entry, addr)) {
            if old.is_some() {
                OperationStatus::Success
            } else {
                // First creation: reported as NotFound to distinguish a
                // modify from an initial write.
                OperationStatus::NotFound
            }
        } else {
            rec.set_invalid();
            self.retry_now_count.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(addr = %addr, "rmw lost publish race");
            OperationStatus::RetryNow
        }
    }

    // ---- Pending dispatch and continuation ----

    /// Central dispatcher for non-terminal statuses coming out of the
    /// state machines.
    fn handle_operation_status(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        status: OperationStatus,
        pending: Option<PendingContext>,
    ) -> Status {
        match status {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RecordOnDisk => {
                let pctx = pending.expect("disk pend without context");
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                let logical = pctx.logical;
                ctx.io_pending.insert(id, pctx);
                self.hlog
                    .async_get_from_disk(logical, ctx.response_tx.clone(), id);
                Status::Pending
            }
            OperationStatus::RetryLater => {
                ctx.retry_queue
                    .push_back(pending.expect("deferred retry without context"));
                Status::Pending
            }
            OperationStatus::RetryNow | OperationStatus::CprShiftDetected => {
                unreachable!("resolved inside the operation wrappers")
            }
        }
    }

    /// Drain I/O completions, then deferred retries; with `wait`, loop
    /// (refreshing each round) until nothing is parked.
    pub(crate) fn complete_pending(self: &Arc<Self>, ctx: &mut ExecutionContext, wait: bool) {
        loop {
            while let Ok(response) = ctx.response_rx.try_recv() {
                let Some(pctx) = ctx.io_pending.remove(&response.id) else {
                    continue;
                };
                match pctx.kind {
                    OpKind::Read => self.continue_pending_read(ctx, pctx, response.result),
                    OpKind::Rmw => self.continue_pending_rmw(ctx, pctx, response.result),
                    OpKind::Upsert => unreachable!("upserts never read from disk"),
                }
            }

            for _ in 0..ctx.retry_queue.len() {
                let Some(pctx) = ctx.retry_queue.pop_front() else {
                    break;
                };
                match pctx.kind {
                    OpKind::Rmw => self.retry_pending_rmw(ctx, pctx),
                    OpKind::Upsert => self.retry_pending_upsert(ctx, pctx),
                    OpKind::Read => self.retry_pending_read(ctx, pctx),
                }
            }

            if !wait || !ctx.has_pending() {
                return;
            }
            self.refresh(ctx);
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }

    fn release_held_latch(&self, pctx: &PendingContext) {
        if pctx.held_shared {
            self.index.bucket_latch(pctx.hash).release_shared();
        }
    }

    fn continue_pending_read(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        mut pctx: PendingContext,
        result: std::io::Result<DiskRecord>,
    ) {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(%err, serial = pctx.serial, "pending read failed");
                ctx.completed.push(CompletedOp {
                    serial: pctx.serial,
                    status: Status::Error,
                    output: Vec::new(),
                });
                return;
            }
        };

        // The disk record may be an older link of a shared-tag chain;
        // keep walking down the on-disk chain until the key matches.
        if record.info.invalid() || record.key != pctx.key {
            let prev = record.info.previous_address();
            if prev.is_valid() && prev >= self.hlog.begin_address() {
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                pctx.logical = prev;
                ctx.io_pending.insert(id, pctx);
                self.hlog.async_get_from_disk(prev, ctx.response_tx.clone(), id);
                return;
            }
            ctx.completed.push(CompletedOp {
                serial: pctx.serial,
                status: Status::NotFound,
                output: Vec::new(),
            });
            return;
        }

        if record.info.tombstone() {
            ctx.completed.push(CompletedOp {
                serial: pctx.serial,
                status: Status::NotFound,
                output: Vec::new(),
            });
            return;
        }

        let mut output = Vec::new();
        self.functions
            .single_reader(&pctx.key, &pctx.input, &record.value, &mut output);

        if self.settings.copy_reads_to_tail {
            self.try_copy_read_to_tail(ctx, &pctx, &record);
        }

        ctx.completed.push(CompletedOp {
            serial: pctx.serial,
            status: Status::Ok,
            output,
        });
    }

    /// Promote a disk-read record to the log tail. Abandons (without
    /// retry) if the bucket's chain advanced past the observed entry: a
    /// newer write exists and promotion would shadow it.
    fn try_copy_read_to_tail(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        pctx: &PendingContext,
        record: &DiskRecord,
    ) {
        let Some((slot, entry)) = self.index.find_tag(pctx.hash) else {
            return;
        };
        if entry_address(entry) > entry_address(pctx.entry_word) {
            return;
        }
        let size = record_size(pctx.key.len(), record.value.len());
        let addr = self.block_allocate(ctx, size);
        let info = RecordInfo::new(ctx.version, entry_address(entry), false);
        let rec = unsafe {
            RecordPtr::write_new(
                self.hlog.get_physical(addr),
                info,
                &pctx.key,
                record.value.len(),
            )
        };
        rec.value_mut().copy_from_slice(&record.value);
        if !slot.cas(entry, entry_with_address(entry, addr)) {
            rec.set_invalid();
        }
    }

    fn continue_pending_rmw(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        mut pctx: PendingContext,
        result: std::io::Result<DiskRecord>,
    ) {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(%err, serial = pctx.serial, "pending rmw read failed");
                self.release_held_latch(&pctx);
                ctx.completed.push(CompletedOp {
                    serial: pctx.serial,
                    status: Status::Error,
                    output: Vec::new(),
                });
                return;
            }
        };

        let (slot, entry) = self.index.find_or_create_tag(pctx.hash);
        if entry_address(entry) > entry_address(pctx.entry_word) {
            // A tail record appeared while we were reading; re-run the
            // update against the new chain head.
            self.retry_pending_rmw(ctx, pctx);
            return;
        }

        // Chain-walk on disk for shared-tag chains, as in reads.
        if !record.info.invalid() && record.key != pctx.key {
            let prev = record.info.previous_address();
            if prev.is_valid() && prev >= self.hlog.begin_address() {
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                pctx.logical = prev;
                ctx.io_pending.insert(id, pctx);
                self.hlog.async_get_from_disk(prev, ctx.response_tx.clone(), id);
                return;
            }
        }

        let found = !record.info.invalid() && record.key == pctx.key && !record.info.tombstone();
        let old = found.then_some(record.value.as_slice());
        let key = std::mem::take(&mut pctx.key);
        let input = std::mem::take(&mut pctx.input);
        let status = self.create_record_rmw(ctx, &key, &input, old, slot, entry);
        pctx.key = key;
        pctx.input = input;
        match status {
            OperationStatus::RetryNow => {
                self.retry_now_count.fetch_add(1, Ordering::Relaxed);
                self.retry_pending_rmw(ctx, pctx);
            }
            OperationStatus::Success | OperationStatus::NotFound => {
                self.release_held_latch(&pctx);
                ctx.completed.push(CompletedOp {
                    serial: pctx.serial,
                    status: if status == OperationStatus::Success {
                        Status::Ok
                    } else {
                        Status::NotFound
                    },
                    output: Vec::new(),
                });
            }
            other => unreachable!("create_record_rmw returned {other:?}"),
        }
    }

    /// Re-run a parked RMW against the current phase. Unlike the primary
    /// path, the prepare phase takes no latch here (pended requests defer
    /// to the version boundary), and only an exclusive latch taken within
    /// this path may be released by it.
    fn retry_pending_rmw(self: &Arc<Self>, ctx: &mut ExecutionContext, mut pctx: PendingContext) {
        let (slot, entry) = self.index.find_or_create_tag(pctx.hash);
        let mut logical = entry_address(entry);
        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        let begin = self.hlog.begin_address();
        let mut latest_version = None;
        if logical.is_valid() && logical >= head {
            let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(logical)) };
            latest_version = Some(rec.info().version());
            if rec.info().invalid() || rec.key() != pctx.key {
                logical = self.trace_back_for_key_match(rec.info().previous_address(), &pctx.key, head);
            }
        }

        let mut latch = LatchOp::None;
        let mut divert_create = false;
        match ctx.phase {
            Phase::InProgress => {
                if version_older(latest_version, ctx.version) {
                    // A shared latch held since the original attempt is
                    // itself sufficient protection here.
                    if !pctx.held_shared {
                        if !slot.bucket().try_acquire_exclusive() {
                            ctx.retry_queue.push_back(pctx);
                            return;
                        }
                        latch = LatchOp::Exclusive;
                    }
                    divert_create = true;
                }
            }
            Phase::WaitPending => {
                if version_older(latest_version, ctx.version) {
                    if !pctx.held_shared && !slot.bucket().no_shared_latches() {
                        ctx.retry_queue.push_back(pctx);
                        return;
                    }
                    divert_create = true;
                }
            }
            Phase::WaitFlush => {
                if version_older(latest_version, ctx.version) {
                    divert_create = true;
                }
            }
            // Prepare (and rest): drop straight through to dispatch.
            _ => {}
        }

        pctx.version = ctx.version;
        let key = std::mem::take(&mut pctx.key);
        let input = std::mem::take(&mut pctx.input);
        let serial = pctx.serial;
        let mut pending = None;
        let status = self.rmw_dispatch(
            ctx,
            &key,
            &input,
            serial,
            slot,
            entry,
            logical,
            divert_create,
            (head, read_only, safe_read_only, begin),
            &mut latch,
            &mut pending,
        );

        // Only an exclusive latch taken by this retry may be released
        // here; a shared latch could only be the held one from the
        // original attempt, and that survives until terminal status.
        debug_assert!(latch != LatchOp::Shared);
        if latch == LatchOp::Exclusive {
            slot.bucket().release_exclusive();
        }

        match status {
            OperationStatus::Success | OperationStatus::NotFound => {
                pctx.key = key;
                pctx.input = input;
                self.release_held_latch(&pctx);
                ctx.completed.push(CompletedOp {
                    serial,
                    status: if status == OperationStatus::Success {
                        Status::Ok
                    } else {
                        Status::NotFound
                    },
                    output: Vec::new(),
                });
            }
            OperationStatus::RetryNow => {
                pctx.key = key;
                pctx.input = input;
                ctx.retry_queue.push_back(pctx);
            }
            OperationStatus::RetryLater => {
                let mut again = pending.expect("deferred retry without context");
                again.held_shared = again.held_shared || pctx.held_shared;
                ctx.retry_queue.push_back(again);
            }
            OperationStatus::RecordOnDisk => {
                let mut again = pending.expect("disk pend without context");
                again.held_shared = again.held_shared || pctx.held_shared;
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                let logical = again.logical;
                ctx.io_pending.insert(id, again);
                self.hlog
                    .async_get_from_disk(logical, ctx.response_tx.clone(), id);
            }
            OperationStatus::CprShiftDetected => unreachable!("retry path never probes latches"),
        }
    }

    fn retry_pending_upsert(self: &Arc<Self>, ctx: &mut ExecutionContext, mut pctx: PendingContext) {
        let key = std::mem::take(&mut pctx.key);
        let value = std::mem::take(&mut pctx.value);
        let serial = pctx.serial;
        let mut spins = 0u32;
        loop {
            let status = self.internal_upsert(ctx, &key, &value, serial);
            match status {
                OperationStatus::RetryNow => {
                    spins += 1;
                    if spins > MAX_IMMEDIATE_RETRIES {
                        pctx.key = key;
                        pctx.value = value;
                        pctx.version = ctx.version;
                        ctx.retry_queue.push_back(pctx);
                        return;
                    }
                }
                OperationStatus::RetryLater => {
                    pctx.key = key;
                    pctx.value = value;
                    pctx.version = ctx.version;
                    ctx.retry_queue.push_back(pctx);
                    return;
                }
                OperationStatus::CprShiftDetected => {
                    self.refresh(ctx);
                }
                OperationStatus::Success | OperationStatus::NotFound => {
                    ctx.completed.push(CompletedOp {
                        serial,
                        status: if status == OperationStatus::Success {
                            Status::Ok
                        } else {
                            Status::NotFound
                        },
                        output: Vec::new(),
                    });
                    return;
                }
                OperationStatus::RecordOnDisk => unreachable!("upserts never read from disk"),
            }
        }
    }

    fn retry_pending_read(self: &Arc<Self>, ctx: &mut ExecutionContext, mut pctx: PendingContext) {
        let key = std::mem::take(&mut pctx.key);
        let input = std::mem::take(&mut pctx.input);
        let serial = pctx.serial;
        let mut output = Vec::new();
        let mut pending = None;
        let mut status = self.internal_read(ctx, &key, &input, &mut output, serial, &mut pending);
        if status == OperationStatus::CprShiftDetected {
            self.refresh(ctx);
            pending = None;
            status = self.internal_read(ctx, &key, &input, &mut output, serial, &mut pending);
            debug_assert!(status != OperationStatus::CprShiftDetected);
        }
        match status {
            OperationStatus::Success | OperationStatus::NotFound => {
                ctx.completed.push(CompletedOp {
                    serial,
                    status: if status == OperationStatus::Success {
                        Status::Ok
                    } else {
                        Status::NotFound
                    },
                    output,
                });
            }
            OperationStatus::RecordOnDisk => {
                let again = pending.expect("disk pend without context");
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                let logical = again.logical;
                ctx.io_pending.insert(id, again);
                self.hlog
                    .async_get_from_disk(logical, ctx.response_tx.clone(), id);
            }
            OperationStatus::RetryLater => {
                pctx.key = key;
                pctx.input = input;
                ctx.retry_queue.push_back(pctx);
            }
            other => unreachable!("internal_read returned {other:?}"),
        }
    }
}

impl<F: Functions> Drop for StoreInner<F> {
    fn drop(&mut self) {
        self.hlog.device().close();
    }
}
