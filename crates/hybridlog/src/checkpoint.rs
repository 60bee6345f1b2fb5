//! The CPR checkpoint coordinator: phase bookkeeping, metadata files,
//! and the transitions of the checkpoint cycle.
//!
//! A checkpoint is started by a single CAS out of rest. From there every
//! transition is taken by whichever session is last to finish the
//! current phase's entry actions: sessions mark themselves as they
//! refresh, and the final marker (checked under the coordinator lock,
//! which is never touched by at-rest operations) advances the global
//! state. The wait-flush exit is additionally gated on the allocator
//! having flushed everything below the captured final address, or the
//! snapshot file being written.
//!
//! On-disk layout, under `<checkpoint_dir>/<token>/`, all metadata
//! line-oriented text:
//!
//! ```text
//! index.meta     token, tableSize, numHtBytes, numOfbBytes, numBuckets,
//!                startLogicalAddress, finalLogicalAddress
//! hlog.meta      token, useSnapshotFile, version, flushedLogicalAddress,
//!                startLogicalAddress, finalLogicalAddress, numThreads,
//!                {sessionGuid}*
//! <guid>.session version, sessionGuid, serialNum
//! ht.dat         primary table bucket words
//! ofb.dat        overflow bucket words
//! snapshot.dat   log bytes [flushed, final) when snapshotting
//! ```

use crate::address::Address;
use crate::functions::Functions;
use crate::session::ExecutionContext;
use crate::state::{Phase, SystemState};
use crate::store::StoreInner;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    IndexOnly,
    HybridLogOnly,
    Full,
}

/// Coordinator bookkeeping, guarded by the store's checkpoint mutex.
/// Only touched off the at-rest hot path.
pub(crate) struct CheckpointCtx {
    pub kind: Option<CheckpointKind>,
    pub token: Uuid,
    pub use_snapshot: bool,
    /// The version being made durable (records of this version and below).
    pub version: u32,
    pub index_start: Address,
    pub index_final: Address,
    pub flushed: Address,
    pub final_addr: Address,
    pub snapshot_done: bool,
    pub table_size: u64,
    pub num_ht_bytes: u64,
    pub num_ofb_bytes: u64,
    pub num_ofb_buckets: u64,
    /// Serial numbers captured from each session during prepare.
    pub session_serials: HashMap<Uuid, u64>,
    /// Sessions done with the current phase's entry actions.
    pub phase_marks: HashSet<Uuid>,
    pub live_sessions: HashSet<Uuid>,
    /// Recovered `guid -> serial` map served to `continue_session`.
    pub continue_tokens: HashMap<Uuid, u64>,
}

impl Default for CheckpointCtx {
    fn default() -> Self {
        CheckpointCtx {
            kind: None,
            token: Uuid::nil(),
            use_snapshot: false,
            version: 0,
            index_start: Address::INVALID,
            index_final: Address::INVALID,
            flushed: Address::INVALID,
            final_addr: Address::INVALID,
            snapshot_done: false,
            table_size: 0,
            num_ht_bytes: 0,
            num_ofb_bytes: 0,
            num_ofb_buckets: 0,
            session_serials: HashMap::new(),
            phase_marks: HashSet::new(),
            live_sessions: HashSet::new(),
            continue_tokens: HashMap::new(),
        }
    }
}

impl CheckpointCtx {
    fn reset_for(&mut self, kind: CheckpointKind, token: Uuid, use_snapshot: bool, version: u32) {
        self.kind = Some(kind);
        self.token = token;
        self.use_snapshot = use_snapshot;
        self.version = version;
        self.index_start = Address::INVALID;
        self.index_final = Address::INVALID;
        self.flushed = Address::INVALID;
        self.final_addr = Address::INVALID;
        self.snapshot_done = false;
        self.session_serials.clear();
        self.phase_marks.clear();
    }

    fn all_marked(&self) -> bool {
        self.phase_marks.is_superset(&self.live_sessions)
    }
}

impl<F: Functions> StoreInner<F> {
    pub(crate) fn begin_checkpoint(self: &Arc<Self>, kind: CheckpointKind) -> Result<Uuid> {
        let mut ckpt = self.checkpoint.lock();
        let cur = self.state.load();
        if cur.phase != Phase::Rest || ckpt.kind.is_some() {
            return Err(Error::Busy);
        }
        let token = Uuid::new_v4();
        ckpt.reset_for(kind, token, self.settings.use_snapshot_file, cur.version);
        let first = match kind {
            CheckpointKind::IndexOnly | CheckpointKind::Full => Phase::PrepIndexCheckpoint,
            CheckpointKind::HybridLogOnly => Phase::Prepare,
        };
        if !self
            .state
            .global_move_to_next_state(cur, SystemState::new(first, cur.version))
        {
            ckpt.kind = None;
            return Err(Error::Busy);
        }
        tracing::info!(token = %token, ?kind, version = cur.version, "checkpoint started");
        Ok(token)
    }

    /// A session observed a checkpoint phase during refresh: perform that
    /// phase's entry actions, mark it done, and possibly advance the
    /// global state.
    pub(crate) fn handle_checkpoint_phase(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        global: SystemState,
    ) {
        match global.phase {
            Phase::PrepIndexCheckpoint | Phase::IndexCheckpoint | Phase::PersistenceCallback => {
                ctx.phase = global.phase;
                self.mark_phase(ctx.guid, global);
            }
            Phase::Prepare => {
                // Leaving rest: capture this session's acknowledged serial
                // into the checkpoint before any v+1 record can exist.
                {
                    let mut ckpt = self.checkpoint.lock();
                    if ckpt.kind.is_some() {
                        ckpt.session_serials.insert(ctx.guid, ctx.serial_num);
                    }
                }
                ctx.phase = Phase::Prepare;
                self.mark_phase(ctx.guid, global);
            }
            Phase::InProgress => {
                // The version boundary: this session now creates v+1
                // records and never again updates a v record in place.
                ctx.version = global.version;
                ctx.phase = Phase::InProgress;
                self.mark_phase(ctx.guid, global);
            }
            Phase::WaitPending => {
                if !ctx.has_pending_below(ctx.version) {
                    ctx.phase = Phase::WaitPending;
                    self.mark_phase(ctx.guid, global);
                }
                // Otherwise stay unmarked; complete_pending will drain and
                // a later refresh re-attempts.
            }
            Phase::WaitFlush => {
                ctx.phase = Phase::WaitFlush;
                self.mark_phase(ctx.guid, global);
            }
            _ => unreachable!("not a checkpoint phase: {:?}", global.phase),
        }
    }

    fn mark_phase(self: &Arc<Self>, guid: Uuid, observed: SystemState) {
        let mut ckpt = self.checkpoint.lock();
        // The phase may have moved on since the caller loaded it; stale
        // marks must not leak into the new phase.
        if self.state.load() != observed {
            return;
        }
        ckpt.phase_marks.insert(guid);
        self.maybe_advance(&mut ckpt, observed);
    }

    /// Called when a session deregisters mid-checkpoint, since its
    /// departure may leave everyone else already marked.
    pub(crate) fn maybe_advance_after_departure(self: &Arc<Self>) {
        let global = self.state.load();
        match global.phase {
            Phase::Rest | Phase::Gc | Phase::PrepareGrow | Phase::InProgressGrow => {}
            _ => {
                let mut ckpt = self.checkpoint.lock();
                if self.state.load() == global {
                    self.maybe_advance(&mut ckpt, global);
                }
            }
        }
    }

    fn maybe_advance(self: &Arc<Self>, ckpt: &mut CheckpointCtx, global: SystemState) {
        if !ckpt.all_marked() {
            return;
        }
        let next = match global.phase {
            Phase::PrepIndexCheckpoint => {
                if let Err(err) = self.write_index_checkpoint(ckpt) {
                    tracing::error!(%err, "index checkpoint failed; aborting");
                    ckpt.kind = None;
                    SystemState::new(Phase::Rest, global.version)
                } else {
                    SystemState::new(Phase::IndexCheckpoint, global.version)
                }
            }
            Phase::IndexCheckpoint => match ckpt.kind {
                Some(CheckpointKind::Full) => SystemState::new(Phase::Prepare, global.version),
                _ => {
                    tracing::info!(token = %ckpt.token, "index checkpoint complete");
                    ckpt.kind = None;
                    SystemState::new(Phase::Rest, global.version)
                }
            },
            Phase::Prepare => {
                // Every session has captured its serial; open version v+1.
                // Nothing below flushed_until can be a v+1 record.
                ckpt.flushed = self.hlog.flushed_until_address();
                SystemState::new(Phase::InProgress, global.version.wrapping_add(1))
            }
            Phase::InProgress => SystemState::new(Phase::WaitPending, global.version),
            Phase::WaitPending => {
                ckpt.final_addr = self.hlog.tail_address();
                if ckpt.use_snapshot {
                    match self.write_snapshot(ckpt) {
                        Ok(()) => ckpt.snapshot_done = true,
                        Err(err) => {
                            tracing::error!(%err, "snapshot write failed; aborting checkpoint");
                            ckpt.kind = None;
                            // Records of the old version are already
                            // frozen; all we lose is the durability point.
                            self.state.global_move_to_next_state(
                                global,
                                SystemState::new(Phase::Rest, global.version),
                            );
                            ckpt.phase_marks.clear();
                            return;
                        }
                    }
                } else {
                    self.hlog.shift_read_only_to_tail();
                }
                SystemState::new(Phase::WaitFlush, global.version)
            }
            Phase::WaitFlush => {
                let durable = if ckpt.use_snapshot {
                    ckpt.snapshot_done
                } else {
                    self.hlog.flushed_until_address() >= ckpt.final_addr
                };
                if !durable {
                    return; // re-polled from refresh until the flush lands
                }
                if let Err(err) = self.write_hlog_checkpoint(ckpt) {
                    tracing::error!(%err, "hybrid log metadata write failed; aborting");
                    ckpt.kind = None;
                    SystemState::new(Phase::Rest, global.version)
                } else {
                    SystemState::new(Phase::PersistenceCallback, global.version)
                }
            }
            Phase::PersistenceCallback => {
                tracing::info!(token = %ckpt.token, version = ckpt.version, "checkpoint complete");
                ckpt.kind = None;
                SystemState::new(Phase::Rest, global.version)
            }
            _ => unreachable!("not a checkpoint phase: {:?}", global.phase),
        };
        if self.state.global_move_to_next_state(global, next) {
            ckpt.phase_marks.clear();
            tracing::debug!(from = ?global.phase, to = ?next.phase, version = next.version, "checkpoint phase advanced");
        }
    }

    fn token_dir(&self, token: Uuid) -> PathBuf {
        self.settings.checkpoint_dir.join(token.to_string())
    }

    fn write_index_checkpoint(&self, ckpt: &mut CheckpointCtx) -> Result<()> {
        let dir = self.token_dir(ckpt.token);
        std::fs::create_dir_all(&dir)?;
        ckpt.index_start = self.hlog.begin_address();
        ckpt.index_final = self.hlog.tail_address();

        let mut ht = BufWriter::new(File::create(dir.join("ht.dat"))?);
        ckpt.num_ht_bytes = self.index.serialize_ht(&mut ht)?;
        ht.flush()?;

        let mut ofb = BufWriter::new(File::create(dir.join("ofb.dat"))?);
        ckpt.num_ofb_bytes = self.index.serialize_ofb(&mut ofb)?;
        ofb.flush()?;

        ckpt.table_size = self.index.size();
        ckpt.num_ofb_buckets = self.index.overflow_bucket_count();

        let mut meta = BufWriter::new(File::create(dir.join("index.meta"))?);
        writeln!(meta, "{}", ckpt.token)?;
        writeln!(meta, "{}", ckpt.table_size)?;
        writeln!(meta, "{}", ckpt.num_ht_bytes)?;
        writeln!(meta, "{}", ckpt.num_ofb_bytes)?;
        writeln!(meta, "{}", ckpt.num_ofb_buckets)?;
        writeln!(meta, "{}", ckpt.index_start.raw())?;
        writeln!(meta, "{}", ckpt.index_final.raw())?;
        meta.flush()?;
        tracing::info!(token = %ckpt.token, buckets = ckpt.table_size, "index checkpoint written");
        Ok(())
    }

    /// Write the side file holding `[flushed, final)`. Ranges still at or
    /// above the head are copied from memory; anything the head has
    /// passed since the checkpoint began is necessarily flushed (the head
    /// never overtakes the flush frontier) and is read back from the log
    /// device.
    fn write_snapshot(&self, ckpt: &CheckpointCtx) -> Result<()> {
        let dir = self.token_dir(ckpt.token);
        std::fs::create_dir_all(&dir)?;
        let mut file = BufWriter::new(File::create(dir.join("snapshot.dat"))?);
        let page_bits = self.hlog.page_bits();
        let segment_bits = self.hlog.segment_bits();
        let mut addr = ckpt.flushed;
        while addr < ckpt.final_addr {
            let page_end = Address::new((addr.page(page_bits) + 1) << page_bits);
            let end = page_end.min(ckpt.final_addr);
            let len = (end.raw() - addr.raw()) as usize;
            if addr >= self.hlog.head_address() {
                let slice = unsafe {
                    std::slice::from_raw_parts(self.hlog.get_physical(addr) as *const u8, len)
                };
                file.write_all(slice)?;
            } else {
                let buf = crate::device::read_blocking(
                    self.hlog.device().as_ref(),
                    addr.segment(segment_bits),
                    addr.segment_offset(segment_bits),
                    len as u32,
                )?;
                file.write_all(buf.as_slice())?;
            }
            addr = end;
        }
        file.flush()?;
        tracing::info!(token = %ckpt.token, from = %ckpt.flushed, to = %ckpt.final_addr, "log snapshot written");
        Ok(())
    }

    fn write_hlog_checkpoint(&self, ckpt: &CheckpointCtx) -> Result<()> {
        let dir = self.token_dir(ckpt.token);
        std::fs::create_dir_all(&dir)?;

        let mut meta = BufWriter::new(File::create(dir.join("hlog.meta"))?);
        writeln!(meta, "{}", ckpt.token)?;
        writeln!(meta, "{}", u8::from(ckpt.use_snapshot))?;
        writeln!(meta, "{}", ckpt.version)?;
        writeln!(meta, "{}", ckpt.flushed.raw())?;
        writeln!(meta, "{}", self.hlog.begin_address().raw())?;
        writeln!(meta, "{}", ckpt.final_addr.raw())?;
        writeln!(meta, "{}", ckpt.session_serials.len())?;
        for guid in ckpt.session_serials.keys() {
            writeln!(meta, "{guid}")?;
        }
        meta.flush()?;

        for (guid, serial) in &ckpt.session_serials {
            let mut file = BufWriter::new(File::create(dir.join(format!("{guid}.session")))?);
            writeln!(file, "{}", ckpt.version)?;
            writeln!(file, "{guid}")?;
            writeln!(file, "{serial}")?;
            file.flush()?;
        }
        tracing::info!(
            token = %ckpt.token,
            version = ckpt.version,
            final_addr = %ckpt.final_addr,
            sessions = ckpt.session_serials.len(),
            "hybrid log checkpoint written"
        );
        Ok(())
    }
}
