//! The hybrid log allocator.
//!
//! The log's address space is partitioned by five watermarks
//! (`begin <= head <= safe_read_only <= read_only <= tail`, each
//! monotone). Addresses at or above `head` are resident in a circular
//! buffer of page frames; below `head` they live only on the device.
//! Records in `[read_only, tail)` may be mutated in place; the fuzzy
//! window `[safe_read_only, read_only)` is being frozen and must be
//! treated as read-only by updaters while racing in-place writes drain.
//!
//! Page lifecycle: when the tail crosses into a new page the read-only
//! watermark is shifted to keep the configured mutable lag, an epoch bump
//! promotes `safe_read_only` once every session has observed the shift,
//! frozen pages are flushed, flush completion advances `flushed_until`,
//! and the head then rises over flushed pages whose frames are needed
//! for reuse, with eviction gated on one more epoch drain.

use crate::address::{Address, AtomicAddress, PageOffset};
use crate::device::{AlignedBuf, Device};
use crate::record::DiskRecord;
use crate::Settings;
use crossbeam_channel::Sender;
use epoch::LightEpoch;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of a single allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocation {
    Done(Address),
    /// The tail page rolled; re-attempt immediately.
    Retry,
    /// The next page's frame is still flushing/evicting. Back off, then
    /// re-attempt; the reported address is the blocked page's base.
    Pending(Address),
    /// The request exceeds a page; never allocatable.
    TooLarge,
}

/// Completion of a pending device read, posted to the issuing session's
/// response channel.
pub(crate) struct IoResponse {
    pub id: u64,
    pub result: io::Result<DiskRecord>,
}

struct Frame {
    data: UnsafeCell<Box<[u8]>>,
}

// Frames are raced on deliberately: the allocator hands out disjoint
// byte ranges, and cross-thread visibility of record contents is ordered
// by the record header's release store and the index entry CAS.
unsafe impl Sync for Frame {}

#[derive(Default)]
struct FlushState {
    /// Flush issued for everything below this address.
    issued_until: u64,
    /// Completed flush ranges, keyed by start, awaiting contiguity.
    completed: BTreeMap<u64, u64>,
}

pub(crate) struct HybridLog {
    page_bits: u32,
    page_size: u64,
    num_pages: u64,
    segment_bits: u32,
    sector_size: u64,
    /// Pages the read-only watermark lags behind the tail.
    mutable_lag_pages: u64,

    device: Arc<dyn Device>,
    epoch: Arc<LightEpoch>,

    frames: Box<[Frame]>,
    tail: PageOffset,
    begin: AtomicAddress,
    head: AtomicAddress,
    safe_read_only: AtomicAddress,
    read_only: AtomicAddress,
    flushed_until: AtomicAddress,
    /// Frames wholly below this address may be reused for new pages.
    evicted_until: AtomicAddress,

    flush: Mutex<FlushState>,
    roll: Mutex<()>,
    io_failed: AtomicBool,
}

impl HybridLog {
    pub fn new(settings: &Settings, device: Arc<dyn Device>, epoch: Arc<LightEpoch>) -> HybridLog {
        let page_size = settings.page_size();
        let num_pages = settings.buffer_pages() as u64;
        let mutable_lag_pages = ((num_pages as f64 * settings.mutable_fraction) as u64)
            .clamp(1, num_pages - 1);
        let frames = (0..num_pages)
            .map(|_| Frame {
                data: UnsafeCell::new(vec![0u8; page_size as usize].into_boxed_slice()),
            })
            .collect();
        let first = Address::FIRST_VALID;
        let sector_size = device.sector_size() as u64;

        HybridLog {
            page_bits: settings.page_size_bits,
            page_size,
            num_pages,
            segment_bits: settings.segment_size_bits,
            sector_size,
            mutable_lag_pages,
            device,
            epoch,
            frames,
            tail: PageOffset::new(0, first.raw()),
            begin: AtomicAddress::new(first),
            head: AtomicAddress::new(first),
            safe_read_only: AtomicAddress::new(first),
            read_only: AtomicAddress::new(first),
            flushed_until: AtomicAddress::new(first),
            evicted_until: AtomicAddress::new(Address::INVALID),
            flush: Mutex::new(FlushState {
                issued_until: first.raw(),
                completed: BTreeMap::new(),
            }),
            roll: Mutex::new(()),
            io_failed: AtomicBool::new(false),
        }
    }

    pub fn begin_address(&self) -> Address {
        self.begin.load()
    }

    pub fn head_address(&self) -> Address {
        self.head.load()
    }

    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only.load()
    }

    pub fn read_only_address(&self) -> Address {
        self.read_only.load()
    }

    pub fn tail_address(&self) -> Address {
        self.tail.tail_address(self.page_bits)
    }

    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until.load()
    }

    pub fn io_failed(&self) -> bool {
        self.io_failed.load(Ordering::Acquire)
    }

    /// Raw pointer to the record at `addr`. Valid only while
    /// `addr >= head` and the caller holds epoch protection.
    #[inline]
    pub fn get_physical(&self, addr: Address) -> *mut u8 {
        let frame = &self.frames[(addr.page(self.page_bits) % self.num_pages) as usize];
        unsafe { (*frame.data.get()).as_mut_ptr().add(addr.offset(self.page_bits) as usize) }
    }

    /// One allocation attempt; see [`Allocation`] for the outcomes.
    pub fn allocate(self: &Arc<Self>, size: u64) -> Allocation {
        debug_assert!(size % 8 == 0);
        if size > self.page_size {
            return Allocation::TooLarge;
        }
        let (page, offset) = self.tail.fetch_add_offset(size);
        if offset + size <= self.page_size {
            return Allocation::Done(Address::new((page << self.page_bits) + offset));
        }

        // The page is full. Exactly one claimant crosses the boundary and
        // owns the fill-side maintenance; everyone waits on the roll.
        if offset <= self.page_size {
            self.on_page_filled(page);
        }
        let next_base = Address::new((page + 1) << self.page_bits);
        if self.frame_ready(page + 1) {
            self.try_resolve_roll(page);
            Allocation::Retry
        } else {
            // Nudge the pipeline along; the frame frees once its old
            // occupant is flushed and the head rises past it.
            self.try_shift_head();
            Allocation::Pending(next_base)
        }
    }

    /// Is the frame for `page` free for that page to move in?
    fn frame_ready(&self, page: u64) -> bool {
        if page < self.num_pages {
            return true;
        }
        let prior_end = (page - self.num_pages + 1) << self.page_bits;
        self.evicted_until.load().raw() >= prior_end
    }

    /// Complete a pending page roll if the next frame has freed up.
    fn try_resolve_roll(&self, filled_page: u64) {
        let _guard = self.roll.lock();
        loop {
            let cur = self.tail.load();
            if cur.0 != filled_page || cur.1 <= self.page_size {
                return; // someone else already rolled
            }
            if !self.frame_ready(filled_page + 1) {
                return;
            }
            self.zero_frame(filled_page + 1);
            if self.tail.try_move(cur, filled_page + 1, 0) {
                tracing::trace!(page = filled_page + 1, "rolled to new tail page");
                return;
            }
        }
    }

    fn zero_frame(&self, page: u64) {
        let frame = &self.frames[(page % self.num_pages) as usize];
        unsafe {
            let data = &mut *frame.data.get();
            data.fill(0);
        }
    }

    /// Fill-side maintenance, run once per filled page: shift the
    /// read-only watermark to preserve the mutable lag, and let the head
    /// rise over flushed pages.
    fn on_page_filled(self: &Arc<Self>, filled_page: u64) {
        let tail_page = filled_page + 1;
        if tail_page > self.mutable_lag_pages {
            let target = Address::new((tail_page - self.mutable_lag_pages) << self.page_bits);
            self.shift_read_only(target);
        }
        self.try_shift_head();
    }

    /// Publish a new read-only watermark. After the epoch drains (every
    /// session has observed the shift and can no longer start an in-place
    /// write below it), promote `safe_read_only` and flush the frozen
    /// range.
    pub fn shift_read_only(self: &Arc<Self>, target: Address) {
        if !self.read_only.advance_to(target) {
            return;
        }
        tracing::debug!(%target, "shifted read-only address");
        let log = Arc::clone(self);
        self.epoch.bump(Box::new(move || {
            log.safe_read_only.advance_to(target);
            tracing::debug!(%target, "promoted safe-read-only address");
            log.flush_until(target);
        }));
    }

    /// Advance the head as far as flushing allows and the buffer needs,
    /// evicting frames once the epoch drains.
    fn try_shift_head(self: &Arc<Self>) {
        let (tail_page, _) = self.tail.load();
        // Keep every frame between head and tail distinct; the +2 leaves
        // the incoming page's frame free to zero.
        if tail_page + 2 < self.num_pages {
            return;
        }
        let desired = (tail_page + 2 - self.num_pages) << self.page_bits;
        let flushed = self.flushed_until.load().page_start(self.page_bits).raw();
        let target = Address::new(desired.min(flushed));
        if !self.head.advance_to(target) {
            return;
        }
        tracing::debug!(%target, "shifted head address");
        let log = Arc::clone(self);
        self.epoch.bump(Box::new(move || {
            if log.evicted_until.advance_to(target) {
                tracing::debug!(%target, "evicted pages below head");
            }
        }));
    }

    /// Issue device writes for all unflushed bytes below `target`.
    fn flush_until(self: &Arc<Self>, target: Address) {
        // Claim ranges under the lock, issue outside it: a device may run
        // the completion inline, and that path re-locks flush state.
        let mut ranges = Vec::new();
        {
            let mut state = self.flush.lock();
            while state.issued_until < target.raw() {
                let from = state.issued_until;
                let page_end = (Address::new(from).page(self.page_bits) + 1) << self.page_bits;
                let to = target.raw().min(page_end);
                state.issued_until = to;
                ranges.push((from, to));
            }
        }
        for (from, to) in ranges {
            self.issue_flush(from, to);
        }
    }

    fn issue_flush(self: &Arc<Self>, from: u64, to: u64) {
        // Sector-align the device range; the copy pulls the aligned span
        // straight from the frame, so padding bytes hold real log data.
        let aligned_from = from & !(self.sector_size - 1);
        let aligned_to = (to + self.sector_size - 1) & !(self.sector_size - 1);
        let len = (aligned_to - aligned_from) as usize;

        let mut buf = AlignedBuf::zeroed(len, self.sector_size as usize);
        unsafe {
            let src = self.get_physical(Address::new(aligned_from));
            std::ptr::copy_nonoverlapping(src, buf.as_mut_slice().as_mut_ptr(), len);
        }

        let segment = Address::new(aligned_from).segment(self.segment_bits);
        let offset = Address::new(aligned_from).segment_offset(self.segment_bits);
        let log = Arc::clone(self);
        tracing::debug!(from, to, segment, "flushing log range");
        self.device.write(
            buf,
            segment,
            offset,
            Box::new(move |result| match result {
                Ok(()) => log.complete_flush(from, to),
                Err(err) => {
                    tracing::error!(from, to, %err, "log flush failed");
                    log.io_failed.store(true, Ordering::Release);
                }
            }),
        );
    }

    fn complete_flush(self: &Arc<Self>, from: u64, to: u64) {
        {
            let mut state = self.flush.lock();
            state.completed.insert(from, to);
            let mut frontier = self.flushed_until.load().raw();
            while let Some(end) = state.completed.remove(&frontier) {
                frontier = end;
            }
            self.flushed_until.advance_to(Address::new(frontier));
        }
        tracing::debug!(flushed = %self.flushed_until.load(), "flush completed");
        self.try_shift_head();
    }

    /// Fold-over support: freeze and flush everything up to the current
    /// tail. Returns the tail captured at the shift.
    pub fn shift_read_only_to_tail(self: &Arc<Self>) -> Address {
        let tail = self.tail_address();
        self.shift_read_only(tail);
        tail
    }

    /// Publish a new begin address; device segments wholly below it are
    /// deleted once no session can still be reading them.
    pub fn shift_begin(self: &Arc<Self>, target: Address) {
        let old = self.begin.load();
        if !self.begin.advance_to(target) {
            return;
        }
        tracing::info!(%old, new = %target, "shifted begin address");
        let log = Arc::clone(self);
        self.epoch.bump(Box::new(move || {
            let from = old.segment(log.segment_bits);
            let to = target.segment(log.segment_bits);
            if from < to {
                log.device.delete_segment_range(from, to);
            }
        }));
    }

    /// Schedule an asynchronous read of the record at `addr`. The first
    /// read guesses a small length; if the record turns out longer, the
    /// completion reissues with the exact size.
    pub fn async_get_from_disk(self: &Arc<Self>, addr: Address, tx: Sender<IoResponse>, id: u64) {
        self.issue_disk_read(addr, 128, tx, id);
    }

    fn issue_disk_read(self: &Arc<Self>, addr: Address, guess: u64, tx: Sender<IoResponse>, id: u64) {
        let segment = addr.segment(self.segment_bits);
        let offset = addr.segment_offset(self.segment_bits);
        let aligned_offset = offset & !(self.sector_size - 1);
        let skew = (offset - aligned_offset) as usize;
        let len = (skew as u64 + guess + self.sector_size - 1) & !(self.sector_size - 1);

        let log = Arc::clone(self);
        self.device.read(
            segment,
            aligned_offset,
            len as u32,
            Box::new(move |result| match result {
                Err(err) => {
                    let _ = tx.send(IoResponse { id, result: Err(err) });
                }
                Ok(buf) => {
                    let bytes = &buf.as_slice()[skew..];
                    if let Some(record) = DiskRecord::parse(bytes) {
                        let _ = tx.send(IoResponse {
                            id,
                            result: Ok(record),
                        });
                    } else if let Some(need) = DiskRecord::required_len(bytes) {
                        // Record is longer than the guess; fetch it whole.
                        log.issue_disk_read(addr, need, tx, id);
                    } else {
                        let _ = tx.send(IoResponse {
                            id,
                            result: Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "record header truncated by device",
                            )),
                        });
                    }
                }
            }),
        );
    }

    // Recovery-side accessors: single-threaded, before any session exists.

    pub fn frame_mut(&self, page: u64) -> &mut [u8] {
        let frame = &self.frames[(page % self.num_pages) as usize];
        unsafe { &mut *frame.data.get() }
    }

    pub fn page_bits(&self) -> u32 {
        self.page_bits
    }

    pub fn num_buffer_pages(&self) -> u64 {
        self.num_pages
    }

    pub fn segment_bits(&self) -> u32 {
        self.segment_bits
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Reset every watermark after recovery. `tail` resumes allocation;
    /// everything at or below it is treated as immutable.
    pub fn recovery_reset(&self, begin: Address, head: Address, flushed: Address, tail: Address) {
        self.begin.reset(begin);
        self.head.reset(head);
        self.safe_read_only.reset(tail);
        self.read_only.reset(tail);
        self.flushed_until.reset(flushed);
        self.evicted_until
            .reset(head.page_start(self.page_bits));
        self.flush.lock().issued_until = flushed.raw();
        self.tail
            .reset(tail.page(self.page_bits), tail.offset(self.page_bits));
    }
}

impl std::fmt::Debug for HybridLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridLog")
            .field("begin", &self.begin.load())
            .field("head", &self.head.load())
            .field("safe_read_only", &self.safe_read_only.load())
            .field("read_only", &self.read_only.load())
            .field("flushed_until", &self.flushed_until.load())
            .field("tail", &self.tail_address())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::NullDevice;

    fn test_log() -> Arc<HybridLog> {
        let settings = Settings {
            page_size_bits: 12,
            memory_size_bits: 14, // 4 pages
            segment_size_bits: 20,
            ..Settings::default()
        };
        Arc::new(HybridLog::new(
            &settings,
            Arc::new(NullDevice),
            Arc::new(LightEpoch::new()),
        ))
    }

    #[test]
    fn allocations_are_monotone_and_aligned() {
        let log = test_log();
        let mut last = Address::INVALID;
        for _ in 0..64 {
            match log.allocate(48) {
                Allocation::Done(addr) => {
                    assert!(addr > last);
                    assert_eq!(addr.raw() % 8, 0);
                    last = addr;
                }
                other => panic!("unexpected allocation outcome {other:?}"),
            }
        }
        assert_eq!(log.tail_address(), last.add(48));
    }

    #[test]
    fn page_roll_preserves_watermark_order() {
        let log = test_log();
        let slot = log.epoch.acquire();
        // Fill several pages; watermarks must stay ordered throughout.
        let mut done = 0;
        while done < 200 {
            log.epoch.protect(slot);
            match log.allocate(256) {
                Allocation::Done(_) => done += 1,
                Allocation::Retry => {}
                Allocation::Pending(_) => {
                    log.epoch.protect(slot);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Allocation::TooLarge => unreachable!(),
            }
            let begin = log.begin_address();
            let head = log.head_address();
            let safe = log.safe_read_only_address();
            let ro = log.read_only_address();
            let tail = log.tail_address();
            assert!(begin <= head && head <= safe && safe <= ro && ro <= tail);
        }
        log.epoch.release(slot);
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let log = test_log();
        assert_eq!(log.allocate(1 << 13), Allocation::TooLarge);
    }
}
