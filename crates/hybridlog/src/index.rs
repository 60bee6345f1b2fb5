//! The hash index: a power-of-two table of cache-line buckets, each
//! holding seven packed entries plus an overflow word, chained through an
//! append-only overflow pool.
//!
//! An entry word packs:
//!
//! ```text
//! bits  0..48  logical address of the head of this tag's record chain
//! bits 48..62  tag (top 14 bits of the key hash)
//! bit  62      tentative (inserter not yet committed; readers skip)
//! bit  63      reserved
//! ```
//!
//! Distinct keys that share a bucket and a tag share one entry: their
//! records chain through `previous_address` and lookups disambiguate by
//! full key comparison.
//!
//! The overflow word packs the overflow bucket id (48 bits, 1-based into
//! the pool) with the per-bucket latch state: a 15-bit shared count and
//! an exclusive bit. Latches always live on the primary bucket.

use crate::address::Address;
use crate::hlog::HybridLog;
use crate::record::RecordPtr;
use parking_lot::{Mutex, RwLock};
use std::cell::UnsafeCell;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub(crate) const BUCKET_SLOTS: usize = 7;
const OVERFLOW_SLOT: usize = 7;

const ADDRESS_MASK: u64 = (1 << 48) - 1;
const TAG_SHIFT: u32 = 48;
const TAG_BITS: u32 = 14;
const TAG_MASK: u64 = ((1 << TAG_BITS) - 1) << TAG_SHIFT;
const TENTATIVE_BIT: u64 = 1 << 62;

const SHARED_ONE: u64 = 1 << 48;
const SHARED_MASK: u64 = ((1 << 15) - 1) << 48;
const EXCLUSIVE_BIT: u64 = 1 << 63;

const OVERFLOW_CHUNK: u64 = 1024;
const MAX_OVERFLOW_CHUNKS: usize = 4096;

/// Largest chunk count for GC sweeps and grow splits; always a power of
/// two so chunk arithmetic stays shift-and-mask.
const MAX_CHUNKS: u64 = 256;

#[inline]
pub(crate) fn key_hash(key: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(key)
}

#[inline]
pub(crate) fn tag_of(hash: u64) -> u64 {
    hash >> (64 - TAG_BITS)
}

#[inline]
fn entry_word(tag: u64, addr: Address, tentative: bool) -> u64 {
    let mut w = (addr.raw() & ADDRESS_MASK) | (tag << TAG_SHIFT);
    if tentative {
        w |= TENTATIVE_BIT;
    }
    w
}

#[inline]
pub(crate) fn entry_address(word: u64) -> Address {
    Address::new(word & ADDRESS_MASK)
}

#[inline]
fn entry_tag(word: u64) -> u64 {
    (word & TAG_MASK) >> TAG_SHIFT
}

#[inline]
fn entry_tentative(word: u64) -> bool {
    word & TENTATIVE_BIT != 0
}

/// Build the updated entry word that points a slot at a new chain head.
#[inline]
pub(crate) fn entry_with_address(word: u64, addr: Address) -> u64 {
    (word & !ADDRESS_MASK & !TENTATIVE_BIT) | (addr.raw() & ADDRESS_MASK)
}

#[repr(C, align(64))]
pub(crate) struct HashBucket {
    words: [AtomicU64; 8],
}

impl HashBucket {
    fn new() -> HashBucket {
        HashBucket {
            words: Default::default(),
        }
    }

    #[inline]
    fn slot(&self, i: usize) -> &AtomicU64 {
        &self.words[i]
    }

    #[inline]
    fn overflow_word(&self) -> &AtomicU64 {
        &self.words[OVERFLOW_SLOT]
    }

    fn overflow_id(&self) -> u64 {
        self.overflow_word().load(Ordering::Acquire) & ADDRESS_MASK
    }

    // Bucket latches, stored in the overflow word's high bits. Shared
    // excludes only exclusive; exclusive excludes everything.

    pub fn try_acquire_shared(&self) -> bool {
        loop {
            let w = self.overflow_word().load(Ordering::Acquire);
            if w & EXCLUSIVE_BIT != 0 || (w & SHARED_MASK) == SHARED_MASK {
                return false;
            }
            if self
                .overflow_word()
                .compare_exchange_weak(w, w + SHARED_ONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_shared(&self) {
        let prev = self.overflow_word().fetch_sub(SHARED_ONE, Ordering::AcqRel);
        debug_assert!(prev & SHARED_MASK != 0);
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        loop {
            let w = self.overflow_word().load(Ordering::Acquire);
            if w & (EXCLUSIVE_BIT | SHARED_MASK) != 0 {
                return false;
            }
            if self
                .overflow_word()
                .compare_exchange_weak(w, w | EXCLUSIVE_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_exclusive(&self) {
        let prev = self
            .overflow_word()
            .fetch_and(!EXCLUSIVE_BIT, Ordering::AcqRel);
        debug_assert!(prev & EXCLUSIVE_BIT != 0);
    }

    pub fn no_shared_latches(&self) -> bool {
        self.overflow_word().load(Ordering::Acquire) & SHARED_MASK == 0
    }

    /// Install an overflow bucket id, preserving concurrent latch bits.
    /// Returns the id now installed (ours or a racing winner's).
    fn install_overflow(&self, id: u64) -> u64 {
        loop {
            let w = self.overflow_word().load(Ordering::Acquire);
            if w & ADDRESS_MASK != 0 {
                return w & ADDRESS_MASK;
            }
            if self
                .overflow_word()
                .compare_exchange(w, w | id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return id;
            }
        }
    }
}

/// Append-only pool of overflow buckets, id-addressed (1-based).
struct OverflowPool {
    chunk_ptrs: Box<[AtomicPtr<HashBucket>]>,
    chunks: Mutex<Vec<Box<[HashBucket]>>>,
    count: AtomicU64,
}

impl OverflowPool {
    fn new() -> OverflowPool {
        OverflowPool {
            chunk_ptrs: (0..MAX_OVERFLOW_CHUNKS)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            chunks: Mutex::new(Vec::new()),
            count: AtomicU64::new(0),
        }
    }

    fn allocate(&self) -> u64 {
        let id = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        let chunk = ((id - 1) / OVERFLOW_CHUNK) as usize;
        assert!(chunk < MAX_OVERFLOW_CHUNKS, "overflow pool exhausted");
        if self.chunk_ptrs[chunk].load(Ordering::Acquire).is_null() {
            let mut chunks = self.chunks.lock();
            if self.chunk_ptrs[chunk].load(Ordering::Acquire).is_null() {
                let mut storage: Box<[HashBucket]> =
                    (0..OVERFLOW_CHUNK).map(|_| HashBucket::new()).collect();
                self.chunk_ptrs[chunk].store(storage.as_mut_ptr(), Ordering::Release);
                chunks.push(storage);
            }
        }
        id
    }

    fn get(&self, id: u64) -> &HashBucket {
        debug_assert!(id >= 1 && id <= self.count.load(Ordering::Acquire));
        let chunk = ((id - 1) / OVERFLOW_CHUNK) as usize;
        let within = ((id - 1) % OVERFLOW_CHUNK) as usize;
        let base = self.chunk_ptrs[chunk].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { &*base.add(within) }
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

pub(crate) struct InternalHashTable {
    size: u64,
    buckets: Box<[HashBucket]>,
}

impl InternalHashTable {
    fn new(size: u64) -> InternalHashTable {
        InternalHashTable {
            size,
            buckets: (0..size).map(|_| HashBucket::new()).collect(),
        }
    }

    #[inline]
    fn bucket(&self, idx: u64) -> &HashBucket {
        &self.buckets[idx as usize]
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A located index slot: the primary bucket (latch target) plus the slot
/// word itself. Valid while the caller holds epoch protection; the
/// backing generation is only reclaimed after an epoch drain.
#[derive(Clone, Copy)]
pub(crate) struct SlotRef {
    bucket: *const HashBucket,
    slot: *const AtomicU64,
}

unsafe impl Send for SlotRef {}

impl SlotRef {
    #[inline]
    pub fn bucket(&self) -> &HashBucket {
        unsafe { &*self.bucket }
    }

    #[inline]
    pub fn load(&self) -> u64 {
        unsafe { (*self.slot).load(Ordering::Acquire) }
    }

    #[inline]
    pub fn cas(&self, current: u64, new: u64) -> bool {
        unsafe {
            (*self.slot)
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }
    }
}

struct GrowState {
    old_size: u64,
    num_chunks: u64,
    buckets_per_chunk: u64,
    split_status: Box<[AtomicU8]>,
    pending: AtomicU64,
}

struct GcState {
    begin: Address,
    num_chunks: u64,
    buckets_per_chunk: u64,
    status: Box<[AtomicU8]>,
    pending: AtomicU64,
}

pub(crate) struct HashIndex {
    tables: [UnsafeCell<Option<Box<InternalHashTable>>>; 2],
    resize_version: AtomicU32,
    overflow: OverflowPool,
    grow: RwLock<Option<GrowState>>,
    gc: RwLock<Option<GcState>>,
}

unsafe impl Sync for HashIndex {}
unsafe impl Send for HashIndex {}

impl HashIndex {
    pub fn new(size: u64) -> HashIndex {
        HashIndex {
            tables: [
                UnsafeCell::new(Some(Box::new(InternalHashTable::new(size)))),
                UnsafeCell::new(None),
            ],
            resize_version: AtomicU32::new(0),
            overflow: OverflowPool::new(),
            grow: RwLock::new(None),
            gc: RwLock::new(None),
        }
    }

    #[inline]
    fn version(&self) -> usize {
        self.resize_version.load(Ordering::Acquire) as usize
    }

    #[inline]
    fn table(&self, version: usize) -> &InternalHashTable {
        // The active generation is never replaced while any session holds
        // epoch protection over it; the old one is freed via epoch drain.
        unsafe {
            (*self.tables[version].get())
                .as_ref()
                .expect("hash table generation missing")
        }
    }

    pub fn size(&self) -> u64 {
        self.table(self.version()).size()
    }

    /// The primary bucket for `hash`, which is the latch target for its
    /// entries.
    pub fn bucket_latch(&self, hash: u64) -> &HashBucket {
        let table = self.table(self.version());
        table.bucket(hash & (table.size - 1))
    }

    /// Walk the bucket chain for `hash`, returning the first committed
    /// entry whose tag matches.
    pub fn find_tag(&self, hash: u64) -> Option<(SlotRef, u64)> {
        let table = self.table(self.version());
        let tag = tag_of(hash);
        let primary = table.bucket(hash & (table.size - 1));
        let mut bucket = primary;
        loop {
            for i in 0..BUCKET_SLOTS {
                let word = bucket.slot(i).load(Ordering::Acquire);
                if word != 0 && entry_tag(word) == tag && !entry_tentative(word) {
                    return Some((
                        SlotRef {
                            bucket: primary,
                            slot: bucket.slot(i),
                        },
                        word,
                    ));
                }
            }
            match bucket.overflow_id() {
                0 => return None,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    /// Like `find_tag`, but reserves and commits a fresh (invalid-address)
    /// entry when the tag is absent. Publication is two-step: install a
    /// tentative word, scan for a racing duplicate, then commit.
    pub fn find_or_create_tag(&self, hash: u64) -> (SlotRef, u64) {
        let table = self.table(self.version());
        let tag = tag_of(hash);
        let primary_idx = hash & (table.size - 1);
        let primary = table.bucket(primary_idx);

        loop {
            if let Some(found) = self.find_tag(hash) {
                return found;
            }

            let Some(claimed) = self.claim_free_slot(primary, tag) else {
                // Chain is full: extend it and retry the walk.
                let id = self.overflow.allocate();
                self.last_bucket(primary).install_overflow(id);
                continue;
            };

            // Duplicate scan: a racing inserter may have claimed another
            // slot for the same tag. Lower slot pointer wins; the loser
            // retracts and retries.
            if self.duplicate_exists(primary, tag, claimed) {
                unsafe { (*claimed.slot).store(0, Ordering::Release) };
                continue;
            }
            let committed = entry_word(tag, Address::INVALID, false);
            unsafe { (*claimed.slot).store(committed, Ordering::Release) };
            return (claimed, committed);
        }
    }

    fn claim_free_slot(&self, primary: &HashBucket, tag: u64) -> Option<SlotRef> {
        let tentative = entry_word(tag, Address::INVALID, true);
        let mut bucket = primary;
        loop {
            for i in 0..BUCKET_SLOTS {
                if bucket
                    .slot(i)
                    .compare_exchange(0, tentative, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(SlotRef {
                        bucket: primary,
                        slot: bucket.slot(i),
                    });
                }
            }
            match bucket.overflow_id() {
                0 => return None,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    fn duplicate_exists(&self, primary: &HashBucket, tag: u64, ours: SlotRef) -> bool {
        let mut bucket = primary;
        loop {
            for i in 0..BUCKET_SLOTS {
                let slot = bucket.slot(i) as *const AtomicU64;
                if std::ptr::eq(slot, ours.slot) {
                    continue;
                }
                let word = bucket.slot(i).load(Ordering::Acquire);
                if word == 0 || entry_tag(word) != tag {
                    continue;
                }
                // A committed duplicate always wins; between two
                // tentatives, the lower slot address does.
                if !entry_tentative(word) || (slot as usize) < (ours.slot as usize) {
                    return true;
                }
            }
            match bucket.overflow_id() {
                0 => return false,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    fn last_bucket<'t>(&'t self, primary: &'t HashBucket) -> &'t HashBucket {
        let mut bucket = primary;
        loop {
            match bucket.overflow_id() {
                0 => return bucket,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    pub fn entry_count(&self) -> u64 {
        let table = self.table(self.version());
        let mut count = 0;
        for idx in 0..table.size {
            let mut bucket = table.bucket(idx);
            loop {
                for i in 0..BUCKET_SLOTS {
                    let word = bucket.slot(i).load(Ordering::Acquire);
                    if word != 0 && !entry_tentative(word) && entry_address(word).is_valid() {
                        count += 1;
                    }
                }
                match bucket.overflow_id() {
                    0 => break,
                    id => bucket = self.overflow.get(id),
                }
            }
        }
        count
    }

    // ---- GC: chunked sweep of entries below the begin address ----

    pub fn start_gc(&self, begin: Address) {
        let size = self.size();
        let num_chunks = size.min(MAX_CHUNKS);
        *self.gc.write() = Some(GcState {
            begin,
            num_chunks,
            buckets_per_chunk: size / num_chunks,
            status: (0..num_chunks).map(|_| AtomicU8::new(0)).collect(),
            pending: AtomicU64::new(num_chunks),
        });
    }

    /// Claim and sweep outstanding GC chunks. Returns true when the whole
    /// sweep is complete (the caller then leaves the GC phase).
    pub fn gc_help(&self) -> bool {
        let guard = self.gc.read();
        let Some(gc) = guard.as_ref() else {
            return true;
        };
        for chunk in 0..gc.num_chunks {
            let status = &gc.status[chunk as usize];
            if status
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let table = self.table(self.version());
            let from = chunk * gc.buckets_per_chunk;
            for idx in from..from + gc.buckets_per_chunk {
                self.sweep_bucket(table.bucket(idx), gc.begin);
            }
            status.store(2, Ordering::Release);
            if gc.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                tracing::debug!(begin = %gc.begin, "index GC sweep complete");
                drop(guard);
                *self.gc.write() = None;
                return true;
            }
        }
        gc.pending.load(Ordering::Acquire) == 0
    }

    fn sweep_bucket(&self, primary: &HashBucket, begin: Address) {
        let mut bucket = primary;
        loop {
            for i in 0..BUCKET_SLOTS {
                loop {
                    let word = bucket.slot(i).load(Ordering::Acquire);
                    let addr = entry_address(word);
                    if word == 0 || !addr.is_valid() || addr >= begin {
                        break;
                    }
                    if bucket
                        .slot(i)
                        .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
            match bucket.overflow_id() {
                0 => return,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    // ---- Grow: online doubling split ----

    /// Allocate the next generation at double size. The version flip (and
    /// with it, all lookups moving over) happens in `flip_version` when
    /// the coordinator enters the in-progress-grow phase.
    pub fn start_grow(&self) {
        let old = self.table(self.version());
        let old_size = old.size;
        let next = 1 - self.version();
        unsafe {
            *self.tables[next].get() = Some(Box::new(InternalHashTable::new(old_size * 2)));
        }
        let num_chunks = old_size.min(MAX_CHUNKS);
        *self.grow.write() = Some(GrowState {
            old_size,
            num_chunks,
            buckets_per_chunk: old_size / num_chunks,
            split_status: (0..num_chunks).map(|_| AtomicU8::new(0)).collect(),
            pending: AtomicU64::new(num_chunks),
        });
    }

    pub fn flip_version(&self) {
        self.resize_version
            .store(1 - self.version() as u32, Ordering::Release);
    }

    /// Make sure the chunk covering `hash`'s old bucket has been split,
    /// splitting it ourselves if it is unclaimed, and spinning briefly if
    /// another thread holds it.
    pub fn split_for_hash(&self, hash: u64, log: &HybridLog) {
        let guard = self.grow.read();
        let Some(grow) = guard.as_ref() else { return };
        let chunk = (hash & (grow.old_size - 1)) / grow.buckets_per_chunk;
        self.split_chunk(grow, chunk, log);
        while grow.split_status[chunk as usize].load(Ordering::Acquire) != 2 {
            std::hint::spin_loop();
        }
    }

    /// Claim and split outstanding chunks. Returns true once every chunk
    /// is done; exactly one caller observes the count hit zero and
    /// finishes the grow.
    pub fn grow_help(&self, log: &HybridLog) -> bool {
        let guard = self.grow.read();
        let Some(grow) = guard.as_ref() else {
            return true;
        };
        for chunk in 0..grow.num_chunks {
            self.split_chunk(grow, chunk, log);
        }
        grow.pending.load(Ordering::Acquire) == 0
    }

    fn split_chunk(&self, grow: &GrowState, chunk: u64, log: &HybridLog) {
        if grow.split_status[chunk as usize]
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Lookups already target the new generation; the old one is only
        // read by splitters, so plain loads suffice there.
        let old = self.table(1 - self.version());
        let new = self.table(self.version());
        let from = chunk * grow.buckets_per_chunk;
        for idx in from..from + grow.buckets_per_chunk {
            self.split_bucket(old, new, idx, grow.old_size, log);
        }
        grow.split_status[chunk as usize].store(2, Ordering::Release);
        if grow.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::info!(new_size = new.size, "index split complete");
        }
    }

    pub fn grow_pending(&self) -> bool {
        self.grow
            .read()
            .as_ref()
            .map(|g| g.pending.load(Ordering::Acquire) > 0)
            .unwrap_or(false)
    }

    /// Release the old generation. Called after the epoch drains past the
    /// final split, so no walker can still hold pointers into it.
    pub fn finish_grow(&self) {
        let old = 1 - self.version();
        unsafe {
            *self.tables[old].get() = None;
        }
        *self.grow.write() = None;
    }

    fn split_bucket(
        &self,
        old: &InternalHashTable,
        new: &InternalHashTable,
        old_idx: u64,
        old_size: u64,
        log: &HybridLog,
    ) {
        let head = log.head_address();
        let mut bucket = old.bucket(old_idx);
        loop {
            for i in 0..BUCKET_SLOTS {
                let word = bucket.slot(i).load(Ordering::Acquire);
                if word == 0 || entry_tentative(word) {
                    continue;
                }
                let tag = entry_tag(word);
                let addr = entry_address(word);
                if !addr.is_valid() {
                    continue;
                }
                let left = old_idx;
                let right = old_idx + old_size;

                if addr >= head {
                    let rec = unsafe { RecordPtr::from_raw(log.get_physical(addr)) };
                    let hash = key_hash(rec.key());
                    let goes_right = hash & old_size != 0;
                    let (mine, other_side) = if goes_right { (right, left) } else { (left, right) };
                    self.insert_split_entry(new, mine, tag, addr);
                    let other = trace_back_for_other_chain_start(addr, old_size, goes_right, head, log);
                    if other.is_valid() {
                        self.insert_split_entry(new, other_side, tag, other);
                    }
                } else {
                    // Head of chain is on disk: duplicate to both sides and
                    // let a later fault separate them lazily.
                    self.insert_split_entry(new, left, tag, addr);
                    self.insert_split_entry(new, right, tag, addr);
                }
            }
            match bucket.overflow_id() {
                0 => return,
                id => bucket = self.overflow.get(id),
            }
        }
    }

    fn insert_split_entry(&self, table: &InternalHashTable, idx: u64, tag: u64, addr: Address) {
        let word = entry_word(tag, addr, false);
        let primary = table.bucket(idx);
        let mut bucket = primary;
        loop {
            for i in 0..BUCKET_SLOTS {
                if bucket
                    .slot(i)
                    .compare_exchange(0, word, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            }
            match bucket.overflow_id() {
                0 => {
                    let id = self.overflow.allocate();
                    bucket = self.overflow.get(self.last_bucket(primary).install_overflow(id));
                }
                id => bucket = self.overflow.get(id),
            }
        }
    }

    // ---- Checkpoint serialization ----

    /// Write the active generation's bucket words; latch and tentative
    /// bits are stripped so a recovered index starts quiescent.
    pub fn serialize_ht(&self, w: &mut impl Write) -> std::io::Result<u64> {
        let table = self.table(self.version());
        let mut bytes = 0u64;
        for idx in 0..table.size {
            let bucket = table.bucket(idx);
            for i in 0..8 {
                let mut word = bucket.slot(i).load(Ordering::Acquire);
                word &= if i == OVERFLOW_SLOT {
                    ADDRESS_MASK
                } else {
                    !TENTATIVE_BIT
                };
                w.write_all(&word.to_le_bytes())?;
                bytes += 8;
            }
        }
        Ok(bytes)
    }

    pub fn serialize_ofb(&self, w: &mut impl Write) -> std::io::Result<u64> {
        let count = self.overflow.count();
        let mut bytes = 0u64;
        for id in 1..=count {
            let bucket = self.overflow.get(id);
            for i in 0..8 {
                let mut word = bucket.slot(i).load(Ordering::Acquire);
                word &= if i == OVERFLOW_SLOT {
                    ADDRESS_MASK
                } else {
                    !TENTATIVE_BIT
                };
                w.write_all(&word.to_le_bytes())?;
                bytes += 8;
            }
        }
        Ok(bytes)
    }

    /// Rebuild the index from checkpoint files. Single-threaded; replaces
    /// generation zero wholesale.
    pub fn load(&self, size: u64, ht: &mut impl Read, ofb_buckets: u64, ofb: &mut impl Read) -> std::io::Result<()> {
        let table = InternalHashTable::new(size);
        let mut word = [0u8; 8];
        for idx in 0..size {
            for i in 0..8 {
                ht.read_exact(&mut word)?;
                table
                    .bucket(idx)
                    .slot(i)
                    .store(u64::from_le_bytes(word), Ordering::Release);
            }
        }
        for _ in 0..ofb_buckets {
            let id = self.overflow.allocate();
            let bucket = self.overflow.get(id);
            for i in 0..8 {
                ofb.read_exact(&mut word)?;
                bucket.slot(i).store(u64::from_le_bytes(word), Ordering::Release);
            }
        }
        unsafe {
            *self.tables[0].get() = Some(Box::new(table));
            *self.tables[1].get() = None;
        }
        self.resize_version.store(0, Ordering::Release);
        Ok(())
    }

    pub fn overflow_bucket_count(&self) -> u64 {
        self.overflow.count()
    }
}

/// Walk a record chain from `start`'s predecessor looking for the first
/// record that hashes to the other side of the split. Returns the first
/// such address, the first address below `head` (which cannot be
/// disambiguated and is duplicated instead), or INVALID at chain end.
fn trace_back_for_other_chain_start(
    start: Address,
    old_size: u64,
    my_side_right: bool,
    head: Address,
    log: &HybridLog,
) -> Address {
    let mut cur = {
        let rec = unsafe { RecordPtr::from_raw(log.get_physical(start)) };
        rec.info().previous_address()
    };
    while cur >= head && cur.is_valid() {
        let rec = unsafe { RecordPtr::from_raw(log.get_physical(cur)) };
        let goes_right = key_hash(rec.key()) & old_size != 0;
        if goes_right != my_side_right {
            return cur;
        }
        cur = rec.info().previous_address();
    }
    cur
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_word_packing() {
        let word = entry_word(0x2abc, Address::new(0x1234_5678_9abc), true);
        assert_eq!(entry_tag(word), 0x2abc);
        assert_eq!(entry_address(word), Address::new(0x1234_5678_9abc));
        assert!(entry_tentative(word));

        let updated = entry_with_address(word, Address::new(64));
        assert_eq!(entry_address(updated), Address::new(64));
        assert_eq!(entry_tag(updated), 0x2abc);
        assert!(!entry_tentative(updated));
    }

    #[test]
    fn find_or_create_is_idempotent_per_tag() {
        let index = HashIndex::new(64);
        let hash = key_hash(b"some-key");
        let (slot, word) = index.find_or_create_tag(hash);
        assert_eq!(entry_address(word), Address::INVALID);

        // Committing an address makes it visible to find_tag.
        assert!(slot.cas(word, entry_with_address(word, Address::new(128))));
        let (_, found) = index.find_tag(hash).unwrap();
        assert_eq!(entry_address(found), Address::new(128));

        // A second find_or_create returns the same entry.
        let (_, again) = index.find_or_create_tag(hash);
        assert_eq!(again, found);
        assert_eq!(index.entry_count(), 1);
    }

    #[test]
    fn chains_extend_into_overflow() {
        let index = HashIndex::new(1);
        // One bucket: more distinct tags than inline slots forces chaining.
        let mut created = 0;
        for i in 0..64u64 {
            let hash = key_hash(&i.to_le_bytes());
            let (slot, word) = index.find_or_create_tag(hash);
            if entry_address(word) == Address::INVALID {
                assert!(slot.cas(word, entry_with_address(word, Address::new(64 + i * 8))));
                created += 1;
            }
        }
        assert!(created > BUCKET_SLOTS as u64);
        assert!(index.overflow_bucket_count() > 0);
        for i in 0..64u64 {
            let hash = key_hash(&i.to_le_bytes());
            assert!(index.find_tag(hash).is_some());
        }
    }

    #[test]
    fn shared_and_exclusive_latches_exclude_correctly() {
        let bucket = HashBucket::new();
        assert!(bucket.try_acquire_shared());
        assert!(bucket.try_acquire_shared());
        assert!(!bucket.try_acquire_exclusive());
        assert!(!bucket.no_shared_latches());

        bucket.release_shared();
        bucket.release_shared();
        assert!(bucket.no_shared_latches());

        assert!(bucket.try_acquire_exclusive());
        assert!(!bucket.try_acquire_shared());
        assert!(!bucket.try_acquire_exclusive());
        bucket.release_exclusive();
        assert!(bucket.try_acquire_shared());
        bucket.release_shared();
    }

    #[test]
    fn gc_sweeps_stale_entries() {
        let index = HashIndex::new(16);
        let keep = key_hash(b"keep");
        let drop_ = key_hash(b"drop");
        let (s1, w1) = index.find_or_create_tag(keep);
        s1.cas(w1, entry_with_address(w1, Address::new(8192)));
        let (s2, w2) = index.find_or_create_tag(drop_);
        s2.cas(w2, entry_with_address(w2, Address::new(128)));

        index.start_gc(Address::new(4096));
        assert!(index.gc_help());
        assert!(index.find_tag(keep).is_some());
        assert!(index.find_tag(drop_).is_none());
        assert_eq!(index.entry_count(), 1);
    }
}
