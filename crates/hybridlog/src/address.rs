//! Logical addresses over the hybrid log, and the atomic watermarks that
//! partition the address space.
//!
//! A logical address is a 48-bit byte offset into the log's address
//! space, assigned strictly monotonically by the allocator. The low
//! `page_size_bits` select a byte within a page; the remaining high bits
//! are the page number. The device views the same space through coarser
//! `segment_size_bits`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of significant bits in a logical address. The two index entry
/// words and the record header reserve the rest.
pub const ADDRESS_BITS: u32 = 48;

pub const MAX_ADDRESS: u64 = (1 << ADDRESS_BITS) - 1;

/// A 48-bit logical address into the hybrid log.
///
/// `Address::INVALID` (zero) terminates record chains; the first real
/// address handed out by the allocator is `64` (one record-alignment unit
/// past zero) so no live record ever sits at the invalid address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    pub const INVALID: Address = Address(0);

    /// First allocatable address, kept clear of `INVALID`.
    pub const FIRST_VALID: Address = Address(64);

    #[inline]
    pub fn new(raw: u64) -> Address {
        debug_assert!(raw <= MAX_ADDRESS);
        Address(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub fn page(self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    #[inline]
    pub fn offset(self, page_bits: u32) -> u64 {
        self.0 & ((1 << page_bits) - 1)
    }

    #[inline]
    pub fn segment(self, segment_bits: u32) -> u64 {
        self.0 >> segment_bits
    }

    #[inline]
    pub fn segment_offset(self, segment_bits: u32) -> u64 {
        self.0 & ((1 << segment_bits) - 1)
    }

    /// Round down to the start of the containing page.
    #[inline]
    pub fn page_start(self, page_bits: u32) -> Address {
        Address(self.0 & !((1u64 << page_bits) - 1))
    }

    #[inline]
    pub fn add(self, n: u64) -> Address {
        Address::new(self.0 + n)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An atomically updated, monotonically non-decreasing address cell.
/// Every watermark (begin, head, safe-read-only, read-only, flushed) is
/// one of these; `advance_to` never moves a watermark backwards.
#[derive(Debug)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    pub fn new(addr: Address) -> Self {
        Self(AtomicU64::new(addr.raw()))
    }

    #[inline]
    pub fn load(&self) -> Address {
        Address(self.0.load(Ordering::Acquire))
    }

    /// Advance to `target` if it is ahead; returns true if this call moved
    /// the watermark.
    pub fn advance_to(&self, target: Address) -> bool {
        self.0.fetch_max(target.raw(), Ordering::AcqRel) < target.raw()
    }

    /// Unconditional store, for recovery only.
    pub fn reset(&self, addr: Address) {
        self.0.store(addr.raw(), Ordering::SeqCst);
    }
}

/// The allocator's tail cursor: `{page: u32, offset: u32}` packed into one
/// word so a single `fetch_add` claims space and a single load snapshots a
/// consistent pair.
#[derive(Debug)]
pub struct PageOffset(AtomicU64);

impl PageOffset {
    pub fn new(page: u64, offset: u64) -> Self {
        Self(AtomicU64::new(pack(page, offset)))
    }

    #[inline]
    pub fn load(&self) -> (u64, u64) {
        unpack(self.0.load(Ordering::Acquire))
    }

    /// Claim `size` bytes: returns the (page, offset) pair *before* the
    /// bump. The offset half may overflow the page; the caller sorts out
    /// the page roll.
    #[inline]
    pub fn fetch_add_offset(&self, size: u64) -> (u64, u64) {
        unpack(self.0.fetch_add(size, Ordering::AcqRel))
    }

    /// Move the cursor to `{page, offset}` if it still reads as the word
    /// that packed `(expected_page, expected_offset)`.
    pub fn try_move(&self, expected: (u64, u64), page: u64, offset: u64) -> bool {
        self.0
            .compare_exchange(
                pack(expected.0, expected.1),
                pack(page, offset),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn reset(&self, page: u64, offset: u64) {
        self.0.store(pack(page, offset), Ordering::SeqCst);
    }

    pub fn tail_address(&self, page_bits: u32) -> Address {
        let (page, offset) = self.load();
        // A cursor mid-roll reads past the page end; the tail is then the
        // page boundary until the roll completes.
        let offset = offset.min(1 << page_bits);
        Address::new((page << page_bits) + offset)
    }
}

#[inline]
fn pack(page: u64, offset: u64) -> u64 {
    debug_assert!(page < (1 << 32));
    (page << 32) | (offset & 0xffff_ffff)
}

#[inline]
fn unpack(word: u64) -> (u64, u64) {
    (word >> 32, word & 0xffff_ffff)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_and_segment_arithmetic() {
        let a = Address::new((3 << 22) + 17);
        assert_eq!(a.page(22), 3);
        assert_eq!(a.offset(22), 17);
        assert_eq!(a.page_start(22), Address::new(3 << 22));
        assert_eq!(a.segment(30), 0);
        assert_eq!(Address::new(1 << 30).segment(30), 1);
    }

    #[test]
    fn watermarks_never_retreat() {
        let w = AtomicAddress::new(Address::new(100));
        assert!(w.advance_to(Address::new(200)));
        assert!(!w.advance_to(Address::new(150)));
        assert_eq!(w.load(), Address::new(200));
    }

    #[test]
    fn cursor_claims_are_disjoint() {
        let cursor = PageOffset::new(2, 0);
        let (p0, o0) = cursor.fetch_add_offset(48);
        let (p1, o1) = cursor.fetch_add_offset(32);
        assert_eq!((p0, o0), (2, 0));
        assert_eq!((p1, o1), (2, 48));
        assert_eq!(cursor.load(), (2, 80));
    }
}
