//! A concurrent, latch-free, embedded key-value store built around a
//! hybrid log: an append-only record log whose lower portion lives on a
//! storage device and whose upper portion is mutable in memory, indexed
//! by a resizable hash table of tag-matched bucket chains.
//!
//! The store is operated through per-thread [`Session`]s. Reads, upserts
//! and read-modify-writes run latch-free against the in-memory region;
//! records that have been evicted to the device resolve through pending
//! I/O continuations drained by [`Session::complete_pending`]. A
//! concurrent-prefix-recovery (CPR) phase machine takes consistent
//! checkpoints without stopping operations.

use std::path::PathBuf;

pub mod address;
pub mod device;
pub mod functions;
pub mod record;
pub mod state;
pub mod status;

mod checkpoint;
mod hlog;
mod index;
mod recovery;
mod session;
mod store;

pub use address::Address;
pub use checkpoint::CheckpointKind;
pub use device::{AlignedBuf, Device, FileDevice, NullDevice};
pub use functions::{Functions, RawFunctions};
pub use session::{CompletedOp, Session};
pub use status::Status;
pub use store::Store;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint metadata: {0}")]
    Corruption(String),
    #[error("device geometry must be a power of two (got {0})")]
    BadGeometry(u64),
    #[error("index size and chunk count must be powers of two (got {0})")]
    BadIndexSize(u64),
    #[error("unknown session {0}")]
    UnknownSession(uuid::Uuid),
    #[error("a checkpoint, growth, or GC cycle is already in progress")]
    Busy,
    #[error("operation requires the store to be at rest with no live sessions")]
    NotAtRest,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Store construction parameters. Passed explicitly; the store never
/// reads process-global configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of primary hash buckets. Must be a power of two.
    pub index_buckets: u64,
    /// Log page size, as an exponent (page size = 1 << bits).
    pub page_size_bits: u32,
    /// In-memory log buffer size, as an exponent. Must leave room for at
    /// least four pages.
    pub memory_size_bits: u32,
    /// Device segment size, as an exponent. Must be >= the page size.
    pub segment_size_bits: u32,
    /// Fraction of the in-memory buffer kept mutable (in-place updatable).
    pub mutable_fraction: f64,
    /// Promote records read from the device to the log tail.
    pub copy_reads_to_tail: bool,
    /// Root directory for checkpoint output, one subdirectory per token.
    pub checkpoint_dir: PathBuf,
    /// Checkpoint strategy: snapshot to a side file instead of folding
    /// the tail over into the log.
    pub use_snapshot_file: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index_buckets: 1 << 16,
            page_size_bits: 22,
            memory_size_bits: 26,
            segment_size_bits: 30,
            mutable_fraction: 0.9,
            copy_reads_to_tail: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
            use_snapshot_file: false,
        }
    }
}

impl Settings {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.index_buckets.is_power_of_two() {
            return Err(Error::BadIndexSize(self.index_buckets));
        }
        if self.segment_size_bits < self.page_size_bits {
            return Err(Error::BadGeometry(1 << self.segment_size_bits));
        }
        if self.memory_size_bits < self.page_size_bits + 2 {
            return Err(Error::BadGeometry(1 << self.memory_size_bits));
        }
        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(Error::BadGeometry(0));
        }
        Ok(())
    }

    pub(crate) fn buffer_pages(&self) -> u32 {
        1 << (self.memory_size_bits - self.page_size_bits)
    }

    pub(crate) fn page_size(&self) -> u64 {
        1 << self.page_size_bits
    }
}
