//! The keyed-blob backend abstraction the ring engine is parameterized
//! over (§4.1, §9 "polymorphism over backends"). One concrete backend
//! ships in `ringstore-sqlite`; anything else implementing this trait is
//! pluggable without the engine changing.

use crate::error::Result;
use crate::headers::HeaderDict;
use crate::index::RingIndex;
use crate::ringdir::RingDirectory;
use crate::superblock::Superblock;

/// Lock mode requested of the backend (§4.1, §4.2.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    /// Write, creating the file if it does not exist.
    WriteCreate,
}

/// File permission bits requested at creation (only meaningful on create).
#[derive(Debug, Clone, Copy)]
pub struct CreatePerm(pub u32);

impl Default for CreatePerm {
    fn default() -> Self {
        CreatePerm(0o644)
    }
}

/// The body of one data block as stored: the block's own `time` and
/// `header_hash` (redundant with the index row for index-free fast-path
/// reads, §3) plus the serialized row body.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub seq: u64,
    pub time: i64,
    pub hd_hash: u32,
    pub body: String,
}

/// A handle onto an open file, opaque to callers outside the backend
/// implementation. The engine never inspects it; it only threads it
/// through backend calls.
pub trait BackendDescriptor: Send {}

/// The capability set every backend must provide (§4.1, §9).
///
/// All operations take `&self` on the backend and a descriptor identifying
/// the open file; writers must be invoked while a write lock is held by
/// the caller (the trait does not itself enforce this — see §4.2.7).
pub trait Backend: Send + Sync {
    type Descriptor: BackendDescriptor;

    fn open(&self, path: &str, perm: CreatePerm, create: bool) -> Result<Self::Descriptor>;
    fn close(&self, desc: Self::Descriptor) -> Result<()>;

    fn lock(&self, desc: &Self::Descriptor, mode: LockMode, caller_tag: &str) -> Result<()>;
    fn lock_now(&self, desc: &Self::Descriptor, mode: LockMode, caller_tag: &str) -> Result<()>;
    fn unlock(&self, desc: &Self::Descriptor) -> Result<()>;

    fn read_super(&self, desc: &Self::Descriptor) -> Result<Superblock>;
    fn write_super(&self, desc: &Self::Descriptor, sb: &Superblock) -> Result<()>;
    /// Writes a sentinel marking the file damaged (§4.2.1 step 5, §4.2.8).
    fn mark_damaged(&self, desc: &Self::Descriptor) -> Result<()>;
    fn is_damaged(&self, desc: &Self::Descriptor) -> Result<bool>;

    fn read_ringdir(&self, desc: &Self::Descriptor) -> Result<RingDirectory>;
    fn write_ringdir(&self, desc: &Self::Descriptor, dir: &RingDirectory) -> Result<()>;

    fn read_headers(&self, desc: &Self::Descriptor) -> Result<HeaderDict>;
    fn write_headers(&self, desc: &Self::Descriptor, dict: &HeaderDict) -> Result<()>;

    fn read_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<RingIndex>;
    fn write_index(&self, desc: &Self::Descriptor, ring_id: u64, idx: &RingIndex) -> Result<()>;
    fn rm_index(&self, desc: &Self::Descriptor, ring_id: u64) -> Result<()>;

    /// Writes a contiguous run of blocks starting at `start_seq`; returns
    /// the count actually written.
    fn append_dblocks(
        &self,
        desc: &Self::Descriptor,
        ring_id: u64,
        start_seq: u64,
        blocks: &[DataBlock],
    ) -> Result<usize>;

    /// Reads up to `n` existing blocks from `start_seq`; missing blocks are
    /// silently skipped, not fatal (§4.1).
    fn read_dblocks(
        &self,
        desc: &Self::Descriptor,
        ring_id: u64,
        start_seq: u64,
        n: usize,
    ) -> Result<Vec<DataBlock>>;

    /// Best-effort removal of `[from_seq, to_seq]`; returns the count
    /// actually removed.
    fn expire_dblocks(
        &self,
        desc: &Self::Descriptor,
        ring_id: u64,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<usize>;

    /// Backend-defined compaction; no semantic change visible to readers.
    fn checkpoint(&self, desc: &Self::Descriptor) -> Result<()>;

    /// Approximate on-disk byte footprint of the whole file. Used by
    /// inspection tooling, not by engine correctness (§9).
    fn footprint(&self, desc: &Self::Descriptor) -> Result<u64>;
}
