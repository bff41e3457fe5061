//! `ringstore-core`: the superblock, ring directory, header dictionary,
//! per-ring index, ring engine, and aggregation operator that make up the
//! persistent multi-ring time-indexed tabular storage engine described in
//! the project's design document.
//!
//! This crate is backend-agnostic (§4.1, §9): it defines the [`Backend`]
//! trait the engine is parameterized over and implements everything above
//! it. A concrete backend (an embedded key-value store with advisory file
//! locking) lives in the sibling `ringstore-sqlite` crate.

pub mod aggregate;
pub mod backend;
pub mod error;
pub mod headers;
pub mod index;
pub mod ring;
pub mod ringdir;
pub mod superblock;
pub mod table;

pub use aggregate::{aggregate, AggFn};
pub use backend::{Backend, BackendDescriptor, CreatePerm, DataBlock, LockMode};
pub use error::{Result, RingStoreError};
pub use headers::HeaderDict;
pub use index::{IndexRow, RingIndex};
pub use ring::{mget_cons, OpenSpec, RingHandle};
pub use ringdir::{RingDirEntry, RingDirectory};
pub use superblock::{Superblock, MAGIC};
pub use table::{ColumnInfo, Table, COL_DUR, COL_SEQ, COL_TIME};
