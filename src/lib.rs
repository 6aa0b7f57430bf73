//! Embedded transactional memory-mapped ordered key/value store
//!
//! Coppice keeps a copy-on-write B+tree in a single memory-mapped
//! file. Any number of read transactions run against immutable
//! snapshots while at most one writer mutates private page copies and
//! installs them atomically through a rotating meta-page triad.
//! Reads are zero-copy views into the mapping.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

// Reader slots and meta fields are plain 64-bit atomics over shared
// mappings; emulating them on 32-bit targets is not supported.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("coppice requires a 64-bit target");

pub mod comparator;
pub mod cursor;
pub mod db;
pub mod dirty;
pub mod dupsort;
pub mod env;
pub mod error;
pub mod io;
pub mod meta;
pub mod page;
pub mod pnl;
pub mod reader;
pub mod tree;
pub mod txn;

// Re-exports
pub use db::{Database, DbFlags, DbStat, PutFlags};
pub use env::{EnvBuilder, EnvFlags, EnvInfo, Environment, HsrDecision};
pub use error::{Error, PageId, Result, TxnId};
pub use txn::{NestedTxn, ReadTxn, TxnRead, WriteTxn};

/// The default page size (4 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
