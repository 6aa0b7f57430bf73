//! Error types for coppice

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// Page number. `PageId::INVALID` marks an empty tree root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no page" (empty tree root, unset link).
    pub const INVALID: PageId = PageId(u64::MAX);

    /// Byte offset of this page in the data file.
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }

    /// Whether this is a real page number.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// Transaction identifier. Monotonically increasing across commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Id carried by the initial (empty) snapshot.
    pub const MIN: TxnId = TxnId(1);
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The main error type for coppice operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// The database geometry is exhausted: no page could be allocated
    /// within the configured upper bound.
    #[error("map full: cannot grow past {upper_pages} pages")]
    MapFull {
        /// Geometry upper bound, in pages
        upper_pages: u64,
    },

    /// The write transaction hit its dirty-list or reclaim-list limit.
    #[error("transaction full: {dirty} dirty pages at limit")]
    TxnFull {
        /// Number of dirty pages held when the limit fired
        dirty: usize,
    },

    /// No free reader slot in the lock file.
    #[error("reader table full")]
    ReadersFull,

    /// A lock or slot was busy in non-blocking mode; the caller may retry.
    #[error("resource busy, retry")]
    Busy,

    /// The mapping moved under a racing read; the caller may retry.
    #[error("map resized, retry")]
    MapResized,

    /// On-disk invariant violated. The current transaction is poisoned;
    /// older snapshots remain readable.
    #[error("corruption on page {page}: {details}")]
    Corruption {
        /// Description of the violated invariant
        details: Cow<'static, str>,
        /// Page where corruption was detected
        page: PageId,
    },

    /// An I/O failure in the commit path. The environment has set its
    /// sticky fatal bit and refuses all further mutation.
    #[error("environment fatal: {0}")]
    Fatal(Cow<'static, str>),

    /// Key not found in database
    #[error("key not found")]
    KeyNotFound,

    /// Cursor ran off the end of the data, or is not positioned.
    #[error("no data at cursor")]
    NotFound,

    /// Key exceeds the per-page bound derived from the page size.
    #[error("key of {len} bytes exceeds maximum {max}")]
    KeyTooLong {
        /// Offending key length
        len: usize,
        /// Maximum permitted by the geometry
        max: usize,
    },

    /// Database file carries an incompatible format version.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: u32,
        /// Found version
        found: u32,
    },

    /// Operation incompatible with the database flags (e.g. `next_dup`
    /// on a non-dupsort tree).
    #[error("operation incompatible with database flags")]
    Incompatible,

    /// Invalid argument; no state was touched.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The transaction saw an error earlier and may not continue.
    #[error("transaction poisoned by an earlier error")]
    BadTransaction,

    /// The named database does not exist (and `CREATE` was not given).
    #[error("no such database")]
    BadDbi,

    /// Another handle already holds this environment exclusively.
    #[error("environment already open")]
    EnvAlreadyOpen,

    /// Key already present and `NOOVERWRITE`/`NODUPDATA` was requested.
    #[error("key exists")]
    KeyExist,

    /// A node no longer fits on its page. Internal; the tree layer
    /// resolves it by splitting and it never escapes a public call.
    #[error("page full")]
    PageFull,
}

/// Result type alias for coppice operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Corruption constructor with a static message.
    pub(crate) fn corrupt(page: PageId, details: &'static str) -> Self {
        Error::Corruption { details: details.into(), page }
    }

    /// Whether the error leaves the environment unusable for writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy | Error::MapResized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pgno_display() {
        assert_eq!(PageId(7).to_string(), "7");
        assert_eq!(PageId::INVALID.to_string(), "<invalid>");
        assert!(!PageId::INVALID.is_valid());
    }

    #[test]
    fn classification() {
        assert!(Error::Busy.is_transient());
        assert!(Error::MapResized.is_transient());
        assert!(!Error::KeyNotFound.is_transient());
        assert!(Error::Fatal("meta write failed".into()).is_fatal());
    }
}
