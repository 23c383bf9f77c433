//! Locked local and centralized image repositories (§4.3).
//!
//! A repository is a per-user or site-wide directory tree holding
//! already-ingested images as SquashFS files plus a JSON metadata index.
//! All metadata mutation happens under an exclusive advisory lock; readers
//! take a shared lock. Nothing here ever mutates a squashfs or metadata file
//! without first holding the matching lock.

mod flock;
mod repository;

pub use flock::{Flock, LockType};
pub use repository::{
    DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_WARN_AFTER, Repository, RepositoryKind, StoredImage,
};

/// Result type for `kiln-repo` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The advisory lock could not be acquired before its timeout elapsed.
    #[error("timed out acquiring {lock_type} lock on {path} after {elapsed_ms}ms")]
    LockTimeout {
        /// The path of the lock file.
        path: String,
        /// `"read"` or `"write"`.
        lock_type: &'static str,
        /// Milliseconds elapsed before giving up.
        elapsed_ms: u64,
    },

    /// The metadata index JSON failed to parse.
    #[error("corrupt repository metadata at {path}: {source}")]
    CorruptMetadata {
        /// Path of the metadata file.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The requested image is not present in the repository.
    #[error("image not found in repository: {0}")]
    NotFound(String),

    /// A centralized repository was opened by a non-root effective user.
    #[error("centralized repository requires effective uid 0")]
    RequiresRoot,

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
