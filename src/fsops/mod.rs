//! # Filesystem Adapter
//!
//! Wraps OS file primitives behind the contracts the engine relies on:
//! - Shared-read opens so external observers are never locked out
//! - Exclusive-write creation for staging files
//! - Flush-to-disk before finalize, then an atomic, replace-free
//!   same-volume move to the final name
//! - Glob-filtered enumeration reporting size, mtime and readability
//! - Canonicalization that rejects symlinks in the resolved chain
//! - Confinement: every path must resolve under an allowlisted root
//!
//! Staging files live in a per-target `.forker/tmp/<jobId>/` directory and
//! carry the `.forker-tmp` suffix consumers are documented to ignore.

use std::path::PathBuf;
use thiserror::Error;

pub mod ops;
pub mod paths;

pub use ops::{
    atomic_rename, create_staging_exclusive, enumerate, flush_to_disk, list_staging_files,
    open_shared_read, probe_shared_read, remove_file_if_exists, FileInfo,
};
pub use paths::{
    build_glob_set, canonicalize_strict, ensure_within_roots, is_staging_artifact, staging_dir,
    staging_path, STAGING_DIR_NAME, STAGING_SUFFIX,
};

/// Filesystem adapter errors
#[derive(Debug, Error)]
pub enum FsError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A path resolved outside every allowlisted root
    #[error("Path outside allowlisted roots: {0}")]
    PathOutsideRoot(PathBuf),

    /// A symlink or reparse point appeared in the resolved chain
    #[error("Symlink rejected in path: {0}")]
    SymlinkRejected(PathBuf),

    /// Rename source and destination live on different volumes
    #[error("Cross-volume rename from {from} to {to}")]
    CrossVolumeRename {
        /// Staging side
        from: PathBuf,
        /// Final side
        to: PathBuf,
    },

    /// The final path already holds a file; a concurrent finalize won
    #[error("Final path already occupied: {0}")]
    FinalPathOccupied(PathBuf),

    /// An include glob failed to compile
    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(#[from] globset::Error),
}

/// Result type for filesystem operations
pub type FsResult<T> = Result<T, FsError>;
