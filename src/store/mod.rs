//! # Job Store
//!
//! Durable, transactional persistence for jobs, per-target outcomes, audit
//! events and quarantine entries, backed by embedded SQLite:
//! - WAL journal mode with `synchronous=FULL` so committed transactions
//!   survive abrupt termination
//! - Optimistic concurrency on jobs via a version-counter compare-and-swap
//! - Append-only event log with store-assigned ascending sequence numbers
//! - Schema constraints (state tags, non-negative counters, composite
//!   primary keys, cascade delete) enforced at the store boundary
//!
//! Tests run the same code against an in-memory SQLite database.

use std::path::PathBuf;
use thiserror::Error;

pub mod connection;
pub mod repository;
pub mod schema;

pub use connection::{StoreConfig, StorePool};
pub use repository::JobStore;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Optimistic concurrency control lost the race
    #[error("Concurrency conflict updating job {0}")]
    ConcurrencyConflict(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempt to overwrite an already-set source digest with a different value
    #[error("Source digest conflict for job {job_id}: {existing} is set, {attempted} attempted")]
    DigestConflict {
        /// Affected job
        job_id: String,
        /// Digest already persisted
        existing: String,
        /// Digest the caller tried to set
        attempted: String,
    },

    /// Payload (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row failed to parse back into domain types
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Migration failure
    #[error("Migration error: {0}")]
    Migration(String),

    /// Store file path is unusable
    #[error("Invalid store path: {0}")]
    InvalidPath(PathBuf),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
