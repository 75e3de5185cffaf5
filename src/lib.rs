//! # FORKER - Durable File Replication Engine
//!
//! A crash-safe replication engine for very large medical imaging
//! artifacts. FORKER watches source directories, waits for arriving files
//! to become stable, copies each one to two or more destinations in
//! parallel while hashing on the fly, verifies every destination by
//! re-reading it, and quarantines anything whose digest diverges.
//!
//! ## Architecture
//!
//! - `config`: engine configuration with validated, documented defaults
//! - `model`: jobs, target outcomes, audit events, transition tables
//! - `hashing`: streaming SHA-256 over chunked byte sources
//! - `fsops`: confined filesystem operations and atomic finalize
//! - `stability`: decides when a growing file is done
//! - `store`: durable SQLite-backed job store (WAL, CAS, event log)
//! - `discovery`: watcher + rescan + stability sweep feeding the queue
//! - `retry`: failure classification and monotonic backoff
//! - `copier`: per-(job, target) streaming copy with atomic finalize
//! - `verifier`: re-read + re-hash verification of finalized files
//! - `quarantine`: sticky integrity-failure handling
//! - `orchestrator`: per-job state machine and per-target fan-out
//! - `throttle`: adaptive global concurrency control
//! - `recovery`: startup reconciliation of store state against disk
//! - `metrics` / `events`: counters and the correlated event stream
//! - `engine`: composition root tying the above together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod copier;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod fsops;
pub mod hashing;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod quarantine;
pub mod recovery;
pub mod retry;
pub mod stability;
pub mod store;
pub mod throttle;
pub mod verifier;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{EngineError, EngineResult, EngineStatus, JobReport, ReplicationEngine};
pub use events::EngineEvent;
pub use metrics::MetricsSnapshot;
pub use model::{Job, JobState, QuarantineEntry, ReplicationEvent, TargetOutcome, TargetState};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
