//! Append-only audit events
//!
//! Every observed transition produces exactly one event; the log alone is
//! sufficient to replay a job's history. Sequence numbers are assigned by
//! the store and are strictly ascending per store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event kind tags
pub mod kind {
    /// A stable source file produced a new job
    pub const JOB_DISCOVERED: &str = "job.discovered";
    /// A job changed state; payload carries `from` and `to`
    pub const JOB_STATE_CHANGED: &str = "job.state_changed";
    /// A target changed state; payload carries `target_id`, `from`, `to`
    pub const TARGET_STATE_CHANGED: &str = "target.state_changed";
    /// The source digest was set for the first time
    pub const SOURCE_DIGEST_SET: &str = "job.source_digest_set";
    /// A pending candidate stayed inaccessible past its deadline
    pub const CANDIDATE_DROPPED: &str = "discovery.candidate_dropped";
    /// A retry was scheduled; payload carries the delay and attempt
    pub const RETRY_SCHEDULED: &str = "target.retry_scheduled";
    /// An integrity failure was recorded
    pub const QUARANTINE_RAISED: &str = "quarantine.raised";
    /// An operator released a quarantined job back to the queue
    pub const QUARANTINE_RELEASED: &str = "quarantine.released";
    /// Recovery reconciled a target against the filesystem
    pub const RECOVERY_RECONCILED: &str = "recovery.reconciled";
    /// Recovery deleted an orphan staging file
    pub const RECOVERY_ORPHAN_REMOVED: &str = "recovery.orphan_removed";
    /// A path escaped the configured allowlist roots
    pub const SECURITY_VIOLATION: &str = "security.path_outside_root";
}

/// One audit record as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    /// Store-assigned, strictly ascending sequence number
    pub sequence: i64,

    /// Owning job id
    pub job_id: String,

    /// Event kind tag (see [`kind`])
    pub kind: String,

    /// Structured payload
    pub payload: serde_json::Value,

    /// Timestamp (UTC)
    pub timestamp: DateTime<Utc>,
}
