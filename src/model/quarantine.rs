//! Quarantine entries
//!
//! Integrity failures are recorded with enough forensic context to diagnose
//! a mismatch without re-running anything. Entries stay active until an
//! operator releases them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Forensic record of one integrity failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Affected job
    pub job_id: String,

    /// Target on which the mismatch was observed
    pub target_id: String,

    /// Human-readable reason
    pub reason: String,

    /// Digest the source produced
    pub expected_digest: Option<String>,

    /// Digest observed on the target
    pub observed_digest: Option<String>,

    /// When the failure was recorded (UTC)
    pub timestamp: DateTime<Utc>,

    /// False once an operator releases the job
    pub active: bool,
}

impl QuarantineEntry {
    /// Create an active entry for a digest mismatch
    pub fn mismatch(
        job_id: impl Into<String>,
        target_id: impl Into<String>,
        reason: impl Into<String>,
        expected_digest: Option<String>,
        observed_digest: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            target_id: target_id.into(),
            reason: reason.into(),
            expected_digest,
            observed_digest,
            timestamp: Utc::now(),
            active: true,
        }
    }
}
