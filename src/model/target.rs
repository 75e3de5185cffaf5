//! Per-target outcome record and target state machine states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a single (job, target) copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    /// Not yet started, or re-armed for a retry
    Pending,

    /// A worker is streaming bytes to the staging path
    Copying,

    /// The staging file was finalized at the final path
    Copied,

    /// A worker is re-reading and re-hashing the finalized file
    Verifying,

    /// Digest matched the source digest (terminal success)
    Verified,

    /// A retryable failure occurred; the retry policy will re-arm it
    FailedRetryable,

    /// Attempt cap reached or a permanent failure occurred (terminal)
    FailedPermanent,
}

impl TargetState {
    /// Stable string tag used for persistence and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Copying => "copying",
            TargetState::Copied => "copied",
            TargetState::Verifying => "verifying",
            TargetState::Verified => "verified",
            TargetState::FailedRetryable => "failed_retryable",
            TargetState::FailedPermanent => "failed_permanent",
        }
    }

    /// All states, in lifecycle order
    pub fn all() -> &'static [TargetState] {
        &[
            TargetState::Pending,
            TargetState::Copying,
            TargetState::Copied,
            TargetState::Verifying,
            TargetState::Verified,
            TargetState::FailedRetryable,
            TargetState::FailedPermanent,
        ]
    }

    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Verified | TargetState::FailedPermanent)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetState::Pending),
            "copying" => Ok(TargetState::Copying),
            "copied" => Ok(TargetState::Copied),
            "verifying" => Ok(TargetState::Verifying),
            "verified" => Ok(TargetState::Verified),
            "failed_retryable" => Ok(TargetState::FailedRetryable),
            "failed_permanent" => Ok(TargetState::FailedPermanent),
            other => Err(format!("unknown target state: {}", other)),
        }
    }
}

/// Progress record for one (job, target) pair
///
/// Composite identity is (job_id, target_id); the store enforces it as the
/// primary key with cascade delete from the owning job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    /// Owning job id
    pub job_id: String,

    /// Target identifier, unique within the job
    pub target_id: String,

    /// Current state
    pub state: TargetState,

    /// Number of copy attempts consumed so far
    pub attempts: u32,

    /// Lower-case hex SHA-256 observed for this target's copy
    pub target_digest: Option<String>,

    /// Staging path while a copy is active
    pub staging_path: Option<PathBuf>,

    /// Final visible path; persisted at copy start
    pub final_path: Option<PathBuf>,

    /// Last error text, for operator diagnostics
    pub last_error: Option<String>,

    /// Timestamp of the last state transition (UTC)
    pub updated_at: DateTime<Utc>,
}

impl TargetOutcome {
    /// Create a fresh `Pending` outcome for a (job, target) pair
    pub fn new(job_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            target_id: target_id.into(),
            state: TargetState::Pending,
            attempts: 0,
            target_digest: None,
            staging_path: None,
            final_path: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
