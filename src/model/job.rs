//! Job aggregate and job state machine states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a replication job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// A stable source file has been observed and persisted
    Discovered,

    /// The job is eligible for admission by the orchestrator
    Queued,

    /// At least one target copy is active
    InProgress,

    /// Some required targets are verified, others are still outstanding
    Partial,

    /// Every required target verified with a matching digest (terminal)
    Verified,

    /// A target failed permanently for a non-integrity reason (terminal)
    Failed,

    /// An integrity failure was detected; only an operator can release
    Quarantined,
}

impl JobState {
    /// Stable string tag used for persistence and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Queued => "queued",
            JobState::InProgress => "in_progress",
            JobState::Partial => "partial",
            JobState::Verified => "verified",
            JobState::Failed => "failed",
            JobState::Quarantined => "quarantined",
        }
    }

    /// All states, in lifecycle order
    pub fn all() -> &'static [JobState] {
        &[
            JobState::Discovered,
            JobState::Queued,
            JobState::InProgress,
            JobState::Partial,
            JobState::Verified,
            JobState::Failed,
            JobState::Quarantined,
        ]
    }

    /// Whether this state admits no further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Verified | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(JobState::Discovered),
            "queued" => Ok(JobState::Queued),
            "in_progress" => Ok(JobState::InProgress),
            "partial" => Ok(JobState::Partial),
            "verified" => Ok(JobState::Verified),
            "failed" => Ok(JobState::Failed),
            "quarantined" => Ok(JobState::Quarantined),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// One source file's replication to all of its required targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier, unique process-wide and persisted
    pub id: String,

    /// Canonical absolute source path
    pub source_path: PathBuf,

    /// Size observed when the job was created, in bytes
    pub initial_size: u64,

    /// Lower-case hex SHA-256 of the source; set once by the first
    /// completed copy and immutable afterwards
    pub source_digest: Option<String>,

    /// Ordered, non-empty set of required target identifiers
    pub required_targets: Vec<String>,

    /// Current state
    pub state: JobState,

    /// Optimistic-concurrency version counter, always positive
    pub version: i64,

    /// Creation timestamp (UTC)
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job in the `Discovered` state
    pub fn new(source_path: PathBuf, initial_size: u64, required_targets: Vec<String>) -> Self {
        debug_assert!(!required_targets.is_empty());
        Self {
            id: Uuid::new_v4().to_string(),
            source_path,
            initial_size,
            source_digest: None,
            required_targets,
            state: JobState::Discovered,
            version: 1,
            created_at: Utc::now(),
        }
    }

    /// Whether every required target id appears exactly once
    pub fn targets_are_unique(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.required_targets.iter().all(|t| seen.insert(t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in JobState::all() {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, *state);
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(PathBuf::from("/data/a.dcm"), 42, vec!["a".into(), "b".into()]);
        assert_eq!(job.state, JobState::Discovered);
        assert_eq!(job.version, 1);
        assert!(job.source_digest.is_none());
        assert!(job.targets_are_unique());
    }

    #[test]
    fn test_duplicate_targets_detected() {
        let job = Job::new(PathBuf::from("/data/a.dcm"), 0, vec!["a".into(), "a".into()]);
        assert!(!job.targets_are_unique());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Verified.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Quarantined.is_terminal());
        assert!(!JobState::Partial.is_terminal());
    }
}
