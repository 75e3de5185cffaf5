//! State-transition tables for jobs and targets
//!
//! The tables are plain data so additions stay declarative; legality checks
//! are pure functions over them. Every runtime transition passes through
//! these guards before it is persisted.

use crate::model::{JobState, TargetState};

/// Legal job transitions. `Quarantined -> Queued` is the single
/// non-monotonic pair and is only reachable through operator release.
pub const JOB_TRANSITIONS: &[(JobState, JobState)] = &[
    (JobState::Discovered, JobState::Queued),
    (JobState::Discovered, JobState::Failed),
    (JobState::Queued, JobState::InProgress),
    (JobState::Queued, JobState::Failed),
    (JobState::InProgress, JobState::Partial),
    (JobState::InProgress, JobState::Verified),
    (JobState::InProgress, JobState::Failed),
    (JobState::InProgress, JobState::Quarantined),
    (JobState::Partial, JobState::Verified),
    (JobState::Partial, JobState::Failed),
    (JobState::Partial, JobState::Quarantined),
    (JobState::Quarantined, JobState::Queued),
];

/// Legal target transitions on the worker path.
pub const TARGET_TRANSITIONS: &[(TargetState, TargetState)] = &[
    (TargetState::Pending, TargetState::Copying),
    (TargetState::Copying, TargetState::Copied),
    (TargetState::Copying, TargetState::FailedRetryable),
    (TargetState::Copying, TargetState::FailedPermanent),
    (TargetState::Copied, TargetState::Verifying),
    (TargetState::Copied, TargetState::FailedRetryable),
    (TargetState::Verifying, TargetState::Verified),
    (TargetState::Verifying, TargetState::FailedRetryable),
    (TargetState::Verifying, TargetState::FailedPermanent),
    (TargetState::FailedRetryable, TargetState::Pending),
];

/// Rollbacks to the nearest safe predecessor, taken only on cooperative
/// cancellation or startup recovery, never on the worker path.
pub const TARGET_ROLLBACKS: &[(TargetState, TargetState)] = &[
    (TargetState::Copying, TargetState::Pending),
    (TargetState::Verifying, TargetState::Copied),
];

/// Whether `from -> to` appears in the job transition table
pub fn job_transition_allowed(from: JobState, to: JobState) -> bool {
    JOB_TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Whether the job transition requires explicit operator action
pub fn job_transition_is_manual(from: JobState, to: JobState) -> bool {
    from == JobState::Quarantined && to == JobState::Queued
}

/// Whether `from -> to` appears in the target transition table
pub fn target_transition_allowed(from: TargetState, to: TargetState) -> bool {
    TARGET_TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Whether `from -> to` is a sanctioned cancellation/recovery rollback
pub fn target_rollback_allowed(from: TargetState, to: TargetState) -> bool {
    TARGET_ROLLBACKS.iter().any(|&(f, t)| f == from && t == to)
}
