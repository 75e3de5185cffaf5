//! Job-state aggregation from target outcomes
//!
//! Pure rules, applied after every target completion and during recovery:
//! - Every target verified -> the job is verified
//! - Some verified, some still undecided -> partial
//! - Every fate decided with at least one permanent failure -> failed
//! - Otherwise the job stays in flight

use crate::model::{TargetOutcome, TargetState};

/// Aggregate verdict over a job's targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAggregate {
    /// All required targets verified
    Verified,

    /// At least one verified, at least one undecided
    Partial,

    /// All fates decided, at least one permanent failure
    Failed,

    /// Work remains and nothing is verified yet
    InFlight,
}

/// Compute the aggregate verdict for a set of target outcomes
pub fn aggregate_targets(targets: &[TargetOutcome]) -> JobAggregate {
    let all_terminal = targets.iter().all(|t| t.state.is_terminal());
    let any_verified = targets.iter().any(|t| t.state == TargetState::Verified);
    let all_verified = targets.iter().all(|t| t.state == TargetState::Verified);

    if !targets.is_empty() && all_verified {
        JobAggregate::Verified
    } else if all_terminal {
        JobAggregate::Failed
    } else if any_verified {
        JobAggregate::Partial
    } else {
        JobAggregate::InFlight
    }
}
