//! # Quarantine Service
//!
//! Records integrity failures with full forensic context and keeps them
//! sticky: the only exit from `Quarantined` is an explicit operator
//! release, which atomically clears the active entries and requeues the
//! job. Release is refused while startup recovery is running.

use crate::events::EngineEvent;
use crate::model::{kind, JobState, QuarantineEntry, TargetState};
use crate::orchestrator::{OrchestratorError, TransitionCoordinator};
use crate::store::StoreError;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Quarantine failures
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Guarded transition failure while quarantining
    #[error("Transition error: {0}")]
    Transition(#[from] OrchestratorError),

    /// Release attempted while startup recovery is reconciling state
    #[error("Recovery in progress; retry the release afterwards")]
    RecoveryInProgress,
}

/// Result type for quarantine operations
pub type QuarantineResult<T> = Result<T, QuarantineError>;

/// Sticky integrity-failure handling
#[derive(Clone)]
pub struct QuarantineService {
    coordinator: TransitionCoordinator,
    recovery_active: Arc<AtomicBool>,
}

impl QuarantineService {
    /// Create the service; `recovery_active` is shared with the engine's
    /// recovery routine
    pub fn new(coordinator: TransitionCoordinator, recovery_active: Arc<AtomicBool>) -> Self {
        Self {
            coordinator,
            recovery_active,
        }
    }

    /// Record an integrity failure and move the job to `Quarantined`
    ///
    /// The affected target becomes `FailedPermanent`; no automatic retry
    /// will ever touch this job again.
    pub async fn raise(
        &self,
        job_id: &str,
        target_id: &str,
        reason: &str,
        expected_digest: Option<String>,
        observed_digest: Option<String>,
    ) -> QuarantineResult<()> {
        log::error!(
            "Integrity failure on job {} target {}: {} (expected {:?}, observed {:?})",
            job_id,
            target_id,
            reason,
            expected_digest,
            observed_digest
        );

        let entry = QuarantineEntry::mismatch(
            job_id,
            target_id,
            reason,
            expected_digest.clone(),
            observed_digest.clone(),
        );
        self.coordinator.store().insert_quarantine(&entry).await?;

        self.coordinator
            .transition_target(job_id, target_id, TargetState::FailedPermanent, |o| {
                o.last_error = Some(reason.to_string());
            })
            .await?;
        self.coordinator
            .transition_job(job_id, JobState::Quarantined)
            .await?;

        self.coordinator.store()
            .append_event(
                job_id,
                kind::QUARANTINE_RAISED,
                serde_json::json!({
                    "target_id": target_id,
                    "reason": reason,
                    "expected_digest": expected_digest,
                    "observed_digest": observed_digest,
                }),
            )
            .await?;
        self.coordinator.bus().publish(
            EngineEvent {
                job_id: job_id.to_string(),
                target_id: Some(target_id.to_string()),
                kind: kind::QUARANTINE_RAISED.to_string(),
                from_state: None,
                to_state: Some(JobState::Quarantined.as_str().to_string()),
                duration_ms: None,
                error_code: Some("integrity_failure".to_string()),
                timestamp: Utc::now(),
            },
        );
        self.coordinator.metrics().record_hash_mismatch();
        Ok(())
    }

    /// Enumerate active quarantine entries
    pub async fn active(&self) -> QuarantineResult<Vec<QuarantineEntry>> {
        Ok(self.coordinator.store().active_quarantines().await?)
    }

    /// Operator-only release: clear active entries and requeue the job
    pub async fn release(&self, job_id: &str) -> QuarantineResult<()> {
        if self.recovery_active.load(Ordering::Acquire) {
            return Err(QuarantineError::RecoveryInProgress);
        }

        self.coordinator.store().release_quarantine(job_id).await?;
        self.coordinator.bus().publish(EngineEvent::job_transition(
            job_id,
            kind::QUARANTINE_RELEASED,
            JobState::Quarantined.as_str(),
            JobState::Queued.as_str(),
        ));
        log::info!("Quarantine released for job {}", job_id);
        Ok(())
    }
}
