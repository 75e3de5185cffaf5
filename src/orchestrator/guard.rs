//! Guarded state transitions
//!
//! Every runtime state change flows through this coordinator. A transition
//! is checked against the tables in [`crate::model::transitions`], persisted
//! with the job-version compare-and-swap, audited exactly once, and
//! published on the event bus. Losing the CAS re-reads and re-evaluates;
//! that loop is not counted against any attempt cap.

use crate::events::{EngineEvent, EventBus};
use crate::metrics::SharedMetrics;
use crate::model::{
    job_transition_allowed, kind, target_rollback_allowed, target_transition_allowed, Job,
    JobState, TargetOutcome, TargetState,
};
use crate::orchestrator::{OrchestratorError, OrchestratorResult};
use crate::store::{JobStore, StoreError};
use chrono::Utc;

/// Shared transition API handed to workers
#[derive(Clone)]
pub struct TransitionCoordinator {
    store: JobStore,
    bus: EventBus,
    metrics: SharedMetrics,
}

impl TransitionCoordinator {
    /// Create a coordinator over the store and event bus
    pub fn new(store: JobStore, bus: EventBus, metrics: SharedMetrics) -> Self {
        Self { store, bus, metrics }
    }

    /// Store handle for read-side queries
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Event bus handle
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Metrics handle
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Transition a job, retrying through CAS conflicts
    ///
    /// Finding the job already in the requested state returns it unchanged,
    /// which makes the re-read-and-re-evaluate path idempotent.
    pub async fn transition_job(
        &self,
        job_id: &str,
        to: JobState,
    ) -> OrchestratorResult<Job> {
        loop {
            let mut job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

            if job.state == to {
                return Ok(job);
            }
            let from = job.state;
            if !job_transition_allowed(from, to) {
                return Err(OrchestratorError::InvalidJobTransition {
                    job_id: job_id.to_string(),
                    from,
                    to,
                });
            }

            job.state = to;
            match self.store.update_job_cas(&mut job).await {
                Ok(()) => {
                    self.store
                        .append_event(
                            job_id,
                            kind::JOB_STATE_CHANGED,
                            serde_json::json!({
                                "from": from.as_str(),
                                "to": to.as_str(),
                            }),
                        )
                        .await?;
                    self.bus.publish(EngineEvent::job_transition(
                        job_id,
                        kind::JOB_STATE_CHANGED,
                        from.as_str(),
                        to.as_str(),
                    ));
                    self.metrics.record_job_outcome(to);
                    log::debug!("Job {} transitioned {} -> {}", job_id, from, to);
                    return Ok(job);
                }
                Err(StoreError::ConcurrencyConflict(_)) => {
                    log::trace!("CAS conflict on job {}, re-evaluating", job_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Transition a target along the worker path
    ///
    /// `mutate` adjusts the outcome's payload fields (digest, paths,
    /// attempts, error text) after the state is updated and before the row
    /// is persisted.
    pub async fn transition_target<F>(
        &self,
        job_id: &str,
        target_id: &str,
        to: TargetState,
        mutate: F,
    ) -> OrchestratorResult<TargetOutcome>
    where
        F: FnOnce(&mut TargetOutcome),
    {
        self.transition_target_inner(job_id, target_id, to, mutate, false)
            .await
    }

    /// Roll a target back to its nearest safe predecessor
    ///
    /// Only the pairs sanctioned for cancellation and recovery are allowed.
    pub async fn rollback_target(
        &self,
        job_id: &str,
        target_id: &str,
        to: TargetState,
    ) -> OrchestratorResult<TargetOutcome> {
        self.transition_target_inner(job_id, target_id, to, |outcome| {
            outcome.staging_path = None;
        }, true)
        .await
    }

    async fn transition_target_inner<F>(
        &self,
        job_id: &str,
        target_id: &str,
        to: TargetState,
        mutate: F,
        rollback: bool,
    ) -> OrchestratorResult<TargetOutcome>
    where
        F: FnOnce(&mut TargetOutcome),
    {
        let mut outcome = self
            .store
            .get_target(job_id, target_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::TargetNotFound(job_id.to_string(), target_id.to_string())
            })?;

        let from = outcome.state;
        let allowed = if rollback {
            from == to || target_rollback_allowed(from, to)
        } else {
            target_transition_allowed(from, to)
        };
        if !allowed {
            return Err(OrchestratorError::InvalidTargetTransition {
                job_id: job_id.to_string(),
                target_id: target_id.to_string(),
                from,
                to,
            });
        }

        outcome.state = to;
        outcome.updated_at = Utc::now();
        mutate(&mut outcome);
        self.store.save_target(&outcome).await?;

        if from != to {
            self.store
                .append_event(
                    job_id,
                    kind::TARGET_STATE_CHANGED,
                    serde_json::json!({
                        "target_id": target_id,
                        "from": from.as_str(),
                        "to": to.as_str(),
                        "rollback": rollback,
                    }),
                )
                .await?;
            self.bus.publish(EngineEvent::target_transition(
                job_id,
                target_id,
                kind::TARGET_STATE_CHANGED,
                from.as_str(),
                to.as_str(),
            ));
            log::debug!(
                "Target {}/{} transitioned {} -> {}",
                job_id,
                target_id,
                from,
                to
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::metrics::EngineMetrics;
    use crate::store::StorePool;
    use std::path::PathBuf;

    async fn coordinator() -> (TransitionCoordinator, Job) {
        let store = JobStore::new(StorePool::open_in_memory().await.unwrap());
        let mut job = Job::new(
            PathBuf::from("/data/in/a.dcm"),
            10,
            vec!["archive".to_string(), "mirror".to_string()],
        );
        store.insert_job_enqueued(&mut job).await.unwrap();
        (
            TransitionCoordinator::new(store, EventBus::default(), EngineMetrics::new()),
            job,
        )
    }

    #[tokio::test]
    async fn test_legal_job_transition_persists_and_audits() {
        let (coordinator, job) = coordinator().await;
        let updated = coordinator
            .transition_job(&job.id, JobState::InProgress)
            .await
            .unwrap();
        assert_eq!(updated.state, JobState::InProgress);

        let events = coordinator.store().events_for_job(&job.id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.kind, kind::JOB_STATE_CHANGED);
        assert_eq!(last.payload["to"], "in_progress");
    }

    #[tokio::test]
    async fn test_illegal_job_transition_rejected_and_not_persisted() {
        let (coordinator, job) = coordinator().await;
        let err = coordinator
            .transition_job(&job.id, JobState::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidJobTransition { .. }));

        let loaded = coordinator.store().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_same_state_is_idempotent() {
        let (coordinator, job) = coordinator().await;
        let result = coordinator
            .transition_job(&job.id, JobState::Queued)
            .await
            .unwrap();
        assert_eq!(result.state, JobState::Queued);
        // No extra audit event was appended
        let events = coordinator.store().events_for_job(&job.id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_target_worker_path() {
        let (coordinator, job) = coordinator().await;
        let outcome = coordinator
            .transition_target(&job.id, "archive", TargetState::Copying, |o| {
                o.staging_path = Some(PathBuf::from("/mnt/a/.forker/tmp/x"));
                o.attempts += 1;
            })
            .await
            .unwrap();
        assert_eq!(outcome.state, TargetState::Copying);
        assert_eq!(outcome.attempts, 1);

        // Skipping Copied is illegal
        let err = coordinator
            .transition_target(&job.id, "archive", TargetState::Verified, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTargetTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_rollback_only_safe_pairs() {
        let (coordinator, job) = coordinator().await;
        coordinator
            .transition_target(&job.id, "archive", TargetState::Copying, |_| {})
            .await
            .unwrap();

        let rolled = coordinator
            .rollback_target(&job.id, "archive", TargetState::Pending)
            .await
            .unwrap();
        assert_eq!(rolled.state, TargetState::Pending);
        assert!(rolled.staging_path.is_none());

        // Pending -> Copied is not a sanctioned rollback
        let err = coordinator
            .rollback_target(&job.id, "archive", TargetState::Copied)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTargetTransition { .. }
        ));
    }
}
