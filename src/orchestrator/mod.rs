//! # Orchestrator
//!
//! Per-job state machine and per-target fan-out:
//! - Consumes discovery notifications and admits queued jobs under the
//!   adaptive controller's global limit
//! - Spawns one copy/verify pipeline per (job, target), bounded by a
//!   per-target semaphore so one slow destination cannot starve another
//! - Dispositions worker failures through the retry policy; integrity
//!   failures route to quarantine with no automatic retry
//! - Aggregates target completions into `Partial`, `Verified` or `Failed`
//! - Guards every transition against the tables in
//!   [`crate::model::transitions`] and audits each one exactly once
//!
//! Workers own the I/O for one (job, target); all state mutation flows
//! back through the guarded transition API.

use crate::config::EngineConfig;
use crate::copier::{CopyError, CopyWorker};
use crate::model::{kind, JobState, TargetState};
use crate::quarantine::QuarantineService;
use crate::retry::{classify, ErrorCategory, RetryPolicy};
use crate::store::StoreError;
use crate::throttle::{AdaptiveConcurrencyController, CopyPermit};
use crate::verifier::{VerifyError, VerifyWorker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod aggregate;
pub mod guard;

pub use aggregate::{aggregate_targets, JobAggregate};
pub use guard::TransitionCoordinator;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Job does not exist
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Target outcome does not exist
    #[error("Target not found: {0}/{1}")]
    TargetNotFound(String, String),

    /// Job transition missing from the transition table
    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidJobTransition {
        /// Affected job
        job_id: String,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// Target transition missing from the transition table
    #[error("Invalid target transition for {job_id}/{target_id}: {from} -> {to}")]
    InvalidTargetTransition {
        /// Affected job
        job_id: String,
        /// Affected target
        target_id: String,
        /// Current state
        from: TargetState,
        /// Requested state
        to: TargetState,
    },
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Messages consumed by the orchestrator loop
#[derive(Debug, Clone)]
pub enum OrchestratorMessage {
    /// Discovery enqueued a job
    JobQueued {
        /// The enqueued job
        job_id: String,
    },

    /// A target pipeline finished one way or another
    TargetSettled {
        /// Owning job
        job_id: String,
        /// Settled target
        target_id: String,
    },

    /// A scheduled retry delay elapsed
    RetryDue {
        /// Owning job
        job_id: String,
        /// Target to re-arm
        target_id: String,
    },
}

/// Capacity of the orchestrator inbox
const INBOX_CAPACITY: usize = 256;

/// Poll spacing while waiting for a controller admission slot
const ADMISSION_POLL: Duration = Duration::from_millis(200);

/// Shared handles for spawned pipeline tasks
pub(crate) struct WorkerContext {
    coordinator: TransitionCoordinator,
    controller: Arc<AdaptiveConcurrencyController>,
    retry_policy: RetryPolicy,
    quarantine: QuarantineService,
    copy_worker: CopyWorker,
    verify_worker: VerifyWorker,
    config: Arc<EngineConfig>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    outbox: mpsc::Sender<OrchestratorMessage>,
    token: CancellationToken,
    /// Live pipeline and retry-timer tasks, drained at shutdown
    pipeline_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerContext {
    fn context_handle(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Track a spawned pipeline or timer task so shutdown can await it
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.pipeline_tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Await every tracked task
    ///
    /// Loops because a draining task can spawn a successor (a retry timer
    /// firing just before cancellation re-arms a pipeline). Call after
    /// cancelling the shared token; workers observe it between chunks and
    /// roll back to safe states before exiting.
    pub(crate) async fn drain_tasks(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pipeline_tasks.lock());
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        log::warn!("Pipeline task ended abnormally: {}", e);
                    }
                }
            }
        }
    }

    /// Wait for a controller slot, bailing out on cancellation
    async fn wait_for_admission(&self) -> Option<CopyPermit> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            if let Some(permit) = self.controller.try_admit() {
                return Some(permit);
            }
            tokio::time::sleep(ADMISSION_POLL).await;
        }
    }

    async fn notify_settled(&self, job_id: &str, target_id: &str) {
        let _ = self
            .outbox
            .send(OrchestratorMessage::TargetSettled {
                job_id: job_id.to_string(),
                target_id: target_id.to_string(),
            })
            .await;
    }

    /// Verify-only pipeline for a target resumed in `Copied` (recovery path)
    pub(crate) async fn run_verify_pipeline(self: Arc<Self>, job_id: String, target_id: String) {
        let semaphore = match self.semaphores.get(&target_id) {
            Some(s) => Arc::clone(s),
            None => return,
        };
        let _target_slot = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        match self.coordinator.store().get_target(&job_id, &target_id).await {
            Ok(Some(outcome)) if outcome.state == TargetState::Copied => {}
            _ => return,
        }
        self.run_verify_stage(&job_id, &target_id).await;
    }

    /// Full copy-then-verify pipeline for one (job, target)
    pub(crate) async fn run_target_pipeline(self: Arc<Self>, job_id: String, target_id: String) {
        let semaphore = match self.semaphores.get(&target_id) {
            Some(s) => Arc::clone(s),
            None => {
                log::error!("No semaphore for target {}; dropping work", target_id);
                return;
            }
        };
        let _target_slot = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let job = match self.coordinator.store().get_job(&job_id).await {
            Ok(Some(job)) => job,
            _ => return,
        };
        let target_base = match self.config.targets.iter().find(|t| t.id == target_id) {
            Some(t) => t.base_path.clone(),
            None => {
                log::error!("Unknown target {} for job {}", target_id, job_id);
                return;
            }
        };

        // A stale message may race a pipeline that already ran
        match self.coordinator.store().get_target(&job_id, &target_id).await {
            Ok(Some(outcome)) if outcome.state == TargetState::Pending => {}
            _ => return,
        }

        let copy_permit = match self.wait_for_admission().await {
            Some(permit) => permit,
            None => return,
        };
        let copy_result = self
            .copy_worker
            .run(&job, &target_id, &target_base, &self.token)
            .await;
        drop(copy_permit);

        match copy_result {
            Ok(outcome) => {
                self.coordinator
                    .metrics()
                    .record_bytes_copied(outcome.bytes_copied);
                self.controller.record_copy_latency(outcome.duration);
                self.controller.record_io_ops(outcome.io_ops);
                self.run_verify_stage(&job_id, &target_id).await;
            }
            Err(error) => self.handle_copy_failure(&job_id, &target_id, error).await,
        }
    }

    /// Verification stage; shares the controller with the copy stage
    async fn run_verify_stage(&self, job_id: &str, target_id: &str) {
        // Reload: the copy stage set the source digest
        let job = match self.coordinator.store().get_job(job_id).await {
            Ok(Some(job)) => job,
            _ => return,
        };

        let permit = match self.wait_for_admission().await {
            Some(permit) => permit,
            None => return,
        };
        let result = self.verify_worker.run(&job, target_id, &self.token).await;
        drop(permit);

        match result {
            Ok(outcome) => {
                log::info!(
                    "Target {}/{} verified in {:?}",
                    job_id,
                    target_id,
                    outcome.duration
                );
                self.notify_settled(job_id, target_id).await;
            }
            Err(VerifyError::Mismatch { expected, observed }) => {
                if let Err(e) = self
                    .quarantine
                    .raise(
                        job_id,
                        target_id,
                        "digest mismatch at verification",
                        Some(expected),
                        Some(observed),
                    )
                    .await
                {
                    log::error!("Failed to quarantine job {}: {}", job_id, e);
                }
                self.notify_settled(job_id, target_id).await;
            }
            Err(VerifyError::Cancelled) => {
                // The worker already rolled back to Copied
            }
            Err(error) => {
                let category = match &error {
                    VerifyError::Io(e) => crate::retry::categorize_io(e),
                    VerifyError::Fs(crate::fsops::FsError::Io(e)) => {
                        crate::retry::categorize_io(e)
                    }
                    _ => ErrorCategory::Uncategorized,
                };
                self.disposition_failure(
                    job_id,
                    target_id,
                    category,
                    "verify",
                    &error.to_string(),
                )
                .await;
            }
        }
    }

    /// Disposition a failed copy according to the error taxonomy
    async fn handle_copy_failure(&self, job_id: &str, target_id: &str, error: CopyError) {
        match &error {
            CopyError::Cancelled => {
                // Roll back to the nearest safe predecessor; staging is
                // already removed
                if let Err(e) = self
                    .coordinator
                    .rollback_target(job_id, target_id, TargetState::Pending)
                    .await
                {
                    log::warn!("Rollback after cancel failed for {}/{}: {}", job_id, target_id, e);
                }
            }
            CopyError::Integrity { expected, observed } => {
                if let Err(e) = self
                    .quarantine
                    .raise(
                        job_id,
                        target_id,
                        "digest mismatch at copy",
                        Some(expected.clone()),
                        Some(observed.clone()),
                    )
                    .await
                {
                    log::error!("Failed to quarantine job {}: {}", job_id, e);
                }
                self.notify_settled(job_id, target_id).await;
            }
            _ => {
                if error.is_security_violation() {
                    let _ = self
                        .coordinator
                        .store()
                        .append_event(
                            job_id,
                            kind::SECURITY_VIOLATION,
                            serde_json::json!({
                                "target_id": target_id,
                                "error": error.to_string(),
                            }),
                        )
                        .await;
                }
                self.disposition_failure(
                    job_id,
                    target_id,
                    error.category(),
                    error.reason_tag(),
                    &error.to_string(),
                )
                .await;
            }
        }
    }

    /// Apply retry policy to a non-integrity failure
    async fn disposition_failure(
        &self,
        job_id: &str,
        target_id: &str,
        category: ErrorCategory,
        reason_tag: &str,
        error_text: &str,
    ) {
        let attempts = match self.coordinator.store().get_target(job_id, target_id).await {
            Ok(Some(outcome)) => outcome.attempts,
            _ => {
                log::error!("Lost target {}/{} during failure handling", job_id, target_id);
                return;
            }
        };

        let class = classify(category);
        let text = error_text.to_string();
        if self.retry_policy.may_retry(class, attempts) {
            let delay = self.retry_policy.delay_with_jitter(attempts, category);
            let transitioned = self
                .coordinator
                .transition_target(job_id, target_id, TargetState::FailedRetryable, move |o| {
                    o.last_error = Some(text);
                })
                .await;
            if let Err(e) = transitioned {
                log::error!("Failed to mark {}/{} retryable: {}", job_id, target_id, e);
                return;
            }

            self.coordinator.metrics().record_retry(reason_tag);
            let _ = self
                .coordinator
                .store()
                .append_event(
                    job_id,
                    kind::RETRY_SCHEDULED,
                    serde_json::json!({
                        "target_id": target_id,
                        "attempt": attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "reason": reason_tag,
                    }),
                )
                .await;
            log::warn!(
                "Target {}/{} failed ({}); retry {} in {:?}",
                job_id,
                target_id,
                reason_tag,
                attempts + 1,
                delay
            );

            // Timer task; the loop re-arms the target when it fires
            let outbox = self.outbox.clone();
            let token = self.token.clone();
            let job_id = job_id.to_string();
            let target_id = target_id.to_string();
            self.track(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = outbox
                            .send(OrchestratorMessage::RetryDue { job_id, target_id })
                            .await;
                    }
                }
            }));
        } else {
            let transitioned = self
                .coordinator
                .transition_target(job_id, target_id, TargetState::FailedPermanent, move |o| {
                    o.last_error = Some(text);
                })
                .await;
            if let Err(e) = transitioned {
                log::error!("Failed to mark {}/{} permanent: {}", job_id, target_id, e);
            }
            self.coordinator.metrics().record_copy_failure(reason_tag);
            log::error!(
                "Target {}/{} failed permanently after {} attempts ({})",
                job_id,
                target_id,
                attempts,
                reason_tag
            );
            self.notify_settled(job_id, target_id).await;
        }
    }
}

/// Long-lived orchestration loop
pub struct Orchestrator {
    context: Arc<WorkerContext>,
    inbox: mpsc::Receiver<OrchestratorMessage>,
}

impl Orchestrator {
    /// Build the orchestrator and the sender side of its inbox
    pub fn new(
        coordinator: TransitionCoordinator,
        controller: Arc<AdaptiveConcurrencyController>,
        quarantine: QuarantineService,
        config: Arc<EngineConfig>,
        token: CancellationToken,
    ) -> (Self, mpsc::Sender<OrchestratorMessage>) {
        let (outbox, inbox) = mpsc::channel(INBOX_CAPACITY);

        let semaphores = config
            .targets
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    Arc::new(Semaphore::new(config.per_target_limit(&t.id))),
                )
            })
            .collect();

        let copy_worker = CopyWorker::new(coordinator.clone(), config.chunk_bytes);
        let verify_worker =
            VerifyWorker::new(coordinator.clone(), config.chunk_bytes, config.verify.rehash);

        let context = Arc::new(WorkerContext {
            coordinator,
            controller,
            retry_policy: RetryPolicy::new(config.retry.clone()),
            quarantine,
            copy_worker,
            verify_worker,
            config,
            semaphores,
            outbox: outbox.clone(),
            token,
            pipeline_tasks: Mutex::new(Vec::new()),
        });

        (Self { context, inbox }, outbox)
    }

    /// Shared worker context; the engine holds it to drain pipeline tasks
    /// at shutdown
    pub(crate) fn context(&self) -> Arc<WorkerContext> {
        Arc::clone(&self.context)
    }

    /// Run until cancelled, consuming messages and admitting queued jobs
    pub async fn run(mut self) {
        log::info!("Orchestrator started");
        let mut admission_tick = tokio::time::interval(Duration::from_secs(1));
        admission_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.context.token.cancelled() => break,
                _ = admission_tick.tick() => {
                    if let Err(e) = self.admit_queued().await {
                        log::error!("Admission sweep failed: {}", e);
                    }
                }
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        log::info!("Orchestrator stopped");
    }

    async fn handle(&self, message: OrchestratorMessage) {
        match message {
            OrchestratorMessage::JobQueued { job_id } => {
                if let Err(e) = self.admit_job(&job_id).await {
                    log::error!("Failed to admit job {}: {}", job_id, e);
                }
            }
            OrchestratorMessage::TargetSettled { job_id, .. } => {
                if let Err(e) = self.aggregate_job(&job_id).await {
                    log::error!("Aggregation failed for job {}: {}", job_id, e);
                }
            }
            OrchestratorMessage::RetryDue { job_id, target_id } => {
                if let Err(e) = self.rearm_target(&job_id, &target_id).await {
                    log::error!(
                        "Failed to re-arm target {}/{}: {}",
                        job_id,
                        target_id,
                        e
                    );
                }
            }
        }
    }

    /// Admit queued jobs while the controller has free slots
    pub(crate) async fn admit_queued(&self) -> OrchestratorResult<()> {
        let queued = self
            .context
            .coordinator
            .store()
            .jobs_by_state(JobState::Queued)
            .await?;

        for job in queued {
            if self.context.controller.in_flight() >= self.context.controller.current() {
                break;
            }
            self.admit_job(&job.id).await?;
        }
        Ok(())
    }

    /// Move one job to `InProgress` and fan out its pending targets
    ///
    /// Admission runs only on the orchestrator task, so checking the state
    /// first is race-free; a job the admission sweep already picked up is
    /// not fanned out a second time when its discovery message arrives.
    pub(crate) async fn admit_job(&self, job_id: &str) -> OrchestratorResult<()> {
        match self.context.coordinator.store().get_job(job_id).await? {
            Some(job) if job.state == JobState::Queued => {}
            _ => return Ok(()),
        }
        let job = self
            .context
            .coordinator
            .transition_job(job_id, JobState::InProgress)
            .await?;

        let targets = self
            .context
            .coordinator
            .store()
            .targets_for_job(job_id)
            .await?;
        for target in targets {
            match target.state {
                TargetState::Pending => {
                    self.context.track(tokio::spawn(
                        self.context
                            .context_handle()
                            .run_target_pipeline(job.id.clone(), target.target_id.clone()),
                    ));
                }
                // A target resumed after restart advances straight to
                // verification
                TargetState::Copied => {
                    self.context.track(tokio::spawn(
                        self.context
                            .context_handle()
                            .run_verify_pipeline(job.id.clone(), target.target_id.clone()),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-arm a retryable target and restart its pipeline
    pub(crate) async fn rearm_target(
        &self,
        job_id: &str,
        target_id: &str,
    ) -> OrchestratorResult<()> {
        // Quarantine may have intervened while the retry timer ran
        let job = self
            .context
            .coordinator
            .store()
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        if job.state == JobState::Quarantined || job.state.is_terminal() {
            return Ok(());
        }

        self.context
            .coordinator
            .transition_target(job_id, target_id, TargetState::Pending, |_| {})
            .await?;
        self.context.track(tokio::spawn(
            self.context
                .context_handle()
                .run_target_pipeline(job_id.to_string(), target_id.to_string()),
        ));
        Ok(())
    }

    /// Recompute a job's aggregate state from its targets
    pub(crate) async fn aggregate_job(&self, job_id: &str) -> OrchestratorResult<()> {
        let job = self
            .context
            .coordinator
            .store()
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

        // Quarantined and terminal jobs are settled; nothing to aggregate
        if job.state == JobState::Quarantined || job.state.is_terminal() {
            return Ok(());
        }

        let targets = self
            .context
            .coordinator
            .store()
            .targets_for_job(job_id)
            .await?;

        match aggregate_targets(&targets) {
            JobAggregate::Verified => {
                // Belt and braces: a verified job requires every target
                // digest to equal the source digest
                let source_digest = job.source_digest.as_deref();
                let all_match = source_digest.is_some()
                    && targets
                        .iter()
                        .all(|t| t.target_digest.as_deref() == source_digest);
                if !all_match {
                    log::error!(
                        "Job {} has verified targets with divergent digests; refusing promotion",
                        job_id
                    );
                    return Ok(());
                }
                self.context
                    .coordinator
                    .transition_job(job_id, JobState::Verified)
                    .await?;
                log::info!("Job {} verified on all targets", job_id);
            }
            JobAggregate::Partial => {
                if job.state == JobState::InProgress {
                    self.context
                        .coordinator
                        .transition_job(job_id, JobState::Partial)
                        .await?;
                }
            }
            JobAggregate::Failed => {
                self.context
                    .coordinator
                    .transition_job(job_id, JobState::Failed)
                    .await?;
                log::warn!("Job {} failed", job_id);
            }
            JobAggregate::InFlight => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, TargetConfig};
    use crate::events::EventBus;
    use crate::metrics::EngineMetrics;
    use crate::model::Job;
    use crate::store::{JobStore, StorePool};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        orchestrator: Orchestrator,
        #[allow(dead_code)]
        outbox: mpsc::Sender<OrchestratorMessage>,
        store: JobStore,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("a")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("b")).await.unwrap();

        let config = Arc::new(EngineConfig {
            source_roots: vec![dir.path().join("in")],
            targets: vec![
                TargetConfig {
                    id: "a".into(),
                    base_path: dir.path().join("a"),
                    max_concurrent_copies: None,
                },
                TargetConfig {
                    id: "b".into(),
                    base_path: dir.path().join("b"),
                    max_concurrent_copies: None,
                },
            ],
            chunk_bytes: 64,
            ..EngineConfig::default()
        });

        let store = JobStore::new(StorePool::open_in_memory().await.unwrap());
        let metrics = EngineMetrics::new();
        let coordinator =
            TransitionCoordinator::new(store.clone(), EventBus::default(), Arc::clone(&metrics));
        let controller = AdaptiveConcurrencyController::new(
            config.throttle.clone(),
            config.concurrency.global_max,
            metrics,
        );
        let quarantine = QuarantineService::new(
            coordinator.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        let (orchestrator, outbox) = Orchestrator::new(
            coordinator,
            controller,
            quarantine,
            Arc::clone(&config),
            CancellationToken::new(),
        );

        Fixture {
            orchestrator,
            outbox,
            store,
            dir,
        }
    }

    async fn seed_job(fixture: &Fixture, name: &str, payload: &[u8]) -> Job {
        let source = fixture.dir.path().join("in").join(name);
        tokio::fs::write(&source, payload).await.unwrap();
        let mut job = Job::new(
            source,
            payload.len() as u64,
            vec!["a".to_string(), "b".to_string()],
        );
        fixture.store.insert_job_enqueued(&mut job).await.unwrap();
        job
    }

    /// Drain settle messages and aggregate until the job stops moving
    async fn settle(fixture: &mut Fixture, job_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = fixture.store.get_job(job_id).await.unwrap().unwrap();
            if job.state.is_terminal() || job.state == JobState::Quarantined {
                return;
            }
            tokio::select! {
                Some(message) = fixture.orchestrator.inbox.recv() => {
                    fixture.orchestrator.handle(message).await;
                }
                _ = tokio::time::sleep_until(deadline) => panic!("job never settled"),
            }
        }
    }

    #[tokio::test]
    async fn test_happy_path_verifies_both_targets() {
        let mut fixture = fixture().await;
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let job = seed_job(&fixture, "scan.dcm", &payload).await;

        fixture.orchestrator.admit_queued().await.unwrap();
        settle(&mut fixture, &job.id).await;

        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Verified);

        for target in ["a", "b"] {
            let outcome = fixture
                .store
                .get_target(&job.id, target)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome.state, TargetState::Verified);
            assert_eq!(outcome.target_digest, stored.source_digest);

            let copied = tokio::fs::read(fixture.dir.path().join(target).join("scan.dcm"))
                .await
                .unwrap();
            assert_eq!(copied, payload);
        }

        // Both targets' bytes count toward the monotonic counter
        let metrics = fixture
            .orchestrator
            .context
            .coordinator
            .metrics()
            .snapshot();
        assert_eq!(metrics.bytes_copied, payload.len() as u64 * 2);
        assert_eq!(metrics.hash_mismatches, 0);

        // The audit trail alone tells the whole story, in order
        let events = fixture.store.events_for_job(&job.id).await.unwrap();
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        let job_states: Vec<String> = events
            .iter()
            .filter(|e| e.kind == kind::JOB_STATE_CHANGED)
            .map(|e| e.payload["to"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(job_states.first().map(String::as_str), Some("queued"));
        assert_eq!(job_states.last().map(String::as_str), Some("verified"));
    }

    #[tokio::test]
    async fn test_missing_source_eventually_fails_job() {
        let mut fixture = fixture().await;
        let mut job = Job::new(
            fixture.dir.path().join("in/ghost.dcm"),
            10,
            vec!["a".to_string(), "b".to_string()],
        );
        fixture.store.insert_job_enqueued(&mut job).await.unwrap();

        fixture.orchestrator.admit_queued().await.unwrap();
        settle(&mut fixture, &job.id).await;

        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);

        for target in ["a", "b"] {
            let outcome = fixture
                .store
                .get_target(&job.id, target)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome.state, TargetState::FailedPermanent);
            assert!(outcome.last_error.is_some());
        }
    }

    #[tokio::test]
    async fn test_aggregation_waits_for_all_fates() {
        let fixture = fixture().await;
        let job = seed_job(&fixture, "scan.dcm", b"payload").await;
        fixture
            .orchestrator
            .context
            .coordinator
            .transition_job(&job.id, JobState::InProgress)
            .await
            .unwrap();

        // One target verified, the other still pending -> Partial
        let coordinator = &fixture.orchestrator.context.coordinator;
        coordinator
            .transition_target(&job.id, "a", TargetState::Copying, |_| {})
            .await
            .unwrap();
        coordinator
            .transition_target(&job.id, "a", TargetState::Copied, |o| {
                o.target_digest = Some("d".repeat(64));
            })
            .await
            .unwrap();
        coordinator
            .transition_target(&job.id, "a", TargetState::Verifying, |_| {})
            .await
            .unwrap();
        coordinator
            .transition_target(&job.id, "a", TargetState::Verified, |_| {})
            .await
            .unwrap();

        fixture.orchestrator.aggregate_job(&job.id).await.unwrap();
        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Partial);
    }

    #[tokio::test]
    async fn test_drain_waits_for_tracked_tasks() {
        use std::sync::atomic::Ordering;

        let fixture = fixture().await;
        let context = fixture.orchestrator.context();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        context.track(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::Release);
        }));

        context.drain_tasks().await;
        assert!(finished.load(Ordering::Acquire));
        // A second drain with nothing tracked returns immediately
        context.drain_tasks().await;
    }

    #[tokio::test]
    async fn test_rearm_skips_quarantined_jobs() {
        let fixture = fixture().await;
        let job = seed_job(&fixture, "scan.dcm", b"payload").await;
        let coordinator = &fixture.orchestrator.context.coordinator;
        coordinator
            .transition_job(&job.id, JobState::InProgress)
            .await
            .unwrap();
        coordinator
            .transition_job(&job.id, JobState::Quarantined)
            .await
            .unwrap();

        // The retry timer fired after quarantine; nothing must move
        fixture
            .orchestrator
            .rearm_target(&job.id, "a")
            .await
            .unwrap();
        let outcome = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        assert_eq!(outcome.state, TargetState::Pending);
    }
}
