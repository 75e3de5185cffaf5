//! # Startup Recovery
//!
//! Runs once before discovery and orchestration begin, reconciling
//! persisted state with what is actually on disk:
//! - Targets caught in `Copying`/`Verifying` lose their (dead) worker: a
//!   finalized file whose digest matches the source promotes the target to
//!   `Verified`; otherwise staging and stray final files are deleted and
//!   the target resets to `Pending`
//! - `Copied`, `Verified`, `FailedRetryable` and `FailedPermanent` targets
//!   are kept as recorded
//! - Orphan staging artifacts that match no recorded staging path are
//!   swept away
//! - Job aggregate states are recomputed; jobs with work remaining are
//!   requeued, quarantined jobs stay quarantined
//!
//! Recovery writes below the orchestrator's transition guard: it is the
//! pre-runtime reconciliation authority, and the filesystem is ground
//! truth. Re-running it after a completed pass changes nothing.

use crate::config::EngineConfig;
use crate::fsops::{self, FsError};
use crate::hashing;
use crate::model::{kind, Job, JobState, TargetOutcome, TargetState};
use crate::orchestrator::{aggregate_targets, JobAggregate};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Recovery errors
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Filesystem failure
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Summary of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Non-terminal jobs examined
    pub jobs_examined: usize,

    /// Targets reset from `Copying`/`Verifying` to `Pending`
    pub targets_reset: usize,

    /// Targets promoted to `Verified` from a matching finalized file
    pub targets_promoted: usize,

    /// Jobs requeued for further work
    pub jobs_requeued: usize,

    /// Jobs promoted to a terminal state by aggregation
    pub jobs_settled: usize,

    /// Orphan staging files deleted
    pub orphans_removed: usize,
}

/// One-shot reconciliation of store state against the filesystem
pub struct RecoveryRoutine {
    store: JobStore,
    config: Arc<EngineConfig>,
    active: Arc<AtomicBool>,
}

impl RecoveryRoutine {
    /// Create the routine; `active` is shared with quarantine release,
    /// which is refused while recovery runs
    pub fn new(store: JobStore, config: Arc<EngineConfig>, active: Arc<AtomicBool>) -> Self {
        Self {
            store,
            config,
            active,
        }
    }

    /// Run one full recovery pass
    pub async fn run(&self) -> RecoveryResult<RecoveryReport> {
        self.active.store(true, Ordering::Release);
        let result = self.reconcile().await;
        self.active.store(false, Ordering::Release);
        result
    }

    async fn reconcile(&self) -> RecoveryResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let jobs = self.store.jobs_non_terminal().await?;
        report.jobs_examined = jobs.len();
        log::info!("Recovery examining {} non-terminal job(s)", jobs.len());

        let mut recorded_staging: HashSet<PathBuf> = HashSet::new();

        for job in jobs {
            let targets = self.store.targets_for_job(&job.id).await?;
            for outcome in &targets {
                if let Some(staging) = &outcome.staging_path {
                    recorded_staging.insert(staging.clone());
                }
            }

            // Quarantine is sticky; recovery never touches those jobs
            if job.state == JobState::Quarantined {
                continue;
            }

            for outcome in targets {
                match outcome.state {
                    TargetState::Copying | TargetState::Verifying => {
                        self.reconcile_interrupted(&job, outcome, &mut report)
                            .await?;
                    }
                    // Copied advances to verification once orchestration
                    // resumes; the failure states keep their records
                    _ => {}
                }
            }

            self.settle_job(&job.id, &mut report).await?;
        }

        report.orphans_removed = self.sweep_orphans(&recorded_staging).await?;
        log::info!(
            "Recovery complete: {} reset, {} promoted, {} requeued, {} settled, {} orphans removed",
            report.targets_reset,
            report.targets_promoted,
            report.jobs_requeued,
            report.jobs_settled,
            report.orphans_removed
        );
        Ok(report)
    }

    /// Reconcile a target whose worker died mid-copy or mid-verify
    async fn reconcile_interrupted(
        &self,
        job: &Job,
        mut outcome: TargetOutcome,
        report: &mut RecoveryReport,
    ) -> RecoveryResult<()> {
        // Remove the half-written staging file first
        if let Some(staging) = outcome.staging_path.take() {
            if let Err(e) = fsops::remove_file_if_exists(&staging).await {
                log::warn!(
                    "Failed to remove staging {} during recovery: {}",
                    staging.display(),
                    e
                );
            }
        }

        // A finalized file may exist even though the state says otherwise
        // (crash between rename and commit); the filesystem wins
        if let Some(final_path) = outcome.final_path.clone() {
            if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
                if let Some(expected) = self.expected_digest(job).await {
                    let observed = hashing::hash_file(&final_path, self.config.chunk_bytes)
                        .await
                        .ok();
                    if observed.as_deref() == Some(expected.as_str()) {
                        self.store
                            .set_source_digest_if_unset(&job.id, &expected)
                            .await?;
                        outcome.state = TargetState::Verified;
                        outcome.target_digest = Some(expected);
                        outcome.updated_at = Utc::now();
                        self.store.save_target(&outcome).await?;
                        self.store
                            .append_event(
                                &job.id,
                                kind::RECOVERY_RECONCILED,
                                serde_json::json!({
                                    "target_id": outcome.target_id,
                                    "resolution": "finalized_file_verified",
                                }),
                            )
                            .await?;
                        report.targets_promoted += 1;
                        log::info!(
                            "Recovery promoted {}/{}: finalized file matches source",
                            job.id,
                            outcome.target_id
                        );
                        return Ok(());
                    }
                }
                // Unverifiable or divergent finalized file: delete and
                // restart the copy from zero
                if let Err(e) = fsops::remove_file_if_exists(&final_path).await {
                    log::warn!(
                        "Failed to remove divergent final {} during recovery: {}",
                        final_path.display(),
                        e
                    );
                }
            }
        }

        let from = outcome.state;
        outcome.state = TargetState::Pending;
        outcome.updated_at = Utc::now();
        self.store.save_target(&outcome).await?;
        self.store
            .append_event(
                &job.id,
                kind::RECOVERY_RECONCILED,
                serde_json::json!({
                    "target_id": outcome.target_id,
                    "resolution": "reset_to_pending",
                    "from": from.as_str(),
                }),
            )
            .await?;
        report.targets_reset += 1;
        Ok(())
    }

    /// Digest every target must match: the recorded source digest, or a
    /// fresh hash of the source file when none was persisted yet
    async fn expected_digest(&self, job: &Job) -> Option<String> {
        if let Some(digest) = &job.source_digest {
            return Some(digest.clone());
        }
        match hashing::hash_file(&job.source_path, self.config.chunk_bytes).await {
            Ok(digest) => Some(digest),
            Err(e) => {
                log::warn!(
                    "Cannot re-hash source {} during recovery: {}",
                    job.source_path.display(),
                    e
                );
                None
            }
        }
    }

    /// Recompute one job's aggregate state and persist the verdict
    async fn settle_job(&self, job_id: &str, report: &mut RecoveryReport) -> RecoveryResult<()> {
        let mut job = match self.store.get_job(job_id).await? {
            Some(job) => job,
            None => return Ok(()),
        };
        let targets = self.store.targets_for_job(job_id).await?;

        let next_state = match aggregate_targets(&targets) {
            JobAggregate::Verified => JobState::Verified,
            JobAggregate::Failed => JobState::Failed,
            // Work remains; hand the job back to the admission queue
            JobAggregate::Partial | JobAggregate::InFlight => JobState::Queued,
        };

        if job.state == next_state {
            return Ok(());
        }

        let from = job.state;
        job.state = next_state;
        self.store.update_job_cas(&mut job).await?;
        self.store
            .append_event(
                job_id,
                kind::JOB_STATE_CHANGED,
                serde_json::json!({
                    "from": from.as_str(),
                    "to": next_state.as_str(),
                    "recovery": true,
                }),
            )
            .await?;

        if next_state.is_terminal() {
            report.jobs_settled += 1;
        } else {
            report.jobs_requeued += 1;
        }
        Ok(())
    }

    /// Delete staging artifacts that match no recorded staging path
    async fn sweep_orphans(&self, recorded: &HashSet<PathBuf>) -> RecoveryResult<usize> {
        let mut removed = 0;
        for target in &self.config.targets {
            let staged = match fsops::list_staging_files(&target.base_path).await {
                Ok(staged) => staged,
                Err(e) => {
                    log::warn!(
                        "Cannot sweep staging space of target {}: {}",
                        target.id,
                        e
                    );
                    continue;
                }
            };
            for path in staged {
                if recorded.contains(&path) {
                    continue;
                }
                match fsops::remove_file_if_exists(&path).await {
                    Ok(()) => {
                        removed += 1;
                        log::info!("Removed orphan staging file {}", path.display());
                        // The per-job staging layout makes the owning job
                        // id the parent directory name
                        if let Some(job_dir) = path.parent() {
                            if let Some(job_id) = job_dir.file_name().and_then(|n| n.to_str()) {
                                let _ = self
                                    .store
                                    .append_event(
                                        job_id,
                                        kind::RECOVERY_ORPHAN_REMOVED,
                                        serde_json::json!({
                                            "path": path.display().to_string(),
                                            "target_id": target.id,
                                        }),
                                    )
                                    .await;
                            }
                            let _ = tokio::fs::remove_dir(job_dir).await;
                        }
                    }
                    Err(e) => {
                        log::warn!("Failed to remove orphan {}: {}", path.display(), e)
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::store::StorePool;

    struct Fixture {
        routine: RecoveryRoutine,
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
        let routine = RecoveryRoutine::new(
            store.clone(),
            config,
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            routine,
            store,
            dir,
        }
    }

    /// Seed an `InProgress` job with one target frozen mid-copy
    async fn seed_interrupted(fixture: &Fixture, payload: &[u8]) -> (Job, PathBuf) {
        let source = fixture.dir.path().join("in/scan.dcm");
        tokio::fs::write(&source, payload).await.unwrap();

        let mut job = Job::new(
            source,
            payload.len() as u64,
            vec!["a".to_string(), "b".to_string()],
        );
        fixture.store.insert_job_enqueued(&mut job).await.unwrap();
        job.state = JobState::InProgress;
        fixture.store.update_job_cas(&mut job).await.unwrap();

        let staging = fsops::staging_path(&fixture.dir.path().join("a"), &job.id, "scan.dcm");
        tokio::fs::create_dir_all(staging.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&staging, &payload[..payload.len() / 2])
            .await
            .unwrap();

        let mut outcome = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        outcome.state = TargetState::Copying;
        outcome.attempts = 1;
        outcome.staging_path = Some(staging.clone());
        outcome.final_path = Some(fixture.dir.path().join("a/scan.dcm"));
        fixture.store.save_target(&outcome).await.unwrap();

        (job, staging)
    }

    #[tokio::test]
    async fn test_crash_mid_copy_resets_and_requeues() {
        let fixture = fixture().await;
        let (job, staging) = seed_interrupted(&fixture, b"half copied payload bytes").await;

        let report = fixture.routine.run().await.unwrap();

        assert_eq!(report.targets_reset, 1);
        assert_eq!(report.jobs_requeued, 1);
        assert!(!staging.exists());

        let target = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Pending);
        assert!(target.staging_path.is_none());

        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_finalized_file_promotes_without_recopy() {
        let fixture = fixture().await;
        let payload = b"finalized before the state was persisted";
        let (job, _staging) = seed_interrupted(&fixture, payload).await;

        // Crash happened after rename: the final file is complete
        tokio::fs::write(fixture.dir.path().join("a/scan.dcm"), payload)
            .await
            .unwrap();

        let report = fixture.routine.run().await.unwrap();
        assert_eq!(report.targets_promoted, 1);
        assert_eq!(report.targets_reset, 0);

        let target = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Verified);

        // The source digest was recovered from the source file itself
        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert!(stored.source_digest.is_some());
        assert_eq!(target.target_digest, stored.source_digest);

        // The sibling target still has work, so the job is requeued
        assert_eq!(stored.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_divergent_finalized_file_deleted_and_reset() {
        let fixture = fixture().await;
        let (job, _staging) = seed_interrupted(&fixture, b"the real payload").await;

        tokio::fs::write(fixture.dir.path().join("a/scan.dcm"), b"corrupted junk")
            .await
            .unwrap();

        let report = fixture.routine.run().await.unwrap();
        assert_eq!(report.targets_promoted, 0);
        assert_eq!(report.targets_reset, 1);
        assert!(!fixture.dir.path().join("a/scan.dcm").exists());

        let target = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Pending);
    }

    #[tokio::test]
    async fn test_orphan_staging_swept() {
        let fixture = fixture().await;
        let orphan =
            fsops::staging_path(&fixture.dir.path().join("b"), "dead-job", "ghost.dcm");
        tokio::fs::create_dir_all(orphan.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&orphan, b"debris").await.unwrap();

        let report = fixture.routine.run().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let fixture = fixture().await;
        let (_job, _staging) = seed_interrupted(&fixture, b"payload").await;

        fixture.routine.run().await.unwrap();
        let second = fixture.routine.run().await.unwrap();

        assert_eq!(second.targets_reset, 0);
        assert_eq!(second.targets_promoted, 0);
        assert_eq!(second.jobs_requeued, 0);
        assert_eq!(second.jobs_settled, 0);
        assert_eq!(second.orphans_removed, 0);
    }

    #[tokio::test]
    async fn test_quarantined_jobs_untouched() {
        let fixture = fixture().await;
        let (mut job, staging) = seed_interrupted(&fixture, b"payload").await;
        job.state = JobState::Quarantined;
        fixture.store.update_job_cas(&mut job).await.unwrap();

        fixture.routine.run().await.unwrap();

        let stored = fixture.store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Quarantined);
        let target = fixture.store.get_target(&job.id, "a").await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Copying);
        // Its staging file is not treated as an orphan either
        assert!(staging.exists());
    }
}
