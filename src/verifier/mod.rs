//! # Verification Worker
//!
//! Re-reads a finalized target file and compares a freshly computed digest
//! against the job's source digest. Trusting the copy-time hash alone is
//! not sufficient: the bytes on the destination medium are what counts.
//! Re-reads never take exclusive locks, so external consumers can keep
//! polling the finalized file during verification.

use crate::fsops;
use crate::model::{Job, TargetState};
use crate::orchestrator::{OrchestratorError, TransitionCoordinator};
use crate::store::StoreError;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Verification failures
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The finalized file could not be read back
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem contract violation
    #[error("Filesystem error: {0}")]
    Fs(#[from] fsops::FsError),

    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Guarded transition rejected or failed
    #[error("Transition error: {0}")]
    Transition(#[from] OrchestratorError),

    /// The target's bytes do not hash to the source digest
    #[error("Digest mismatch: expected {expected}, observed {observed}")]
    Mismatch {
        /// Source digest recorded on the job
        expected: String,
        /// Digest observed on the finalized file
        observed: String,
    },

    /// Job or target records are missing data verification depends on
    #[error("Verification precondition failed: {0}")]
    Precondition(String),

    /// Cooperative shutdown interrupted verification
    #[error("Verification cancelled")]
    Cancelled,
}

/// Successful verification summary
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Digest confirmed on the target
    pub digest: String,

    /// Wall-clock duration of the re-read
    pub duration: Duration,
}

/// Executes single (job, target) verifications
#[derive(Clone)]
pub struct VerifyWorker {
    coordinator: TransitionCoordinator,
    chunk_bytes: usize,
    rehash: bool,
}

impl VerifyWorker {
    /// Create a worker; `rehash=false` trusts copy-time digests and is for
    /// development only
    pub fn new(coordinator: TransitionCoordinator, chunk_bytes: usize, rehash: bool) -> Self {
        Self {
            coordinator,
            chunk_bytes: chunk_bytes.max(1),
            rehash,
        }
    }

    /// Verify one finalized target
    ///
    /// Preconditions: the target is `Copied` with a final path, and the job
    /// carries a source digest. On a match the target lands in `Verified`;
    /// a mismatch is returned for the orchestrator to quarantine.
    pub async fn run(
        &self,
        job: &Job,
        target_id: &str,
        token: &CancellationToken,
    ) -> Result<VerifyOutcome, VerifyError> {
        let expected = job.source_digest.clone().ok_or_else(|| {
            VerifyError::Precondition(format!("job {} has no source digest", job.id))
        })?;

        let outcome = self
            .coordinator
            .transition_target(&job.id, target_id, TargetState::Verifying, |_| {})
            .await?;
        let final_path = outcome.final_path.clone().ok_or_else(|| {
            VerifyError::Precondition(format!(
                "target {}/{} has no final path",
                job.id, target_id
            ))
        })?;

        let started = Instant::now();
        let observed = if self.rehash {
            match self.rehash_file(&final_path, token).await {
                Ok(digest) => digest,
                Err(VerifyError::Cancelled) => {
                    // Roll back to the nearest safe predecessor and leave
                    self.coordinator
                        .rollback_target(&job.id, target_id, TargetState::Copied)
                        .await?;
                    return Err(VerifyError::Cancelled);
                }
                Err(other) => return Err(other),
            }
        } else {
            outcome.target_digest.clone().ok_or_else(|| {
                VerifyError::Precondition(format!(
                    "target {}/{} has no copy-time digest",
                    job.id, target_id
                ))
            })?
        };

        if observed != expected {
            return Err(VerifyError::Mismatch { expected, observed });
        }

        let digest = observed.clone();
        self.coordinator
            .transition_target(&job.id, target_id, TargetState::Verified, move |o| {
                o.target_digest = Some(digest);
                o.last_error = None;
            })
            .await?;

        Ok(VerifyOutcome {
            digest: observed,
            duration: started.elapsed(),
        })
    }

    /// Stream the finalized file through the hasher, shared-read, with
    /// cancellation observed between chunks
    async fn rehash_file(
        &self,
        path: &PathBuf,
        token: &CancellationToken,
    ) -> Result<String, VerifyError> {
        let mut file = fsops::open_shared_read(path).await?;
        let mut hasher = crate::hashing::StreamingHasher::new();
        let mut buffer = vec![0u8; self.chunk_bytes];

        loop {
            if token.is_cancelled() {
                return Err(VerifyError::Cancelled);
            }
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::hashing;
    use crate::metrics::EngineMetrics;
    use crate::model::Job;
    use crate::store::{JobStore, StorePool};

    /// Seed a job whose target is already `Copied` with a finalized file
    async fn setup(payload: &[u8]) -> (VerifyWorker, Job, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("in/scan.dcm");
        tokio::fs::create_dir_all(source_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&source_path, payload).await.unwrap();

        let final_path = dir.path().join("target-a/scan.dcm");
        tokio::fs::create_dir_all(final_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&final_path, payload).await.unwrap();

        let digest = hashing::hash_file(&source_path, 1024).await.unwrap();

        let store = JobStore::new(StorePool::open_in_memory().await.unwrap());
        let mut job = Job::new(source_path, payload.len() as u64, vec!["a".to_string()]);
        store.insert_job_enqueued(&mut job).await.unwrap();
        store
            .set_source_digest_if_unset(&job.id, &digest)
            .await
            .unwrap();
        job.source_digest = Some(digest.clone());

        let coordinator =
            TransitionCoordinator::new(store, EventBus::default(), EngineMetrics::new());
        coordinator
            .transition_target(&job.id, "a", TargetState::Copying, |_| {})
            .await
            .unwrap();
        coordinator
            .transition_target(&job.id, "a", TargetState::Copied, {
                let digest = digest.clone();
                let final_path = final_path.clone();
                move |o| {
                    o.target_digest = Some(digest);
                    o.final_path = Some(final_path);
                }
            })
            .await
            .unwrap();

        (VerifyWorker::new(coordinator, 16, true), job, dir)
    }

    #[tokio::test]
    async fn test_matching_file_verifies() {
        let (worker, job, _dir) = setup(b"consistent payload").await;
        let outcome = worker
            .run(&job, "a", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(Some(outcome.digest), job.source_digest);

        let target = worker
            .coordinator
            .store()
            .get_target(&job.id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.state, TargetState::Verified);
    }

    #[tokio::test]
    async fn test_flipped_byte_is_mismatch() {
        let (worker, job, dir) = setup(b"consistent payload").await;

        // Corrupt the finalized file between copy and verify
        let final_path = dir.path().join("target-a/scan.dcm");
        let mut bytes = tokio::fs::read(&final_path).await.unwrap();
        bytes[0] ^= 0x01;
        tokio::fs::write(&final_path, &bytes).await.unwrap();

        let err = worker
            .run(&job, "a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back_to_copied() {
        let (worker, job, _dir) = setup(b"payload").await;
        let token = CancellationToken::new();
        token.cancel();

        let err = worker.run(&job, "a", &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::Cancelled));

        let target = worker
            .coordinator
            .store()
            .get_target(&job.id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.state, TargetState::Copied);
    }

    #[tokio::test]
    async fn test_missing_source_digest_is_precondition_failure() {
        let (worker, mut job, _dir) = setup(b"payload").await;
        job.source_digest = None;
        let err = worker
            .run(&job, "a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_rehash_disabled_trusts_copy_digest() {
        let (worker, job, dir) = setup(b"payload").await;
        let worker = VerifyWorker::new(worker.coordinator.clone(), 16, false);

        // Corrupt the file; with rehash off the stale digest still passes
        let final_path = dir.path().join("target-a/scan.dcm");
        tokio::fs::write(&final_path, b"corrupted").await.unwrap();

        assert!(worker.run(&job, "a", &CancellationToken::new()).await.is_ok());
    }
}
