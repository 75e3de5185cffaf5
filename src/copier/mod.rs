//! # Copy Worker
//!
//! Streams one source file to one target's staging path while hashing on
//! the fly, then finalizes with an atomic same-volume rename:
//! 1. `Pending -> Copying`, staging and final paths persisted
//! 2. Chunked read/hash/write loop, cancellation observed between chunks
//! 3. Flush to disk, close, rename staging -> final
//! 4. First completed copy sets the job's source digest (first setter
//!    wins); later copies compare against it and a divergence is an
//!    integrity failure
//! 5. `Copying -> Copied` with the target digest persisted
//!
//! The staging file is removed on every failure path.

use crate::fsops::{self, FsError};
use crate::hashing::StreamingHasher;
use crate::model::{Job, TargetState};
use crate::orchestrator::{OrchestratorError, TransitionCoordinator};
use crate::retry::ErrorCategory;
use crate::store::StoreError;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Copy failures
#[derive(Debug, Error)]
pub enum CopyError {
    /// Filesystem contract violation
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    /// Raw I/O failure in the chunk loop
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store failure while persisting progress
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Guarded transition rejected or failed
    #[error("Transition error: {0}")]
    Transition(#[from] OrchestratorError),

    /// This copy's bytes do not match the job's recorded source digest
    #[error("Integrity failure: expected {expected}, observed {observed}")]
    Integrity {
        /// Digest recorded on the job
        expected: String,
        /// Digest this copy produced
        observed: String,
    },

    /// Cooperative shutdown interrupted the copy
    #[error("Copy cancelled")]
    Cancelled,
}

impl From<StoreError> for CopyError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::DigestConflict {
                existing,
                attempted,
                ..
            } => CopyError::Integrity {
                expected: existing,
                observed: attempted,
            },
            other => CopyError::Store(other),
        }
    }
}

impl CopyError {
    /// Retry-policy category for this failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            CopyError::Io(e) => crate::retry::categorize_io(e),
            CopyError::Fs(FsError::Io(e)) => crate::retry::categorize_io(e),
            CopyError::Fs(FsError::CrossVolumeRename { .. }) => ErrorCategory::AccessDenied,
            CopyError::Fs(FsError::PathOutsideRoot(_))
            | CopyError::Fs(FsError::SymlinkRejected(_)) => ErrorCategory::AccessDenied,
            // The name belongs to another finalized copy; retrying would
            // fight over it, so the target fails permanently
            CopyError::Fs(FsError::FinalPathOccupied(_)) => ErrorCategory::AccessDenied,
            CopyError::Fs(FsError::InvalidPattern(_)) => ErrorCategory::Uncategorized,
            CopyError::Integrity { .. } => ErrorCategory::InvariantViolation,
            CopyError::Store(_) | CopyError::Transition(_) => ErrorCategory::Uncategorized,
            CopyError::Cancelled => ErrorCategory::Uncategorized,
        }
    }

    /// Whether this failure is a security violation worth a security event
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            CopyError::Fs(FsError::PathOutsideRoot(_)) | CopyError::Fs(FsError::SymlinkRejected(_))
        )
    }

    /// Stable reason tag for metrics
    pub fn reason_tag(&self) -> &'static str {
        match self {
            CopyError::Fs(FsError::CrossVolumeRename { .. }) => "cross_volume_rename",
            CopyError::Fs(FsError::PathOutsideRoot(_)) => "path_outside_root",
            CopyError::Fs(FsError::FinalPathOccupied(_)) => "final_path_occupied",
            CopyError::Fs(_) => "fs",
            CopyError::Io(_) => "io",
            CopyError::Store(_) => "store",
            CopyError::Transition(_) => "transition",
            CopyError::Integrity { .. } => "integrity",
            CopyError::Cancelled => "cancelled",
        }
    }
}

/// Successful copy summary
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    /// Digest of the bytes this copy streamed
    pub digest: String,

    /// Bytes written to the target
    pub bytes_copied: u64,

    /// Chunk-level I/O operations performed
    pub io_ops: u64,

    /// Wall-clock duration of the copy
    pub duration: Duration,
}

/// Executes single (job, target) copies
#[derive(Clone)]
pub struct CopyWorker {
    coordinator: TransitionCoordinator,
    chunk_bytes: usize,
}

impl CopyWorker {
    /// Create a worker bound to the transition coordinator
    pub fn new(coordinator: TransitionCoordinator, chunk_bytes: usize) -> Self {
        Self {
            coordinator,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Copy one job's source to one target
    ///
    /// Preconditions: the target outcome is `Pending`, the source exists.
    /// On success the target is `Copied` with its digest and final path
    /// persisted. On failure the staging file is removed and the target is
    /// left in `Copying` for the orchestrator to disposition.
    pub async fn run(
        &self,
        job: &Job,
        target_id: &str,
        target_base: &Path,
        token: &CancellationToken,
    ) -> Result<CopyOutcome, CopyError> {
        let file_name = job
            .source_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CopyError::Fs(FsError::PathOutsideRoot(job.source_path.clone()))
            })?;

        let staging = fsops::staging_path(target_base, &job.id, file_name);
        let final_path = target_base.join(file_name);
        fsops::ensure_within_roots(&final_path, std::slice::from_ref(&target_base.to_path_buf()))?;

        // Whether an earlier attempt of this same target already recorded
        // this final path; only then may ground-truth reconciliation touch
        // an existing file there
        let owns_final = self
            .coordinator
            .store()
            .get_target(&job.id, target_id)
            .await?
            .and_then(|outcome| outcome.final_path)
            .map(|recorded| recorded == final_path)
            .unwrap_or(false);

        self.coordinator
            .transition_target(&job.id, target_id, TargetState::Copying, |outcome| {
                outcome.attempts += 1;
                outcome.staging_path = Some(staging.clone());
                outcome.final_path = Some(final_path.clone());
                outcome.last_error = None;
            })
            .await?;

        // A finalized file may already exist here after a retry or an
        // earlier interrupted run; for a path this target recorded, the
        // filesystem is ground truth: bytes matching the source digest
        // short-circuit, anything else is deleted and re-copied. A file
        // this target never finalized belongs to someone else and is
        // never touched.
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            if !owns_final {
                return Err(CopyError::Fs(FsError::FinalPathOccupied(final_path)));
            }
            if let Some(expected) = &job.source_digest {
                let existing = crate::hashing::hash_file(&final_path, self.chunk_bytes).await?;
                if existing == *expected {
                    let started = Instant::now();
                    let outcome = CopyOutcome {
                        digest: existing,
                        bytes_copied: 0,
                        io_ops: 0,
                        duration: started.elapsed(),
                    };
                    self.record_digest(job, target_id, &outcome, &final_path)
                        .await?;
                    return Ok(outcome);
                }
            }
            fsops::remove_file_if_exists(&final_path).await?;
        }

        match self
            .stream_to_staging(job, &staging, &final_path, token)
            .await
        {
            Ok(outcome) => {
                self.record_digest(job, target_id, &outcome, &final_path)
                    .await?;
                Ok(outcome)
            }
            Err(error) => {
                self.cleanup_staging(&staging).await;
                Err(error)
            }
        }
    }

    async fn stream_to_staging(
        &self,
        job: &Job,
        staging: &Path,
        final_path: &Path,
        token: &CancellationToken,
    ) -> Result<CopyOutcome, CopyError> {
        let started = Instant::now();

        let mut source = fsops::open_shared_read(&job.source_path).await?;
        let mut destination = fsops::create_staging_exclusive(staging).await?;

        let mut hasher = StreamingHasher::new();
        let mut buffer = vec![0u8; self.chunk_bytes];
        let mut bytes_copied = 0u64;
        let mut io_ops = 0u64;

        loop {
            if token.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            destination.write_all(&buffer[..read]).await?;
            bytes_copied += read as u64;
            io_ops += 2;
        }

        fsops::flush_to_disk(&destination).await?;
        drop(destination);
        drop(source);

        fsops::atomic_rename(staging, final_path).await?;
        self.cleanup_job_dir(staging).await;

        Ok(CopyOutcome {
            digest: hasher.finalize(),
            bytes_copied,
            io_ops,
            duration: started.elapsed(),
        })
    }

    /// Persist the digest outcome: first setter wins on the job's source
    /// digest, later copies must agree with it
    async fn record_digest(
        &self,
        job: &Job,
        target_id: &str,
        outcome: &CopyOutcome,
        final_path: &Path,
    ) -> Result<(), CopyError> {
        // DigestConflict maps to CopyError::Integrity through From
        self.coordinator
            .store()
            .set_source_digest_if_unset(&job.id, &outcome.digest)
            .await?;

        let digest = outcome.digest.clone();
        let final_path = final_path.to_path_buf();
        self.coordinator
            .transition_target(&job.id, target_id, TargetState::Copied, move |o| {
                o.target_digest = Some(digest);
                o.staging_path = None;
                o.final_path = Some(final_path);
            })
            .await?;
        Ok(())
    }

    async fn cleanup_staging(&self, staging: &Path) {
        if let Err(e) = fsops::remove_file_if_exists(staging).await {
            log::warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }
        self.cleanup_job_dir(staging).await;
    }

    /// Remove the per-job staging directory once it is empty
    async fn cleanup_job_dir(&self, staging: &Path) {
        if let Some(job_dir) = staging.parent() {
            let _ = tokio::fs::remove_dir(job_dir).await;
        }
    }
}
