//! # Engine Metrics
//!
//! Process-lifetime counters and gauges:
//! - Counters are monotonically non-decreasing (jobs, bytes, failures,
//!   retries, mismatches)
//! - Per-reason counters are keyed by stable reason tags
//! - The adaptive concurrency level is exposed as a gauge
//!
//! A point-in-time serializable snapshot feeds the out-of-core
//! observability surface.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared handle to the engine's metrics registry
pub type SharedMetrics = Arc<EngineMetrics>;

/// Counter and gauge registry
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Jobs created by discovery
    jobs_created: AtomicU64,

    /// Jobs that reached `Verified`
    jobs_verified: AtomicU64,

    /// Jobs that reached `Failed`
    jobs_failed: AtomicU64,

    /// Jobs that reached `Quarantined`
    jobs_quarantined: AtomicU64,

    /// Bytes written to targets by copy workers
    bytes_copied: AtomicU64,

    /// Digest mismatches observed at copy or verify time
    hash_mismatches: AtomicU64,

    /// Copy failures keyed by reason tag
    copy_failures: DashMap<String, u64>,

    /// Retries scheduled keyed by reason tag
    retries: DashMap<String, u64>,

    /// Current adaptive concurrency level (gauge)
    adaptive_level: AtomicUsize,
}

impl EngineMetrics {
    /// Create an empty registry
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    /// Record a newly created job
    pub fn record_job_created(&self) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching a terminal or quarantined state
    pub fn record_job_outcome(&self, state: crate::model::JobState) {
        match state {
            crate::model::JobState::Verified => {
                self.jobs_verified.fetch_add(1, Ordering::Relaxed);
            }
            crate::model::JobState::Failed => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
            crate::model::JobState::Quarantined => {
                self.jobs_quarantined.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record bytes written by a copy worker
    pub fn record_bytes_copied(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a digest mismatch
    pub fn record_hash_mismatch(&self) {
        self.hash_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a copy failure by reason tag
    pub fn record_copy_failure(&self, reason: &str) {
        *self.copy_failures.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Record a scheduled retry by reason tag
    pub fn record_retry(&self, reason: &str) {
        *self.retries.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Update the adaptive concurrency gauge
    pub fn set_adaptive_level(&self, level: usize) {
        self.adaptive_level.store(level, Ordering::Relaxed);
    }

    /// Current adaptive concurrency gauge value
    pub fn adaptive_level(&self) -> usize {
        self.adaptive_level.load(Ordering::Relaxed)
    }

    /// Total bytes copied so far
    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Total hash mismatches so far
    pub fn hash_mismatches(&self) -> u64 {
        self.hash_mismatches.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot of every counter and gauge
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_verified: self.jobs_verified.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_quarantined: self.jobs_quarantined.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),
            copy_failures: self
                .copy_failures
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            retries: self
                .retries
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            adaptive_level: self.adaptive_level.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot for the observability surface
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Jobs created by discovery
    pub jobs_created: u64,
    /// Jobs that reached `Verified`
    pub jobs_verified: u64,
    /// Jobs that reached `Failed`
    pub jobs_failed: u64,
    /// Jobs that reached `Quarantined`
    pub jobs_quarantined: u64,
    /// Bytes written to targets
    pub bytes_copied: u64,
    /// Digest mismatches observed
    pub hash_mismatches: u64,
    /// Copy failures keyed by reason
    pub copy_failures: HashMap<String, u64>,
    /// Retries keyed by reason
    pub retries: HashMap<String, u64>,
    /// Current adaptive concurrency level
    pub adaptive_level: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_job_created();
        metrics.record_bytes_copied(100);
        metrics.record_bytes_copied(150);
        metrics.record_copy_failure("io");
        metrics.record_copy_failure("io");
        metrics.record_retry("storage_full");
        metrics.record_hash_mismatch();
        metrics.record_job_outcome(JobState::Verified);
        metrics.set_adaptive_level(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_created, 1);
        assert_eq!(snap.jobs_verified, 1);
        assert_eq!(snap.bytes_copied, 250);
        assert_eq!(snap.copy_failures.get("io"), Some(&2));
        assert_eq!(snap.retries.get("storage_full"), Some(&1));
        assert_eq!(snap.hash_mismatches, 1);
        assert_eq!(snap.adaptive_level, 3);
    }

    #[test]
    fn test_snapshot_is_serializable() {
        let metrics = EngineMetrics::new();
        metrics.record_job_created();
        let text = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(text.contains("jobs_created"));
    }
}
