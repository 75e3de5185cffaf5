//! # Stability Detector
//!
//! Decides when a growing source file is done being written. A file is
//! stable once its size has been unchanged for N consecutive samples spaced
//! at the configured interval, a non-blocking shared-read open succeeds
//! between samples, and a minimum age has elapsed since first sighting.
//! Shrinkage or an inaccessible window invalidates the accumulated samples.

use crate::config::StabilityConfig;
use crate::fsops;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

/// Verdict for one candidate path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityVerdict {
    /// Size unchanged long enough, readable, and past the minimum age
    Stable,

    /// Size changed, the sample run is too short, or the file is too young
    StillGrowing,

    /// Metadata or a shared-read open failed; sample run reset
    Inaccessible,
}

#[derive(Debug, Clone)]
struct SampleState {
    first_seen: Instant,
    last_size: u64,
    last_modified: SystemTime,
    /// Samples in a row that observed the same size, current one included
    matching_samples: u32,
}

/// Tracks per-path sample runs across the discovery sweep
pub struct StabilityDetector {
    config: StabilityConfig,
    samples: DashMap<PathBuf, SampleState>,
}

impl StabilityDetector {
    /// Create a detector with the given tuning
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            samples: DashMap::new(),
        }
    }

    /// Sample a path once and report its verdict
    ///
    /// Call at the configured interval; each call is one sample.
    pub async fn check(&self, path: &Path) -> StabilityVerdict {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => {
                self.samples.remove(path);
                return StabilityVerdict::Inaccessible;
            }
        };

        if !fsops::probe_shared_read(path).await {
            self.samples.remove(path);
            return StabilityVerdict::Inaccessible;
        }

        let size = metadata.len();
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entry = self
            .samples
            .entry(path.to_path_buf())
            .or_insert_with(|| SampleState {
                first_seen: Instant::now(),
                last_size: size,
                last_modified: modified,
                matching_samples: 0,
            });

        if entry.matching_samples == 0 {
            // First sample for this run
            entry.matching_samples = 1;
        } else if size == entry.last_size && modified == entry.last_modified {
            entry.matching_samples = entry.matching_samples.saturating_add(1);
        } else {
            // Growth or shrinkage restarts the run; shrinkage also discards
            // the previous baseline entirely.
            entry.last_size = size;
            entry.last_modified = modified;
            entry.matching_samples = 1;
            return StabilityVerdict::StillGrowing;
        }

        let old_enough =
            entry.first_seen.elapsed().as_secs() >= self.config.min_age_seconds;
        if entry.matching_samples >= self.config.required_samples && old_enough {
            StabilityVerdict::Stable
        } else {
            StabilityVerdict::StillGrowing
        }
    }

    /// Age of the current sample run, if the path is being tracked
    pub fn tracked_since(&self, path: &Path) -> Option<Instant> {
        self.samples.get(path).map(|s| s.first_seen)
    }

    /// Drop accumulated state for a path after enqueue or abandonment
    pub fn forget(&self, path: &Path) {
        self.samples.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> StabilityConfig {
        StabilityConfig {
            interval_seconds: 0,
            required_samples: 2,
            min_age_seconds: 0,
            inaccessible_deadline_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_unchanged_file_becomes_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let detector = StabilityDetector::new(fast_config());
        assert_eq!(detector.check(&path).await, StabilityVerdict::StillGrowing);
        assert_eq!(detector.check(&path).await, StabilityVerdict::Stable);
    }

    #[tokio::test]
    async fn test_growth_resets_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        tokio::fs::write(&path, b"12").await.unwrap();

        let detector = StabilityDetector::new(fast_config());
        detector.check(&path).await;
        tokio::fs::write(&path, b"1234").await.unwrap();
        assert_eq!(detector.check(&path).await, StabilityVerdict::StillGrowing);
        // One matching sample so far; the next unchanged one is stable
        assert_eq!(detector.check(&path).await, StabilityVerdict::Stable);
    }

    #[tokio::test]
    async fn test_shrink_resets_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        tokio::fs::write(&path, b"123456").await.unwrap();

        let detector = StabilityDetector::new(fast_config());
        detector.check(&path).await;
        tokio::fs::write(&path, b"12").await.unwrap();
        assert_eq!(detector.check(&path).await, StabilityVerdict::StillGrowing);
    }

    #[tokio::test]
    async fn test_missing_file_is_inaccessible() {
        let detector = StabilityDetector::new(fast_config());
        let verdict = detector.check(Path::new("/nonexistent/ghost.dcm")).await;
        assert_eq!(verdict, StabilityVerdict::Inaccessible);
    }

    #[tokio::test]
    async fn test_min_age_gates_stability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let mut config = fast_config();
        config.min_age_seconds = 3600;
        let detector = StabilityDetector::new(config);

        detector.check(&path).await;
        // Samples agree, but the file is too young to enqueue
        assert_eq!(detector.check(&path).await, StabilityVerdict::StillGrowing);
    }

    #[tokio::test]
    async fn test_forget_clears_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let detector = StabilityDetector::new(fast_config());
        detector.check(&path).await;
        detector.forget(&path);
        assert_eq!(detector.check(&path).await, StabilityVerdict::StillGrowing);
    }
}
