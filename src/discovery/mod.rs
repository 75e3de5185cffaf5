//! # Discovery
//!
//! Finds new source files and turns stable ones into queued jobs:
//! - Initial scan at startup, then a filesystem watcher for live events
//! - Periodic full rescan to catch anything the watcher missed
//! - A pending map keyed by path with first-seen timestamps
//! - A single-flight stability sweep (guarded against re-entrant
//!   invocation) that consults the stability detector and enqueues jobs
//!
//! A candidate whose canonical path already belongs to a non-terminal job
//! is ignored; terminal history never suppresses a new job for the same
//! path. Candidates that stay inaccessible past the configured deadline
//! are dropped with a warning.

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::fsops::{self, FsError};
use crate::metrics::SharedMetrics;
use crate::model::{kind, Job};
use crate::orchestrator::OrchestratorMessage;
use crate::stability::{StabilityDetector, StabilityVerdict};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use dashmap::DashMap;
use globset::GlobSet;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Filesystem adapter failure
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    /// Watcher failure
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Clone)]
struct PendingCandidate {
    first_seen: Instant,
}

/// Watches source roots and enqueues jobs for stable files
pub struct DiscoveryService {
    config: Arc<EngineConfig>,
    store: JobStore,
    stability: StabilityDetector,
    metrics: SharedMetrics,
    bus: EventBus,
    orchestrator_tx: mpsc::Sender<OrchestratorMessage>,
    pending: DashMap<PathBuf, PendingCandidate>,
    sweep_active: AtomicBool,
    include: GlobSet,
    canonical_roots: Vec<PathBuf>,
}

impl DiscoveryService {
    /// Build the service, canonicalizing the configured source roots
    pub fn new(
        config: Arc<EngineConfig>,
        store: JobStore,
        metrics: SharedMetrics,
        bus: EventBus,
        orchestrator_tx: mpsc::Sender<OrchestratorMessage>,
    ) -> DiscoveryResult<Arc<Self>> {
        let include = fsops::build_glob_set(&config.file_patterns)?;
        let mut canonical_roots = Vec::with_capacity(config.source_roots.len());
        for root in &config.source_roots {
            canonical_roots.push(fsops::canonicalize_strict(root)?);
        }

        Ok(Arc::new(Self {
            stability: StabilityDetector::new(config.stability.clone()),
            config,
            store,
            metrics,
            bus,
            orchestrator_tx,
            pending: DashMap::new(),
            sweep_active: AtomicBool::new(false),
            include,
            canonical_roots,
        }))
    }

    /// Number of candidates currently pending stability
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run until cancelled: initial scan, watcher, rescan and sweep timers
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> DiscoveryResult<()> {
        log::info!(
            "Discovery started over {} root(s)",
            self.canonical_roots.len()
        );
        self.rescan().await;

        // Bridge the watcher's callback thread into the async loop
        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| {
                let _ = watch_tx.send(result);
            },
            notify::Config::default(),
        )?;
        for root in &self.canonical_roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }

        let mut sweep_tick = tokio::time::interval(Duration::from_secs(
            self.config.stability.interval_seconds.max(1),
        ));
        let mut rescan_tick = tokio::time::interval(Duration::from_secs(
            self.config.rescan_interval_seconds.max(1),
        ));
        // The first tick of an interval fires immediately
        sweep_tick.tick().await;
        rescan_tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(result) = watch_rx.recv() => match result {
                    Ok(event) => self.handle_watch_event(event).await,
                    Err(e) => log::warn!("Watcher error: {}", e),
                },
                _ = sweep_tick.tick() => self.sweep().await,
                _ = rescan_tick.tick() => self.rescan().await,
            }
        }

        log::info!("Discovery stopped");
        Ok(())
    }

    async fn handle_watch_event(&self, event: notify::Event) {
        use notify::EventKind;
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
        ) {
            return;
        }
        for path in event.paths {
            self.consider_candidate(&path).await;
        }
    }

    /// Full pass over every source root
    pub async fn rescan(&self) {
        for root in self.canonical_roots.clone() {
            match fsops::enumerate(&root, &self.include).await {
                Ok(files) => {
                    for info in files {
                        self.consider_candidate(&info.path).await;
                    }
                }
                Err(e) => log::warn!("Rescan of {} failed: {}", root.display(), e),
            }
        }
    }

    /// Admit one path into the pending map if it is a plausible candidate
    async fn consider_candidate(&self, path: &Path) {
        if fsops::is_staging_artifact(path) {
            return;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return,
        };
        if !self.include.is_match(file_name) {
            return;
        }
        if self.pending.contains_key(path) {
            return;
        }
        // Watcher events may name directories whose names match a glob
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return,
        }
        match self.store.has_open_job_for_source(path).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                log::error!("Candidate lookup failed for {}: {}", path.display(), e);
                return;
            }
        }

        log::debug!("New candidate: {}", path.display());
        self.pending.insert(
            path.to_path_buf(),
            PendingCandidate {
                first_seen: Instant::now(),
            },
        );
    }

    /// Walk the pending map once, enqueueing stable candidates
    ///
    /// Single-flight: overlapping invocations return immediately.
    pub async fn sweep(&self) {
        if self.sweep_active.swap(true, Ordering::AcqRel) {
            log::debug!("Stability sweep already running; skipping");
            return;
        }

        let paths: Vec<PathBuf> = self.pending.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            match self.stability.check(&path).await {
                StabilityVerdict::Stable => {
                    if let Err(e) = self.enqueue(&path).await {
                        log::error!("Failed to enqueue {}: {}", path.display(), e);
                    }
                    self.pending.remove(&path);
                    self.stability.forget(&path);
                }
                StabilityVerdict::StillGrowing => {}
                StabilityVerdict::Inaccessible => {
                    let expired = self
                        .pending
                        .get(&path)
                        .map(|c| {
                            c.first_seen.elapsed().as_secs()
                                >= self.config.stability.inaccessible_deadline_seconds
                        })
                        .unwrap_or(false);
                    if expired {
                        log::warn!(
                            "Dropping candidate {} after staying inaccessible",
                            path.display()
                        );
                        self.pending.remove(&path);
                        self.stability.forget(&path);
                        self.bus.publish(EngineEvent {
                            job_id: String::new(),
                            target_id: None,
                            kind: kind::CANDIDATE_DROPPED.to_string(),
                            from_state: None,
                            to_state: None,
                            duration_ms: None,
                            error_code: Some("inaccessible".to_string()),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        }

        self.sweep_active.store(false, Ordering::Release);
    }

    /// Create and enqueue a job for a stable candidate
    async fn enqueue(&self, path: &Path) -> DiscoveryResult<()> {
        let canonical = fsops::canonicalize_strict(path)?;
        fsops::ensure_within_roots(&canonical, &self.canonical_roots)?;

        // Authoritative duplicate check against the canonical path
        if self.store.has_open_job_for_source(&canonical).await? {
            log::debug!(
                "Open job already covers {}; skipping",
                canonical.display()
            );
            return Ok(());
        }

        let size = tokio::fs::metadata(&canonical)
            .await
            .map(|m| m.len())
            .map_err(FsError::from)?;
        let targets: Vec<String> = self.config.targets.iter().map(|t| t.id.clone()).collect();

        let mut job = Job::new(canonical.clone(), size, targets);
        self.store.insert_job_enqueued(&mut job).await?;
        self.metrics.record_job_created();
        log::info!(
            "Enqueued job {} for {} ({} bytes)",
            job.id,
            canonical.display(),
            size
        );

        let _ = self
            .orchestrator_tx
            .send(OrchestratorMessage::JobQueued {
                job_id: job.id.clone(),
            })
            .await;
        Ok(())
    }
}
