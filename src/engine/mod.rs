//! # Replication Engine
//!
//! Composition root and lifecycle owner. Construction is leaves-first:
//! store, metrics and event bus, then workers and services, then the
//! orchestrator. Startup runs recovery to completion before discovery or
//! orchestration begin; shutdown cancels the shared token, lets workers
//! roll back to safe states, and drains the background tasks.

use crate::config::{ConfigError, EngineConfig};
use crate::discovery::{DiscoveryError, DiscoveryService};
use crate::events::{EngineEvent, EventBus};
use crate::fsops::{self, FsError};
use crate::metrics::{EngineMetrics, MetricsSnapshot, SharedMetrics};
use crate::model::{Job, QuarantineEntry, ReplicationEvent, TargetOutcome};
use crate::orchestrator::{Orchestrator, TransitionCoordinator};
use crate::quarantine::{QuarantineError, QuarantineService};
use crate::recovery::{RecoveryError, RecoveryReport, RecoveryRoutine};
use crate::store::{JobStore, StoreConfig, StoreError, StorePool};
use crate::throttle::AdaptiveConcurrencyController;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Engine lifecycle errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store could not be opened or queried
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Recovery failed
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Discovery could not start
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Filesystem preparation failed
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    /// Quarantine operation failed
    #[error("Quarantine error: {0}")]
    Quarantine(#[from] QuarantineError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Point-in-time operational status
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    /// Jobs per state tag
    pub jobs_by_state: HashMap<String, u64>,

    /// Counter and gauge snapshot
    pub metrics: MetricsSnapshot,

    /// Candidates pending stability
    pub pending_candidates: usize,
}

/// One job with its complete persisted context
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobReport {
    /// The job record
    pub job: Job,

    /// Its per-target outcomes
    pub targets: Vec<TargetOutcome>,

    /// Its audit trail, ascending
    pub events: Vec<ReplicationEvent>,
}

/// Running replication engine
pub struct ReplicationEngine {
    config: Arc<EngineConfig>,
    store: JobStore,
    metrics: SharedMetrics,
    bus: EventBus,
    quarantine: QuarantineService,
    discovery: Arc<DiscoveryService>,
    recovery_report: RecoveryReport,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Held to drain in-flight pipeline and retry-timer tasks at shutdown
    worker_context: Arc<crate::orchestrator::WorkerContext>,
}

impl ReplicationEngine {
    /// Build everything, run recovery, and start the background tasks
    pub async fn start(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        log::info!(
            "Starting replication engine: {} source root(s), {} target(s)",
            config.source_roots.len(),
            config.targets.len()
        );

        // Each target owns a staging subdirectory the engine creates up
        // front
        for target in &config.targets {
            let staging = fsops::staging_dir(&target.base_path);
            tokio::fs::create_dir_all(&staging)
                .await
                .map_err(FsError::from)?;
        }

        let pool = StorePool::open(&config.store_path, StoreConfig::default()).await?;
        let store = JobStore::new(pool);
        let metrics = EngineMetrics::new();
        let bus = EventBus::default();
        let token = CancellationToken::new();
        let recovery_active = Arc::new(AtomicBool::new(false));

        let coordinator =
            TransitionCoordinator::new(store.clone(), bus.clone(), Arc::clone(&metrics));
        let quarantine =
            QuarantineService::new(coordinator.clone(), Arc::clone(&recovery_active));
        let controller = AdaptiveConcurrencyController::new(
            config.throttle.clone(),
            config.concurrency.global_max,
            Arc::clone(&metrics),
        );

        // Recovery reconciles persisted state with the filesystem before
        // anything else moves
        let recovery = RecoveryRoutine::new(
            store.clone(),
            Arc::clone(&config),
            Arc::clone(&recovery_active),
        );
        let recovery_report = recovery.run().await?;

        let (orchestrator, orchestrator_tx) = Orchestrator::new(
            coordinator,
            Arc::clone(&controller),
            quarantine.clone(),
            Arc::clone(&config),
            token.clone(),
        );
        let worker_context = orchestrator.context();
        let discovery = DiscoveryService::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&metrics),
            bus.clone(),
            orchestrator_tx,
        )?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(orchestrator.run()));
        tasks.push(tokio::spawn({
            let discovery = Arc::clone(&discovery);
            let token = token.clone();
            async move {
                if let Err(e) = discovery.run(token).await {
                    log::error!("Discovery task failed: {}", e);
                }
            }
        }));
        tasks.push(tokio::spawn(
            Arc::clone(&controller).run(token.clone()),
        ));

        log::info!("Replication engine started");
        Ok(Self {
            config,
            store,
            metrics,
            bus,
            quarantine,
            discovery,
            recovery_report,
            token,
            tasks,
            worker_context,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup recovery found and fixed
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// Subscribe to the structured event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Counter and gauge snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Operational status for the monitoring surface
    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let counts = self.store.count_jobs_by_state().await?;
        Ok(EngineStatus {
            jobs_by_state: counts
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
            metrics: self.metrics.snapshot(),
            pending_candidates: self.discovery.pending_count(),
        })
    }

    /// Enumerate jobs in one state, oldest first
    pub async fn jobs_in_state(&self, state: crate::model::JobState) -> EngineResult<Vec<Job>> {
        Ok(self.store.jobs_by_state(state).await?)
    }

    /// Active transfers: jobs in `InProgress`/`Partial` with their
    /// targets, for the monitoring surface
    pub async fn in_flight_jobs(&self) -> EngineResult<Vec<(Job, Vec<TargetOutcome>)>> {
        Ok(self.store.recover_in_flight().await?)
    }

    /// Fetch one job with targets and audit trail
    pub async fn job_report(&self, job_id: &str) -> EngineResult<Option<JobReport>> {
        let job = match self.store.get_job(job_id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        let targets = self.store.targets_for_job(job_id).await?;
        let events = self.store.events_for_job(job_id).await?;
        Ok(Some(JobReport {
            job,
            targets,
            events,
        }))
    }

    /// Enumerate active quarantine entries
    pub async fn active_quarantines(&self) -> EngineResult<Vec<QuarantineEntry>> {
        Ok(self.quarantine.active().await?)
    }

    /// Operator command: release a quarantined job back to the queue
    pub async fn release_quarantine(&self, job_id: &str) -> EngineResult<()> {
        Ok(self.quarantine.release(job_id).await?)
    }

    /// Cooperative shutdown: cancel, drain every task, close the store
    ///
    /// Waits for the three long-lived loops and for every in-flight copy,
    /// verify and retry-timer task. Workers observe the cancelled token
    /// between chunks, roll back to safe states and remove their staging
    /// files before the store closes underneath them.
    pub async fn shutdown(self) {
        log::info!("Replication engine shutting down");
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        self.worker_context.drain_tasks().await;
        self.store.pool().close().await;
        log::info!("Replication engine stopped");
    }
}
