//! # Adaptive Concurrency Controller
//!
//! Maintains the global copy-admission limit in `[1, globalMax]`. A
//! background evaluation loop examines rolling p95 copy latency, process
//! memory, and a recent disk-IOPS estimate:
//! - High p95 latency or memory pressure decrements the limit (floor 1)
//! - Comfortable latency with resource headroom increments it (ceiling
//!   `globalMax`)
//!
//! Admission is consulted when a copy starts; in-flight copies are never
//! preempted by a lowered limit.

use crate::config::ThrottleConfig;
use crate::metrics::SharedMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio_util::sync::CancellationToken;

/// Latency samples older than this fall out of the rolling window
const LATENCY_WINDOW: Duration = Duration::from_secs(300);

/// Admission permit; releases its slot on drop
pub struct CopyPermit {
    controller: Arc<AdaptiveConcurrencyController>,
}

impl Drop for CopyPermit {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Global admission limit driven by observed latency and resource pressure
pub struct AdaptiveConcurrencyController {
    config: ThrottleConfig,
    global_max: usize,
    current: AtomicUsize,
    in_flight: AtomicUsize,
    latencies: Mutex<VecDeque<(Instant, Duration)>>,
    io_ops_total: AtomicU64,
    last_evaluation: Mutex<(Instant, u64)>,
    system: Mutex<System>,
    metrics: SharedMetrics,
}

impl AdaptiveConcurrencyController {
    /// Create a controller starting at the configured maximum
    pub fn new(
        config: ThrottleConfig,
        global_max: usize,
        metrics: SharedMetrics,
    ) -> Arc<Self> {
        let global_max = global_max.max(1);
        metrics.set_adaptive_level(global_max);
        Arc::new(Self {
            config,
            global_max,
            current: AtomicUsize::new(global_max),
            in_flight: AtomicUsize::new(0),
            latencies: Mutex::new(VecDeque::new()),
            io_ops_total: AtomicU64::new(0),
            last_evaluation: Mutex::new((Instant::now(), 0)),
            system: Mutex::new(System::new()),
            metrics,
        })
    }

    /// Current global limit
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Copies currently admitted
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Try to admit one copy; the permit releases the slot on drop
    pub fn try_admit(self: &Arc<Self>) -> Option<CopyPermit> {
        loop {
            let admitted = self.in_flight.load(Ordering::Acquire);
            if admitted >= self.current() {
                return None;
            }
            if self
                .in_flight
                .compare_exchange(admitted, admitted + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(CopyPermit {
                    controller: Arc::clone(self),
                });
            }
        }
    }

    /// Record one completed copy's wall-clock latency
    pub fn record_copy_latency(&self, latency: Duration) {
        let mut window = self.latencies.lock();
        window.push_back((Instant::now(), latency));
        let cutoff = Instant::now() - LATENCY_WINDOW;
        while window.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
            window.pop_front();
        }
    }

    /// Record chunk-level I/O operations for the IOPS estimate
    pub fn record_io_ops(&self, ops: u64) {
        self.io_ops_total.fetch_add(ops, Ordering::Relaxed);
    }

    /// p95 of the rolling latency window, if any samples exist
    pub fn p95_latency(&self) -> Option<Duration> {
        let window = self.latencies.lock();
        if window.is_empty() {
            return None;
        }
        let mut samples: Vec<Duration> = window.iter().map(|(_, d)| *d).collect();
        samples.sort_unstable();
        let index = ((samples.len() as f64) * 0.95).ceil() as usize - 1;
        Some(samples[index.min(samples.len() - 1)])
    }

    fn process_memory_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn iops_estimate(&self) -> f64 {
        let mut last = self.last_evaluation.lock();
        let now = Instant::now();
        let total = self.io_ops_total.load(Ordering::Relaxed);
        let elapsed = now.duration_since(last.0).as_secs_f64();
        let estimate = if elapsed > 0.0 {
            (total.saturating_sub(last.1)) as f64 / elapsed
        } else {
            0.0
        };
        *last = (now, total);
        estimate
    }

    /// Run one evaluation of the adjustment rule
    pub fn evaluate(&self) {
        let p95 = self.p95_latency();
        let memory = self.process_memory_bytes();
        let iops = self.iops_estimate();

        let latency_high = p95
            .map(|d| d.as_millis() as u64 > self.config.latency_high_watermark_ms)
            .unwrap_or(false);
        let latency_low = p95
            .map(|d| d.as_millis() as u64 <= self.config.latency_low_watermark_ms)
            // No samples yet means nothing is straining; allow growth
            .unwrap_or(true);
        let memory_high = memory > self.config.memory_high_watermark_bytes;
        let memory_headroom = memory <= self.config.memory_high_watermark_bytes / 2;
        let iops_headroom = iops < self.config.iops_high_watermark;

        let before = self.current();
        let after = if latency_high || memory_high {
            before.saturating_sub(1).max(1)
        } else if latency_low && memory_headroom && iops_headroom {
            (before + 1).min(self.global_max)
        } else {
            before
        };

        if after != before {
            self.current.store(after, Ordering::Release);
            log::info!(
                "Adaptive concurrency {} -> {} (p95 {:?}, mem {} MiB, iops {:.0})",
                before,
                after,
                p95,
                memory / (1024 * 1024),
                iops
            );
        }
        self.metrics.set_adaptive_level(after);
    }

    /// Periodic evaluation loop; exits on cancellation
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_secs(self.config.evaluation_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.evaluate(),
            }
        }
        log::debug!("Adaptive concurrency controller stopped");
    }
}
