//! Runner Metrics
//!
//! Lightweight counters for unit lifecycle events: how many units were
//! started and how long that took, how many requests were serviced, and how
//! many units were torn down.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero allocation on the request path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters maintained by a [`PrecompiledRunner`](crate::runner::PrecompiledRunner).
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    pub initializations: AtomicU64,
    pub initialization_time_ns: AtomicU64,
    pub init_failures: AtomicU64,
    pub services: AtomicU64,
    pub service_time_ns: AtomicU64,
    pub destroys: AtomicU64,
}

impl RunnerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an initializer run, successful or not.
    pub fn record_initialization(&self, duration: Duration) {
        self.initializations.fetch_add(1, Ordering::Relaxed);
        self.initialization_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_init_failure(&self) {
        self.init_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_service(&self, duration: Duration) {
        self.services.fetch_add(1, Ordering::Relaxed);
        self.service_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_destroy(&self) {
        self.destroys.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            initializations: self.initializations.load(Ordering::Relaxed),
            avg_initialization_ms: avg_duration_ms(
                &self.initializations,
                &self.initialization_time_ns,
            ),
            init_failures: self.init_failures.load(Ordering::Relaxed),
            services: self.services.load(Ordering::Relaxed),
            avg_service_ms: avg_duration_ms(&self.services, &self.service_time_ns),
            destroys: self.destroys.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.initializations.store(0, Ordering::Relaxed);
        self.initialization_time_ns.store(0, Ordering::Relaxed);
        self.init_failures.store(0, Ordering::Relaxed);
        self.services.store(0, Ordering::Relaxed);
        self.service_time_ns.store(0, Ordering::Relaxed);
        self.destroys.store(0, Ordering::Relaxed);
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    let total = total_ns.load(Ordering::Relaxed);
    (total as f64) / (c as f64) / 1_000_000.0
}

/// A point-in-time snapshot of [`RunnerMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub initializations: u64,
    pub avg_initialization_ms: f64,
    pub init_failures: u64,
    pub services: u64,
    pub avg_service_ms: f64,
    pub destroys: u64,
}

impl MetricsSnapshot {
    /// Print a human-readable report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║         Prerun Metrics Report                             ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║   Initializations: {:>8} (avg: {:>8.3} ms)          ║",
                 self.initializations, self.avg_initialization_ms);
        println!("║   Init failures:   {:>8}                               ║",
                 self.init_failures);
        println!("║   Services:        {:>8} (avg: {:>8.3} ms)          ║",
                 self.services, self.avg_service_ms);
        println!("║   Destroys:        {:>8}                               ║",
                 self.destroys);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// A scoped timer that automatically records duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a RunnerMetrics,
    metric_type: TimerType,
}

pub enum TimerType {
    Initialization,
    Service,
}

impl<'a> ScopedTimer<'a> {
    /// Create a new scoped timer
    pub fn new(metrics: &'a RunnerMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Initialization => self.metrics.record_initialization(duration),
            TimerType::Service => self.metrics.record_service(duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = RunnerMetrics::new().snapshot();
        assert_eq!(snapshot.initializations, 0);
        assert_eq!(snapshot.services, 0);
        assert_eq!(snapshot.avg_service_ms, 0.0);
    }

    #[test]
    fn test_record_operations() {
        let metrics = RunnerMetrics::new();
        metrics.record_initialization(Duration::from_millis(100));
        metrics.record_initialization(Duration::from_millis(200));
        metrics.record_init_failure();
        metrics.record_destroy();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.initializations, 2);
        assert_eq!(snapshot.avg_initialization_ms, 150.0);
        assert_eq!(snapshot.init_failures, 1);
        assert_eq!(snapshot.destroys, 1);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = RunnerMetrics::new();
        metrics.record_service(Duration::from_millis(5));
        assert_eq!(metrics.snapshot().services, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().services, 0);
    }

    #[tokio::test]
    async fn test_scoped_timer() {
        let metrics = RunnerMetrics::new();

        {
            let _timer = ScopedTimer::new(&metrics, TimerType::Service);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.services, 1);
        assert!(snapshot.avg_service_ms >= 10.0);
    }
}
