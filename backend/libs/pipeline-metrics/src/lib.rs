//! # Pipeline Metrics
//!
//! Process-wide outcome counters and health state for the transaction
//! pipeline, bundled into a [`PipelineContext`] that is built once at startup
//! and handed to every worker by `Arc`.
//!
//! | Counter | Meaning |
//! |---|---|
//! | `transactions_published_total` | publish confirmed by the broker |
//! | `transactions_publish_failed_total` | publish nacked, timed out or errored |
//! | `transactions_processed_total` | row newly written by the store |
//! | `transactions_duplicate_total` | record already present, acknowledged as no-op |
//! | `transactions_error_total` | record parse failure, malformed message, or store error |
//!
//! Counters only ever increase. They are independent of each other, so a
//! [`CounterSnapshot`] is not a consistent cut across all five.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub mod http;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Point-in-time copy of the counters, also served as JSON on `/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub published: u64,
    pub failed: u64,
    pub processed: u64,
    pub duplicate: u64,
    pub error: u64,
}

/// Outcome counters backed by a per-instance Prometheus registry.
#[derive(Clone)]
pub struct PipelineCounters {
    registry: Registry,
    published: IntCounter,
    failed: IntCounter,
    processed: IntCounter,
    duplicate: IntCounter,
    error: IntCounter,
}

fn counter(service: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for pipeline counter")
}

impl PipelineCounters {
    pub fn new(service: &str) -> Self {
        let registry = Registry::new();

        let published = counter(
            service,
            "transactions_published_total",
            "Transactions confirmed by the broker",
        );
        let failed = counter(
            service,
            "transactions_publish_failed_total",
            "Transactions whose publish was nacked, timed out or errored",
        );
        let processed = counter(
            service,
            "transactions_processed_total",
            "Transactions newly written to the store",
        );
        let duplicate = counter(
            service,
            "transactions_duplicate_total",
            "Transactions already present in the store",
        );
        let error = counter(
            service,
            "transactions_error_total",
            "Unparseable records, malformed messages and store errors",
        );

        for metric in [&published, &failed, &processed, &duplicate, &error] {
            if let Err(e) = registry.register(Box::new(metric.clone())) {
                warn!("Failed to register pipeline metric: {}", e);
            }
        }

        Self {
            registry,
            published,
            failed,
            processed,
            duplicate,
            error,
        }
    }

    pub fn inc_published(&self) {
        self.published.inc();
    }

    pub fn inc_failed(&self) {
        self.failed.inc();
    }

    pub fn inc_processed(&self) {
        self.processed.inc();
    }

    pub fn inc_duplicate(&self) {
        self.duplicate.inc();
    }

    pub fn inc_error(&self) {
        self.error.inc();
    }

    pub fn add_processed(&self, n: u64) {
        self.processed.inc_by(n);
    }

    pub fn add_duplicate(&self, n: u64) {
        self.duplicate.inc_by(n);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            published: self.published.get(),
            failed: self.failed.get(),
            processed: self.processed.get(),
            duplicate: self.duplicate.get(),
            error: self.error.get(),
        }
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Liveness of the process: starts healthy, can only go unhealthy.
#[derive(Debug)]
pub struct HealthFlag {
    healthy: AtomicBool,
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }
}

impl HealthFlag {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Flip to unhealthy; only the first call logs
    pub fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            error!(reason = %reason, "Service marked unhealthy");
        }
    }
}

/// State shared by every worker of one process.
pub struct PipelineContext {
    pub service: String,
    pub counters: PipelineCounters,
    pub health: HealthFlag,
}

impl PipelineContext {
    pub fn new(service: impl Into<String>) -> Arc<Self> {
        let service = service.into();
        info!(service = %service, "Pipeline context initialized");
        Arc::new(Self {
            counters: PipelineCounters::new(&service),
            health: HealthFlag::default(),
            service,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = PipelineCounters::new("test");
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_increments_are_independent() {
        let counters = PipelineCounters::new("test");
        counters.inc_published();
        counters.inc_published();
        counters.inc_failed();
        counters.add_processed(4);
        counters.add_duplicate(1);
        counters.inc_error();

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                published: 2,
                failed: 1,
                processed: 4,
                duplicate: 1,
                error: 1,
            }
        );
    }

    #[test]
    fn test_clones_share_values() {
        let counters = PipelineCounters::new("test");
        let clone = counters.clone();
        clone.inc_processed();
        assert_eq!(counters.snapshot().processed, 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = PipelineCounters::new("test");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.inc_duplicate();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.snapshot().duplicate, 8000);
    }

    #[test]
    fn test_render_prometheus_text() {
        let counters = PipelineCounters::new("transaction-consumer");
        counters.add_processed(3);

        let text = counters.render().unwrap();
        assert!(text.contains("# TYPE transactions_processed_total counter"));
        assert!(text.contains(
            "transactions_processed_total{service=\"transaction-consumer\"} 3"
        ));
        assert!(text.contains("transactions_publish_failed_total"));
    }

    #[test]
    fn test_instances_do_not_collide() {
        let a = PipelineCounters::new("a");
        let b = PipelineCounters::new("a");
        a.inc_error();
        assert_eq!(b.snapshot().error, 0);
    }

    #[test]
    fn test_health_flag_is_one_way() {
        let health = HealthFlag::default();
        assert!(health.is_healthy());
        health.mark_unhealthy("channel setup failed");
        health.mark_unhealthy("again");
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_context_shares_state() {
        let ctx = PipelineContext::new("svc");
        let worker = ctx.clone();
        worker.counters.inc_published();
        worker.health.mark_unhealthy("test");
        assert_eq!(ctx.counters.snapshot().published, 1);
        assert!(!ctx.health.is_healthy());
        assert_eq!(ctx.service, "svc");
    }
}
