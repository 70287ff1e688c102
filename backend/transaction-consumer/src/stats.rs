//! Periodic counter summary.

use pipeline_metrics::{CounterSnapshot, PipelineContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Counter movement over one reporting period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub totals: CounterSnapshot,
    pub processed_delta: u64,
    pub duplicate_delta: u64,
    pub error_delta: u64,
    /// Rows written per second over the period
    pub rate: f64,
}

impl StatsReport {
    pub fn between(previous: CounterSnapshot, current: CounterSnapshot, period: Duration) -> Self {
        let processed_delta = current.processed.saturating_sub(previous.processed);
        let secs = period.as_secs_f64();
        Self {
            totals: current,
            processed_delta,
            duplicate_delta: current.duplicate.saturating_sub(previous.duplicate),
            error_delta: current.error.saturating_sub(previous.error),
            rate: if secs > 0.0 {
                processed_delta as f64 / secs
            } else {
                0.0
            },
        }
    }
}

/// Log a [`StatsReport`] every `period` until `shutdown` turns `true`.
pub fn spawn_stats_logger(
    pipeline: Arc<PipelineContext>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut previous = pipeline.counters.snapshot();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let current = pipeline.counters.snapshot();
                    let report = StatsReport::between(previous, current, period);
                    info!(
                        processed = report.totals.processed,
                        duplicate = report.totals.duplicate,
                        error = report.totals.error,
                        processed_delta = report.processed_delta,
                        duplicate_delta = report.duplicate_delta,
                        error_delta = report.error_delta,
                        rows_per_sec = format!("{:.1}", report.rate),
                        "Consumer stats"
                    );
                    previous = current;
                }
            }
        }
    })
}
