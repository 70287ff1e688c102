//! Transaction consumer: drains the queue into the idempotent store with a
//! pool of batching workers.

pub mod config;
pub mod stats;

use idempotent_consumer::{BatchConsumer, ConsumerContext, ConsumerSummary, TransactionStore};
use message_broker::{Broker, ChannelPool};
use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;

/// Run the consumer pool and the stats logger until `shutdown` turns `true`
/// or every worker has stopped on its own.
pub async fn run<B, S>(
    broker: Arc<B>,
    store: Arc<S>,
    pipeline: Arc<PipelineContext>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> ConsumerSummary
where
    B: Broker,
    S: TransactionStore,
{
    let consumer_config = config.consumer_config();
    if consumer_config.batch_size > consumer_config.prefetch as usize {
        warn!(
            batch_size = consumer_config.batch_size,
            prefetch = consumer_config.prefetch,
            "Batch size exceeds prefetch, batches will only flush on the interval"
        );
    }

    let stats = stats::spawn_stats_logger(pipeline.clone(), config.stats_interval(), shutdown.clone());

    let summary = BatchConsumer::new(
        ChannelPool::new(broker, consumer_config.workers),
        ConsumerContext::new(pipeline.clone(), store),
        consumer_config,
    )
    .start(shutdown)
    .join()
    .await;

    stats.abort();

    let counters = pipeline.counters.snapshot();
    info!(
        workers_started = summary.workers_started,
        workers_failed = summary.workers_failed,
        processed = counters.processed,
        duplicate = counters.duplicate,
        error = counters.error,
        "Consumer stopped"
    );
    summary
}
