//! Transaction producer: reads the input CSV and publishes every valid record
//! through the reliable publisher.

pub mod config;
pub mod source;

use anyhow::Context;
use message_broker::{Broker, ChannelPool};
use pipeline_metrics::PipelineContext;
use reliable_publisher::{job_queue, Ingestor, PublishSummary, ReliablePublisher};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::config::Config;
use crate::source::SourceSummary;

/// Totals of one producer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub source: SourceSummary,
    pub workers: PublishSummary,
    pub published: u64,
    pub failed: u64,
}

/// Publish the input file once, waiting until every record is confirmed or failed.
pub async fn run<B: Broker>(
    broker: Arc<B>,
    pipeline: Arc<PipelineContext>,
    config: &Config,
) -> anyhow::Result<RunSummary> {
    let started = Instant::now();
    let path = source::find_input_file(&config.input_path)?;

    let publisher_config = config.publisher_config();
    let (sender, jobs) = job_queue(publisher_config.job_buffer);
    let handle = ReliablePublisher::new(
        ChannelPool::new(broker, publisher_config.workers),
        pipeline.clone(),
        publisher_config,
    )
    .spawn(jobs);

    let mut ingestor = Ingestor::new(sender, pipeline.clone());
    let read = tokio::task::spawn_blocking(move || {
        let result = source::read_records(&path, &mut ingestor);
        // Dropping the ingestor closes the job queue so workers drain and exit
        ingestor.finish();
        result
    })
    .await
    .context("Input reader task failed")?;

    let workers = handle.join().await;
    let source = read?;

    let counters = pipeline.counters.snapshot();
    let summary = RunSummary {
        source,
        workers,
        published: counters.published,
        failed: counters.failed,
    };

    info!(
        lines = source.ingest.records + source.unreadable,
        accepted = source.ingest.accepted,
        rejected = source.ingest.rejected,
        unreadable = source.unreadable,
        published = summary.published,
        failed = summary.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Input file processed"
    );

    Ok(summary)
}
