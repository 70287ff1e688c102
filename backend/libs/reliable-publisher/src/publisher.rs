//! Publisher worker pool.

use message_broker::{Broker, ChannelPool, Confirmation, OutboundMessage, PublishChannel};
use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transaction_schema::{Transaction, CONTENT_TYPE};

use crate::error::PublishError;
use crate::jobs::JobQueue;
use crate::PublisherConfig;

/// Publish one transaction and wait for the broker to confirm it.
///
/// The message is persistent and carries the transaction `id` as message id.
/// Confirmations older than this publish belong to earlier publishes that
/// already timed out on the same channel; they are drained and discarded so
/// they can never be mistaken for this one.
pub async fn publish_one<C: PublishChannel>(
    channel: &mut C,
    queue: &str,
    transaction: &Transaction,
    confirm_timeout: Duration,
) -> Result<(), PublishError> {
    let body = transaction_schema::encode(transaction)?;
    let message = OutboundMessage::persistent(queue, transaction.id.clone(), CONTENT_TYPE, body);
    let seq = channel.publish(message).await?;

    match tokio::time::timeout(confirm_timeout, await_confirm(channel, seq)).await {
        Ok(Some(confirm)) if confirm.ack => Ok(()),
        Ok(Some(_)) => Err(PublishError::Nack {
            id: transaction.id.clone(),
        }),
        Ok(None) => Err(PublishError::ConfirmStreamClosed {
            id: transaction.id.clone(),
        }),
        Err(_) => Err(PublishError::Timeout {
            id: transaction.id.clone(),
            after: confirm_timeout,
        }),
    }
}

async fn await_confirm<C: PublishChannel>(channel: &mut C, seq: u64) -> Option<Confirmation> {
    loop {
        let confirm = channel.next_confirm().await?;
        if confirm.covers(seq) {
            return Some(confirm);
        }
        if confirm.is_stale_for(seq) {
            debug!(
                seq = seq,
                orphan_tag = confirm.delivery_tag,
                ack = confirm.ack,
                "Discarding confirm of an earlier timed-out publish"
            );
        } else {
            warn!(
                seq = seq,
                tag = confirm.delivery_tag,
                "Confirm ahead of current publish, ignoring"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Drained,
    SetupFailed,
}

/// Totals reported once every worker has exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Workers that got a channel and drained the queue
    pub workers_started: usize,
    /// Workers that exited early (channel setup failed or the task panicked)
    pub workers_failed: usize,
}

/// Fixed-size pool of publisher workers, each with its own confirm-mode channel.
pub struct ReliablePublisher<B: Broker> {
    pool: ChannelPool<B>,
    pipeline: Arc<PipelineContext>,
    config: PublisherConfig,
}

impl<B: Broker> ReliablePublisher<B> {
    pub fn new(pool: ChannelPool<B>, pipeline: Arc<PipelineContext>, config: PublisherConfig) -> Self {
        Self {
            pool,
            pipeline,
            config,
        }
    }

    /// Start the workers. They run until `jobs` is closed and drained.
    pub fn spawn(self, jobs: JobQueue) -> PublisherHandle {
        info!(
            queue = %self.config.queue,
            workers = self.config.workers,
            confirm_timeout_ms = self.config.confirm_timeout.as_millis() as u64,
            "Reliable publisher starting"
        );

        let workers = (0..self.config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    self.pool.clone(),
                    jobs.clone(),
                    self.pipeline.clone(),
                    self.config.clone(),
                ))
            })
            .collect();

        PublisherHandle { workers }
    }
}

async fn run_worker<B: Broker>(
    worker_id: usize,
    pool: ChannelPool<B>,
    jobs: JobQueue,
    pipeline: Arc<PipelineContext>,
    config: PublisherConfig,
) -> WorkerExit {
    let mut channel = match pool.publisher(&config.queue).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(worker_id = worker_id, error = %e, "Failed to open publisher channel");
            pipeline
                .health
                .mark_unhealthy("publisher channel setup failed");
            return WorkerExit::SetupFailed;
        }
    };
    debug!(worker_id = worker_id, "Publisher worker started");

    let mut published = 0u64;
    let mut failed = 0u64;

    while let Some(transaction) = jobs.next().await {
        match publish_one(
            &mut *channel,
            &config.queue,
            &transaction,
            config.confirm_timeout,
        )
        .await
        {
            Ok(()) => {
                published += 1;
                pipeline.counters.inc_published();
            }
            Err(e) => {
                failed += 1;
                pipeline.counters.inc_failed();
                warn!(
                    worker_id = worker_id,
                    transaction_id = %transaction.id,
                    error = %e,
                    "Publish failed"
                );
            }
        }
    }

    channel.release().await;
    info!(
        worker_id = worker_id,
        published = published,
        failed = failed,
        "Publisher worker finished"
    );
    WorkerExit::Drained
}

/// Handle to the running workers.
pub struct PublisherHandle {
    workers: Vec<JoinHandle<WorkerExit>>,
}

impl PublisherHandle {
    /// Wait for every worker to exit
    pub async fn join(self) -> PublishSummary {
        let mut summary = PublishSummary::default();
        for worker in self.workers {
            match worker.await {
                Ok(WorkerExit::Drained) => summary.workers_started += 1,
                Ok(WorkerExit::SetupFailed) => summary.workers_failed += 1,
                Err(e) => {
                    error!(error = %e, "Publisher worker panicked");
                    summary.workers_failed += 1;
                }
            }
        }
        summary
    }
}
