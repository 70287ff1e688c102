//! Batch consumer worker pool.

use message_broker::{Broker, ChannelPool, ConsumeChannel, Delivery};
use pipeline_metrics::PipelineContext;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use transaction_schema::Transaction;

use crate::batch::Batch;
use crate::store::TransactionStore;
use crate::ConsumerConfig;

/// Batches larger than this get an info-level summary
const LOGGED_BATCH_SIZE: usize = 10;

/// Everything a consume worker needs besides its channel.
pub struct ConsumerContext<S: TransactionStore> {
    pub pipeline: Arc<PipelineContext>,
    pub store: Arc<S>,
}

impl<S: TransactionStore> Clone for ConsumerContext<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: TransactionStore> ConsumerContext<S> {
    pub fn new(pipeline: Arc<PipelineContext>, store: Arc<S>) -> Self {
        Self { pipeline, store }
    }
}

/// What happened to one flushed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows newly written
    pub inserted: u64,
    /// Records whose `id` was already stored
    pub duplicates: u64,
    /// Records sent back to the queue after a failed write
    pub requeued: u64,
    /// Whether the batch write failed and records were written one by one
    pub fell_back: bool,
}

/// Apply a flushed batch to the store and settle every delivery in it.
///
/// Batch write succeeds: every delivery is acked; `processed` grows by the
/// rows written and `duplicate` by the rest.
///
/// Batch write fails: each record is written on its own. Written → ack +
/// `processed`; already stored → ack + `duplicate`; failed → nack with
/// requeue + `error`. A record that keeps failing is redelivered forever.
pub async fn apply_batch<S, D>(ctx: &ConsumerContext<S>, items: Vec<(Transaction, D)>) -> BatchOutcome
where
    S: TransactionStore,
    D: Delivery,
{
    let mut outcome = BatchOutcome::default();
    if items.is_empty() {
        return outcome;
    }

    let (transactions, deliveries): (Vec<Transaction>, Vec<D>) = items.into_iter().unzip();
    let counters = &ctx.pipeline.counters;

    match ctx.store.apply_batch(&transactions).await {
        Ok(written) => {
            let total = transactions.len() as u64;
            outcome.inserted = written.min(total);
            outcome.duplicates = total - outcome.inserted;
            counters.add_processed(outcome.inserted);
            counters.add_duplicate(outcome.duplicates);

            for delivery in &deliveries {
                acknowledge(delivery).await;
            }
        }
        Err(e) => {
            warn!(
                batch_size = transactions.len(),
                error = %e,
                "Batch write failed, falling back to per-record writes"
            );
            outcome.fell_back = true;

            for (transaction, delivery) in transactions.iter().zip(&deliveries) {
                match ctx.store.apply_one(transaction).await {
                    Ok(true) => {
                        outcome.inserted += 1;
                        counters.inc_processed();
                        acknowledge(delivery).await;
                    }
                    Ok(false) => {
                        outcome.duplicates += 1;
                        counters.inc_duplicate();
                        acknowledge(delivery).await;
                    }
                    Err(e) => {
                        warn!(
                            transaction_id = %transaction.id,
                            transient = e.is_transient(),
                            error = %e,
                            "Record write failed, requeueing"
                        );
                        outcome.requeued += 1;
                        counters.inc_error();
                        if let Err(e) = delivery.requeue_or_drop(true).await {
                            warn!(
                                delivery_tag = delivery.delivery_tag(),
                                error = %e,
                                "Failed to requeue delivery"
                            );
                        }
                    }
                }
            }
        }
    }

    outcome
}

async fn acknowledge<D: Delivery>(delivery: &D) {
    if let Err(e) = delivery.ack().await {
        // Unacked deliveries come back after the channel closes; the store ignores the repeat
        warn!(
            delivery_tag = delivery.delivery_tag(),
            error = %e,
            "Failed to acknowledge delivery"
        );
    }
}

async fn flush<S, D>(worker_id: usize, ctx: &ConsumerContext<S>, batch: &mut Batch<D>)
where
    S: TransactionStore,
    D: Delivery,
{
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let outcome = apply_batch(ctx, batch.take()).await;

    if size > LOGGED_BATCH_SIZE || outcome.fell_back {
        info!(
            worker_id = worker_id,
            batch_size = size,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            requeued = outcome.requeued,
            "Batch processed"
        );
    } else {
        debug!(
            worker_id = worker_id,
            batch_size = size,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "Batch processed"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Shutdown,
    StreamClosed,
    StreamFailed,
    SetupFailed,
}

async fn run_worker<B, S>(
    worker_id: usize,
    pool: ChannelPool<B>,
    ctx: ConsumerContext<S>,
    config: ConsumerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerExit
where
    B: Broker,
    S: TransactionStore,
{
    let mut channel = match pool.consumer(&config.queue, config.prefetch).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(worker_id = worker_id, error = %e, "Failed to open consumer channel");
            ctx.pipeline
                .health
                .mark_unhealthy("consumer channel setup failed");
            return WorkerExit::SetupFailed;
        }
    };
    info!(
        worker_id = worker_id,
        prefetch = config.prefetch,
        "Consumer worker waiting for messages"
    );

    let mut batch = Batch::new(config.batch_size, config.flush_interval);

    let exit = loop {
        if *shutdown.borrow_and_update() {
            break WorkerExit::Shutdown;
        }
        let deadline = batch.deadline();

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                break WorkerExit::Shutdown;
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                flush(worker_id, &ctx, &mut batch).await;
            }

            next = channel.next_delivery() => match next {
                Some(Ok(delivery)) => match transaction_schema::decode(delivery.body()) {
                    Ok(transaction) => {
                        if batch.push(transaction, delivery) {
                            flush(worker_id, &ctx, &mut batch).await;
                        }
                    }
                    Err(e) => {
                        // No dead-letter queue: a malformed body would be redelivered forever
                        warn!(
                            worker_id = worker_id,
                            delivery_tag = delivery.delivery_tag(),
                            message_id = delivery.message_id().unwrap_or("-"),
                            error = %e,
                            "Dropping malformed message"
                        );
                        ctx.pipeline.counters.inc_error();
                        acknowledge(&delivery).await;
                    }
                },
                Some(Err(e)) => {
                    error!(worker_id = worker_id, error = %e, "Delivery stream failed");
                    ctx.pipeline.health.mark_unhealthy("delivery stream failed");
                    break WorkerExit::StreamFailed;
                }
                None => {
                    info!(worker_id = worker_id, "Delivery stream closed");
                    break WorkerExit::StreamClosed;
                }
            },
        }
    };

    flush(worker_id, &ctx, &mut batch).await;
    channel.release().await;
    info!(worker_id = worker_id, exit = ?exit, "Consumer worker stopped");
    exit
}

/// Totals reported once every worker has exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Workers that got a channel and ran until shutdown or end of stream
    pub workers_started: usize,
    /// Workers that could not open a channel, lost their stream, or panicked
    pub workers_failed: usize,
}

/// Pool of consume workers, each with its own prefetch-bounded channel and batch.
pub struct BatchConsumer<B: Broker, S: TransactionStore> {
    pool: ChannelPool<B>,
    ctx: ConsumerContext<S>,
    config: ConsumerConfig,
}

impl<B: Broker, S: TransactionStore> BatchConsumer<B, S> {
    pub fn new(pool: ChannelPool<B>, ctx: ConsumerContext<S>, config: ConsumerConfig) -> Self {
        Self { pool, ctx, config }
    }

    /// Start the workers. They stop when `shutdown` turns `true` (or its
    /// sender is dropped), flushing whatever they have buffered.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> ConsumerHandle {
        info!(
            queue = %self.config.queue,
            workers = self.config.workers,
            prefetch = self.config.prefetch,
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Batch consumer starting"
        );

        let workers = (0..self.config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    self.pool.clone(),
                    self.ctx.clone(),
                    self.config.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        ConsumerHandle { workers }
    }
}

/// Handle to the running consume workers.
pub struct ConsumerHandle {
    workers: Vec<JoinHandle<WorkerExit>>,
}

impl ConsumerHandle {
    /// Wait for every worker to exit
    pub async fn join(self) -> ConsumerSummary {
        let mut summary = ConsumerSummary::default();
        for worker in self.workers {
            match worker.await {
                Ok(WorkerExit::Shutdown | WorkerExit::StreamClosed) => {
                    summary.workers_started += 1
                }
                Ok(WorkerExit::StreamFailed | WorkerExit::SetupFailed) => {
                    summary.workers_failed += 1
                }
                Err(e) => {
                    error!(error = %e, "Consumer worker panicked");
                    summary.workers_failed += 1;
                }
            }
        }
        summary
    }
}
