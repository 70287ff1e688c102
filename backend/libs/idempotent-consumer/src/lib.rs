//! # Idempotent Batch Consumer
//!
//! Drains a durable queue into PostgreSQL with batched, conflict-ignoring
//! writes. Delivery is at-least-once; the store makes redelivery harmless, so
//! the end effect is that every transaction `id` is stored exactly once.
//!
//! ## Problem
//!
//! The broker may deliver the same message more than once:
//! - **Consumer restarts**: unacked deliveries return to the queue
//! - **Publisher timeouts**: a publish counted as failed may still have landed
//! - **Requeues**: records whose write failed are deliberately redelivered
//!
//! Writing one row per message is also too slow for bulk loads.
//!
//! ## Solution
//!
//! - **Batch per worker**: each worker buffers up to `batch_size` messages or
//!   `flush_interval`, whichever comes first
//! - **Idempotent upsert**: `INSERT ... ON CONFLICT (id) DO NOTHING`; rows not
//!   written are duplicates, not errors
//! - **Partial-failure isolation**: if the batch write fails, records are
//!   written one by one and only the failing ones are requeued
//! - **Backpressure**: the channel prefetch bounds unacked deliveries per worker
//!
//! ## Architecture
//!
//! ```text
//! broker ──► worker N ──► Batch (size / age) ──► TransactionStore::apply_batch
//!   ▲          │                                     │ error
//!   │          │ malformed → ack + error             ▼
//!   │          │                            apply_one per record
//!   └──────────┴──── ack / nack(requeue) ◄──────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use idempotent_consumer::{BatchConsumer, ConsumerConfig, ConsumerContext, PgTransactionStore};
//!
//! let ctx = ConsumerContext::new(pipeline, Arc::new(PgTransactionStore::new(pg_pool)));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = BatchConsumer::new(channel_pool, ctx, ConsumerConfig::default()).start(shutdown_rx);
//!
//! tokio::signal::ctrl_c().await?;
//! shutdown_tx.send(true)?;
//! handle.join().await;
//! ```
//!
//! ## Counters
//!
//! For every batch applied without fallback,
//! `processed_delta + duplicate_delta == batch size`.
//!
//! ## Known Trade-offs
//!
//! - A message that fails to deserialize is **acknowledged and dropped**
//!   (counted as `error`). There is no dead-letter queue; requeueing it would
//!   loop forever.
//! - A record that fails to write on every attempt is requeued every time.
//!   There is no redelivery limit.

use std::time::Duration;

mod batch;
mod consumer;
mod error;
mod memory;
mod store;

pub use batch::Batch;
pub use consumer::{
    apply_batch, BatchConsumer, BatchOutcome, ConsumerContext, ConsumerHandle, ConsumerSummary,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryTransactionStore;
pub use store::{PgTransactionStore, TransactionStore};

/// Consumer pool settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Source queue
    pub queue: String,

    /// Number of concurrent workers, each with its own channel
    pub workers: usize,

    /// Maximum unacknowledged deliveries per worker channel
    pub prefetch: u16,

    /// Flush when this many messages are buffered
    pub batch_size: usize,

    /// Flush this long after the first buffered message
    pub flush_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "transactions_queue".to_string(),
            workers: 5,
            prefetch: 100,
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
        }
    }
}
