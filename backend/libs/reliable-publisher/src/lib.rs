//! # Reliable Publisher
//!
//! Publishes transactions to a durable queue and only counts a transaction as
//! published once the broker has confirmed it.
//!
//! ## Flow
//!
//! ```text
//! record source ──► Ingestor ──► job queue (bounded) ──► worker 1..N ──► broker
//!                      │                                   │    ▲
//!                parse error → error                  publish   │ confirm (ack/nack)
//!                                                            wait ≤ confirm_timeout
//! ```
//!
//! Each worker owns one confirm-mode channel for its whole lifetime, so
//! confirmations can be matched to publishes by sequence number.
//!
//! ## Guarantees
//!
//! - `published` counts only broker-acknowledged publishes
//! - Nack, timeout, encode and broker errors count as `failed` and are **not**
//!   retried (a timed-out message may still have reached the queue)
//! - A late confirmation of a timed-out publish is discarded, never counted
//!
//! ## Example
//!
//! ```rust,ignore
//! use reliable_publisher::{job_queue, Ingestor, PublisherConfig, ReliablePublisher};
//!
//! let config = PublisherConfig::default();
//! let (sender, jobs) = job_queue(config.job_buffer);
//! let handle = ReliablePublisher::new(pool, ctx.clone(), config).spawn(jobs);
//!
//! let mut ingestor = Ingestor::new(sender, ctx.clone());
//! ingestor.submit(&fields).await?;
//! ingestor.finish();
//!
//! let summary = handle.join().await;
//! ```

use std::time::Duration;

mod error;
mod ingest;
mod jobs;
mod publisher;

pub use error::{JobQueueClosed, PublishError};
pub use ingest::{IngestSummary, Ingestor, Submitted, PROGRESS_EVERY};
pub use jobs::{job_queue, JobQueue, JobSender};
pub use publisher::{publish_one, PublishSummary, PublisherHandle, ReliablePublisher};

/// Publisher pool settings
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Destination queue
    pub queue: String,

    /// Number of concurrent workers, each with its own channel
    pub workers: usize,

    /// How long to wait for a publish confirmation
    pub confirm_timeout: Duration,

    /// Capacity of the job queue feeding the workers
    pub job_buffer: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue: "transactions_queue".to_string(),
            workers: 4,
            confirm_timeout: Duration::from_secs(5),
            job_buffer: 500,
        }
    }
}
