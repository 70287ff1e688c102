//! Bounded job queue between the record source and the publisher workers.
//!
//! One producer, many consumers: workers share the receiving half behind an
//! async mutex and take whichever job is next.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use transaction_schema::Transaction;

use crate::error::JobQueueClosed;

/// Create a queue holding at most `capacity` pending transactions
pub fn job_queue(capacity: usize) -> (JobSender, JobQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        JobSender { tx },
        JobQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Sending half. Dropping every clone closes the queue.
#[derive(Clone)]
pub struct JobSender {
    tx: mpsc::Sender<Transaction>,
}

impl JobSender {
    /// Enqueue, waiting while the queue is full
    pub async fn send(&self, transaction: Transaction) -> Result<(), JobQueueClosed> {
        self.tx.send(transaction).await.map_err(|_| JobQueueClosed)
    }

    /// Enqueue from a blocking thread. Must not be called on an async worker thread.
    pub fn blocking_send(&self, transaction: Transaction) -> Result<(), JobQueueClosed> {
        self.tx.blocking_send(transaction).map_err(|_| JobQueueClosed)
    }
}

/// Receiving half shared by the publisher workers.
#[derive(Clone)]
pub struct JobQueue {
    rx: Arc<Mutex<mpsc::Receiver<Transaction>>>,
}

impl JobQueue {
    /// Next job, or `None` once the queue is closed and drained
    pub async fn next(&self) -> Option<Transaction> {
        self.rx.lock().await.recv().await
    }
}
