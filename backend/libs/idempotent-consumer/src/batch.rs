//! Size- and age-bounded batch buffer.

use std::time::Duration;
use tokio::time::Instant;
use transaction_schema::Transaction;

/// Ordered `(Transaction, delivery)` pairs owned by one consume worker.
///
/// Full at `max_size` items; expired `max_age` after the first item was
/// pushed. [`Batch::take`] empties it and restarts the age clock.
#[derive(Debug)]
pub struct Batch<D> {
    items: Vec<(Transaction, D)>,
    max_size: usize,
    max_age: Duration,
    started: Option<Instant>,
}

impl<D> Batch<D> {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            max_age,
            started: None,
        }
    }

    /// Append an item. Returns `true` once the batch is full.
    pub fn push(&mut self, transaction: Transaction, delivery: D) -> bool {
        if self.items.is_empty() {
            self.started = Some(Instant::now());
        }
        self.items.push((transaction, delivery));
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// When the batch must be flushed, if it holds anything
    pub fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.max_age)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Drain every item, leaving the batch empty
    pub fn take(&mut self) -> Vec<(Transaction, D)> {
        self.started = None;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }
}
