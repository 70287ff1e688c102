//! In-memory transaction store with fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use transaction_schema::Transaction;

use crate::error::{StoreError, StoreResult};
use crate::store::TransactionStore;

#[derive(Default)]
struct State {
    rows: HashMap<String, Transaction>,
    failing_batches: usize,
    failing_ids: HashSet<String>,
    batch_calls: usize,
    single_calls: usize,
}

/// [`TransactionStore`] keeping rows in a map, first write wins.
#[derive(Default)]
pub struct MemoryTransactionStore {
    state: Mutex<State>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` batch writes fail as a whole
    pub fn fail_batches(&self, count: usize) {
        self.state.lock().failing_batches = count;
    }

    /// Make every write touching one of `ids` fail until cleared
    pub fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().failing_ids = ids.into_iter().map(Into::into).collect();
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_batches = 0;
        state.failing_ids.clear();
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.state.lock().rows.get(id).cloned()
    }

    /// `(batch writes, single-record writes)` attempted so far
    pub fn calls(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.batch_calls, state.single_calls)
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn apply_batch(&self, batch: &[Transaction]) -> StoreResult<u64> {
        let mut state = self.state.lock();
        state.batch_calls += 1;

        if state.failing_batches > 0 {
            state.failing_batches -= 1;
            return Err(StoreError::Unavailable("injected batch failure".to_string()));
        }
        if let Some(tx) = batch.iter().find(|tx| state.failing_ids.contains(&tx.id)) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {}",
                tx.id
            )));
        }

        let mut written = 0;
        for tx in batch {
            if !state.rows.contains_key(&tx.id) {
                state.rows.insert(tx.id.clone(), tx.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn apply_one(&self, transaction: &Transaction) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.single_calls += 1;

        if state.failing_ids.contains(&transaction.id) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {}",
                transaction.id
            )));
        }
        if state.rows.contains_key(&transaction.id) {
            return Ok(false);
        }
        state
            .rows
            .insert(transaction.id.clone(), transaction.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tx(id: &str, name: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            date: Utc::now(),
            document: "doc".to_string(),
            name: name.to_string(),
            age: 20,
            amount: 1.0,
            installments: 1,
        }
    }

    #[tokio::test]
    async fn test_intra_batch_duplicates_are_no_ops() {
        let store = MemoryTransactionStore::new();
        let batch = [tx("A", "first"), tx("B", ""), tx("A", "second")];

        assert_eq!(store.apply_batch(&batch).await.unwrap(), 2);
        assert_eq!(store.get("A").unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let store = MemoryTransactionStore::new();
        store.fail_ids(["B"]);

        assert!(store.apply_batch(&[tx("A", ""), tx("B", "")]).await.is_err());
        assert_eq!(store.row_count(), 0);

        assert!(store.apply_one(&tx("A", "")).await.unwrap());
        assert!(store.apply_one(&tx("B", "")).await.is_err());
        assert_eq!(store.calls(), (1, 2));
    }

    #[tokio::test]
    async fn test_fail_batches_counts_down() {
        let store = MemoryTransactionStore::new();
        store.fail_batches(1);

        assert!(store.apply_batch(&[tx("A", "")]).await.is_err());
        assert_eq!(store.apply_batch(&[tx("A", "")]).await.unwrap(), 1);
    }
}
