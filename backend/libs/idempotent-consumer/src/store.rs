//! Idempotent transaction store.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use transaction_schema::Transaction;

use crate::error::StoreResult;

/// Conflict-ignoring persistence keyed by transaction `id`.
///
/// Writing an `id` that is already stored, or that appears earlier in the
/// same batch, is a no-op rather than an error. Implementations report how
/// many rows were actually written.
#[async_trait]
pub trait TransactionStore: Send + Sync + 'static {
    /// Write a batch atomically: either every conflict decision becomes
    /// visible together or the call fails and nothing is written.
    async fn apply_batch(&self, batch: &[Transaction]) -> StoreResult<u64>;

    /// Write one record. `Ok(false)` when the `id` was already stored.
    async fn apply_one(&self, transaction: &Transaction) -> StoreResult<bool>;
}

const INSERT_PREFIX: &str =
    "INSERT INTO transactions (id, date, document, name, age, amount, installments) ";

const ON_CONFLICT: &str = " ON CONFLICT (id) DO NOTHING";

/// PostgreSQL caps bind parameters per statement at 65535
const BIND_LIMIT: usize = 65_535;

const COLUMNS: usize = 7;

const ROWS_PER_STATEMENT: usize = BIND_LIMIT / COLUMNS;

/// [`TransactionStore`] backed by a `transactions` table with `id` as primary key.
///
/// See `migrations/001_create_transactions_table.sql` for the expected schema.
#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn insert_statement(rows: &[Transaction]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(INSERT_PREFIX);
    builder.push_values(rows, |mut row, tx| {
        row.push_bind(&tx.id)
            .push_bind(tx.date)
            .push_bind(&tx.document)
            .push_bind(&tx.name)
            .push_bind(i64::from(tx.age))
            .push_bind(tx.amount)
            .push_bind(i64::from(tx.installments));
    });
    builder.push(ON_CONFLICT);
    builder
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn apply_batch(&self, batch: &[Transaction]) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut db_tx = self.pool.begin().await?;
        let mut written = 0;
        for chunk in batch.chunks(ROWS_PER_STATEMENT) {
            let result = insert_statement(chunk).build().execute(&mut *db_tx).await?;
            written += result.rows_affected();
        }
        db_tx.commit().await?;

        debug!(batch_size = batch.len(), written = written, "Batch upserted");
        Ok(written)
    }

    async fn apply_one(&self, transaction: &Transaction) -> StoreResult<bool> {
        let result = insert_statement(std::slice::from_ref(transaction))
            .build()
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tx(id: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            date: Utc::now(),
            document: "doc".to_string(),
            name: "name".to_string(),
            age: 20,
            amount: 1.0,
            installments: 1,
        }
    }

    #[test]
    fn test_insert_statement_shape() {
        let rows = [tx("a"), tx("b")];
        let builder = insert_statement(&rows);
        let sql = builder.sql();

        assert!(sql.starts_with("INSERT INTO transactions (id, date, document"));
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7), ($8, $9, $10, $11, $12, $13, $14)"));
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn test_chunk_size_stays_under_bind_limit() {
        assert!(ROWS_PER_STATEMENT * COLUMNS <= BIND_LIMIT);
    }
}
