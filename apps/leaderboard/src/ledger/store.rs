use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_postgres::error::SqlState;

use crate::db::LeaderboardDb;
use crate::ledger::types::PointTransaction;
use crate::types::{ContextRef, ContextType, PeriodRange};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Append-only transaction storage. Rows are never updated or deleted.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends the row unless `(context, source_event_id)` already exists.
    /// Returns the stored row and whether this call inserted it.
    async fn append_or_get(
        &self,
        transaction: PointTransaction,
    ) -> Result<(PointTransaction, bool), LedgerStoreError>;

    async fn get(
        &self,
        context: &ContextRef,
        transaction_id: &str,
    ) -> Result<Option<PointTransaction>, LedgerStoreError>;

    /// Rows in `[range.start, range.end)` ordered by timestamp then transaction id.
    async fn list(
        &self,
        context: &ContextRef,
        range: PeriodRange,
        student_id: Option<&str>,
    ) -> Result<Vec<PointTransaction>, LedgerStoreError>;

    async fn sum_points(
        &self,
        context: &ContextRef,
        student_id: &str,
        range: PeriodRange,
    ) -> Result<i64, LedgerStoreError>;

    async fn has_context(&self, context: &ContextRef) -> Result<bool, LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<LeaderboardDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

/// One lock per context so writers in different classes never contend.
#[derive(Default)]
struct MemoryLedgerStore {
    shards: RwLock<HashMap<ContextRef, Arc<Mutex<ContextLedger>>>>,
}

#[derive(Default)]
struct ContextLedger {
    rows: Vec<PointTransaction>,
    by_id: HashMap<String, usize>,
    reversal_of: HashMap<String, usize>,
}

impl MemoryLedgerStore {
    async fn shard(&self, context: &ContextRef) -> Option<Arc<Mutex<ContextLedger>>> {
        self.shards.read().await.get(context).cloned()
    }

    async fn shard_or_create(&self, context: &ContextRef) -> Arc<Mutex<ContextLedger>> {
        if let Some(shard) = self.shard(context).await {
            return shard;
        }
        let mut shards = self.shards.write().await;
        shards.entry(context.clone()).or_default().clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append_or_get(
        &self,
        transaction: PointTransaction,
    ) -> Result<(PointTransaction, bool), LedgerStoreError> {
        let shard = self.shard_or_create(&transaction.context()).await;
        let mut ledger = shard.lock().await;
        if let Some(index) = ledger.by_id.get(&transaction.transaction_id) {
            return Ok((ledger.rows[*index].clone(), false));
        }
        if let Some(original) = transaction
            .reverses_transaction_id
            .as_deref()
            .filter(|original| ledger.reversal_of.contains_key(*original))
        {
            return Err(LedgerStoreError::Conflict(format!(
                "transaction {original} already reversed"
            )));
        }
        let index = ledger.rows.len();
        ledger
            .by_id
            .insert(transaction.transaction_id.clone(), index);
        if let Some(original) = transaction.reverses_transaction_id.clone() {
            ledger.reversal_of.insert(original, index);
        }
        ledger.rows.push(transaction.clone());
        Ok((transaction, true))
    }

    async fn get(
        &self,
        context: &ContextRef,
        transaction_id: &str,
    ) -> Result<Option<PointTransaction>, LedgerStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(None);
        };
        let ledger = shard.lock().await;
        Ok(ledger
            .by_id
            .get(transaction_id)
            .map(|index| ledger.rows[*index].clone()))
    }

    async fn list(
        &self,
        context: &ContextRef,
        range: PeriodRange,
        student_id: Option<&str>,
    ) -> Result<Vec<PointTransaction>, LedgerStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(Vec::new());
        };
        let ledger = shard.lock().await;
        let mut rows: Vec<PointTransaction> = ledger
            .rows
            .iter()
            .filter(|row| range.contains(row.timestamp))
            .filter(|row| student_id.is_none_or(|student| row.student_id == student))
            .cloned()
            .collect();
        rows.sort_by(|left, right| {
            left.timestamp
                .cmp(&right.timestamp)
                .then_with(|| left.transaction_id.cmp(&right.transaction_id))
        });
        Ok(rows)
    }

    async fn sum_points(
        &self,
        context: &ContextRef,
        student_id: &str,
        range: PeriodRange,
    ) -> Result<i64, LedgerStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(0);
        };
        let ledger = shard.lock().await;
        Ok(ledger
            .rows
            .iter()
            .filter(|row| row.student_id == student_id && range.contains(row.timestamp))
            .map(|row| row.amount)
            .sum())
    }

    async fn has_context(&self, context: &ContextRef) -> Result<bool, LedgerStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(false);
        };
        Ok(!shard.lock().await.rows.is_empty())
    }
}

struct PostgresLedgerStore {
    db: Arc<LeaderboardDb>,
}

const EXISTING_BY_SOURCE_SQL: &str = r#"
    SELECT transaction_id, student_id, context_type, context_id, amount,
           category, occurred_at, source_event_id, reverses_transaction_id, recorded_at
      FROM leaderboard.point_transactions
     WHERE context_type = $1 AND context_id = $2 AND source_event_id = $3
"#;

const BY_ID_SQL: &str = r#"
    SELECT transaction_id, student_id, context_type, context_id, amount,
           category, occurred_at, source_event_id, reverses_transaction_id, recorded_at
      FROM leaderboard.point_transactions
     WHERE context_type = $1 AND context_id = $2 AND transaction_id = $3
"#;

const LIST_SQL: &str = r#"
    SELECT transaction_id, student_id, context_type, context_id, amount,
           category, occurred_at, source_event_id, reverses_transaction_id, recorded_at
      FROM leaderboard.point_transactions
     WHERE context_type = $1 AND context_id = $2
       AND ($3::timestamptz IS NULL OR occurred_at >= $3)
       AND ($4::timestamptz IS NULL OR occurred_at < $4)
       AND ($5::text IS NULL OR student_id = $5)
     ORDER BY occurred_at ASC, transaction_id ASC
"#;

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn append_or_get(
        &self,
        transaction: PointTransaction,
    ) -> Result<(PointTransaction, bool), LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;

        let inserted = client
            .query_opt(
                r#"
                INSERT INTO leaderboard.point_transactions (
                    transaction_id, student_id, context_type, context_id, amount,
                    category, occurred_at, source_event_id, reverses_transaction_id, recorded_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10
                )
                ON CONFLICT (context_type, context_id, source_event_id) DO NOTHING
                RETURNING transaction_id
                "#,
                &[
                    &transaction.transaction_id,
                    &transaction.student_id,
                    &transaction.context_type.as_str(),
                    &transaction.context_id,
                    &transaction.amount,
                    &transaction.category,
                    &transaction.timestamp,
                    &transaction.source_event_id,
                    &transaction.reverses_transaction_id,
                    &transaction.recorded_at,
                ],
            )
            .await
            .map_err(map_write_error)?;

        if inserted.is_some() {
            return Ok((transaction, true));
        }

        let existing = client
            .query_one(
                EXISTING_BY_SOURCE_SQL,
                &[
                    &transaction.context_type.as_str(),
                    &transaction.context_id,
                    &transaction.source_event_id,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let existing = map_transaction_row(&existing).map_err(LedgerStoreError::Db)?;
        Ok((existing, false))
    }

    async fn get(
        &self,
        context: &ContextRef,
        transaction_id: &str,
    ) -> Result<Option<PointTransaction>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                BY_ID_SQL,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &transaction_id,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_transaction_row(&row).map_err(LedgerStoreError::Db)?))
    }

    async fn list(
        &self,
        context: &ContextRef,
        range: PeriodRange,
        student_id: Option<&str>,
    ) -> Result<Vec<PointTransaction>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                LIST_SQL,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &range.start,
                    &range.end,
                    &student_id,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_transaction_row(row).map_err(LedgerStoreError::Db))
            .collect()
    }

    async fn sum_points(
        &self,
        context: &ContextRef,
        student_id: &str,
        range: PeriodRange,
    ) -> Result<i64, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT COALESCE(SUM(amount), 0)::BIGINT AS total
                  FROM leaderboard.point_transactions
                 WHERE context_type = $1
                   AND context_id = $2
                   AND student_id = $3
                   AND ($4::timestamptz IS NULL OR occurred_at >= $4)
                   AND ($5::timestamptz IS NULL OR occurred_at < $5)
                "#,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &student_id,
                    &range.start,
                    &range.end,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        row.try_get("total")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))
    }

    async fn has_context(&self, context: &ContextRef) -> Result<bool, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM leaderboard.point_transactions
                     WHERE context_type = $1 AND context_id = $2
                ) AS present
                "#,
                &[&context.context_type.as_str(), &context.context_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        row.try_get("present")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))
    }
}

fn map_write_error(error: tokio_postgres::Error) -> LedgerStoreError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return LedgerStoreError::Conflict(format!("transaction already reversed: {error}"));
    }
    LedgerStoreError::Db(error.to_string())
}

fn map_transaction_row(row: &tokio_postgres::Row) -> Result<PointTransaction, String> {
    let context_type: String = row.try_get("context_type").map_err(|e| e.to_string())?;
    Ok(PointTransaction {
        transaction_id: row.try_get("transaction_id").map_err(|e| e.to_string())?,
        student_id: row.try_get("student_id").map_err(|e| e.to_string())?,
        context_type: ContextType::parse(&context_type)
            .ok_or_else(|| format!("unknown context_type: {context_type}"))?,
        context_id: row.try_get("context_id").map_err(|e| e.to_string())?,
        amount: row.try_get("amount").map_err(|e| e.to_string())?,
        category: row.try_get("category").map_err(|e| e.to_string())?,
        timestamp: row.try_get("occurred_at").map_err(|e| e.to_string())?,
        source_event_id: row.try_get("source_event_id").map_err(|e| e.to_string())?,
        reverses_transaction_id: row
            .try_get("reverses_transaction_id")
            .map_err(|e| e.to_string())?,
        recorded_at: row.try_get("recorded_at").map_err(|e| e.to_string())?,
    })
}
