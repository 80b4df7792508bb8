use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::types::{ContextRef, Period, PeriodRange};

#[derive(Debug, thiserror::Error)]
pub enum AggregateStoreError {
    #[error("aggregate store error: {0}")]
    Backend(String),
}

/// Row identity inside one context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub student_id: String,
    pub period: Period,
    pub bucket_start: Option<DateTime<Utc>>,
}

/// Running total for one student in one period bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub student_id: String,
    pub context: ContextRef,
    pub period: Period,
    pub bucket: PeriodRange,
    pub points: i64,
    pub first_point_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl AggregateRow {
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            student_id: self.student_id.clone(),
            period: self.period,
            bucket_start: self.bucket.start,
        }
    }

    /// Same totals, ignoring the version counter.
    pub fn same_totals(&self, other: &Self) -> bool {
        self.points == other.points
            && self.first_point_at == other.first_point_at
            && self.bucket == other.bucket
    }
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn load(
        &self,
        context: &ContextRef,
        key: &AggregateKey,
    ) -> Result<Option<AggregateRow>, AggregateStoreError>;

    /// Writes `row` only when the stored version still equals `expected_version`
    /// (`None` meaning absent). Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        row: AggregateRow,
    ) -> Result<bool, AggregateStoreError>;

    async fn bucket_rows(
        &self,
        context: &ContextRef,
        period: Period,
        bucket_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError>;

    async fn context_rows(
        &self,
        context: &ContextRef,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError>;

    /// Atomically swaps every row of the context for `rows`.
    async fn replace_context(
        &self,
        context: &ContextRef,
        rows: Vec<AggregateRow>,
    ) -> Result<(), AggregateStoreError>;
}

pub fn memory() -> Arc<dyn AggregateStore> {
    Arc::new(MemoryAggregateStore::default())
}

type ContextRows = HashMap<AggregateKey, AggregateRow>;

#[derive(Default)]
struct MemoryAggregateStore {
    shards: RwLock<HashMap<ContextRef, Arc<Mutex<ContextRows>>>>,
}

impl MemoryAggregateStore {
    async fn shard(&self, context: &ContextRef) -> Option<Arc<Mutex<ContextRows>>> {
        self.shards.read().await.get(context).cloned()
    }

    async fn shard_or_create(&self, context: &ContextRef) -> Arc<Mutex<ContextRows>> {
        if let Some(shard) = self.shard(context).await {
            return shard;
        }
        let mut shards = self.shards.write().await;
        shards.entry(context.clone()).or_default().clone()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn load(
        &self,
        context: &ContextRef,
        key: &AggregateKey,
    ) -> Result<Option<AggregateRow>, AggregateStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(None);
        };
        let rows = shard.lock().await;
        Ok(rows.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        row: AggregateRow,
    ) -> Result<bool, AggregateStoreError> {
        let shard = self.shard_or_create(&row.context).await;
        let mut rows = shard.lock().await;
        let key = row.key();
        let current = rows.get(&key).map(|existing| existing.version);
        if current != expected_version {
            return Ok(false);
        }
        rows.insert(key, row);
        Ok(true)
    }

    async fn bucket_rows(
        &self,
        context: &ContextRef,
        period: Period,
        bucket_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(Vec::new());
        };
        let rows = shard.lock().await;
        let mut out: Vec<AggregateRow> = rows
            .values()
            .filter(|row| row.period == period && row.bucket.start == bucket_start)
            .cloned()
            .collect();
        out.sort_by(|left, right| left.student_id.cmp(&right.student_id));
        Ok(out)
    }

    async fn context_rows(
        &self,
        context: &ContextRef,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(Vec::new());
        };
        let rows = shard.lock().await;
        Ok(rows.values().cloned().collect())
    }

    async fn replace_context(
        &self,
        context: &ContextRef,
        rows: Vec<AggregateRow>,
    ) -> Result<(), AggregateStoreError> {
        let shard = self.shard_or_create(context).await;
        let mut current = shard.lock().await;
        *current = rows.into_iter().map(|row| (row.key(), row)).collect();
        Ok(())
    }
}
