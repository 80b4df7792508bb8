use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::aggregation::store::{AggregateKey, AggregateRow, AggregateStore, AggregateStoreError};
use crate::calendar::{Bucketing, CalendarError, PeriodBucketer};
use crate::ledger::types::{PointAwarded, PointTransaction};
use crate::types::{BucketKey, ContextRef, ContextType, Period, PeriodRange};

pub mod store;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregationError {
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("aggregate update for {student_id} lost {attempts} compare-and-swap attempts")]
    ConcurrencyConflict { student_id: String, attempts: u32 },
    #[error("aggregate store error: {0}")]
    Store(String),
}

impl From<AggregateStoreError> for AggregationError {
    fn from(error: AggregateStoreError) -> Self {
        Self::Store(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AppliedBuckets {
    pub buckets: Vec<(Period, PeriodRange)>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub context_type: ContextType,
    pub context_id: String,
    pub transactions_scanned: usize,
    pub rows_rebuilt: usize,
    pub drift_corrected: usize,
    pub degraded: bool,
    #[serde(skip)]
    pub touched: Vec<BucketKey>,
}

/// Maintains per (student, context, period bucket) running totals.
pub struct AggregationEngine {
    store: Arc<dyn AggregateStore>,
    bucketer: PeriodBucketer,
    max_attempts: u32,
    gates: Mutex<HashMap<ContextRef, Arc<RwLock<()>>>>,
    rebuilt: Mutex<HashSet<ContextRef>>,
    cas_retries: AtomicU64,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn AggregateStore>, bucketer: PeriodBucketer, max_attempts: u32) -> Self {
        Self {
            store,
            bucketer,
            max_attempts: max_attempts.max(1),
            gates: Mutex::new(HashMap::new()),
            rebuilt: Mutex::new(HashSet::new()),
            cas_retries: AtomicU64::new(0),
        }
    }

    /// Writers hold the read side while appending and incrementing; a full recompute
    /// holds the write side so it never interleaves with an increment.
    pub async fn ingest_gate(&self, context: &ContextRef) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().await;
        gates.entry(context.clone()).or_default().clone()
    }

    /// Whether the context's rows were rebuilt from the ledger in this process.
    pub async fn is_rebuilt(&self, context: &ContextRef) -> bool {
        self.rebuilt.lock().await.contains(context)
    }

    pub async fn mark_rebuilt(&self, context: &ContextRef) {
        self.rebuilt.lock().await.insert(context.clone());
    }

    pub fn cas_retries(&self) -> u64 {
        self.cas_retries.load(Ordering::Relaxed)
    }

    pub async fn bucket_for(
        &self,
        context: &ContextRef,
        period: Period,
        at: DateTime<Utc>,
    ) -> Result<(PeriodRange, bool), AggregationError> {
        Ok(self.bucketer.bucket(context, period, at).await?)
    }

    pub async fn buckets_for(
        &self,
        context: &ContextRef,
        periods: &[Period],
        at: DateTime<Utc>,
    ) -> Result<Bucketing, AggregationError> {
        Ok(self.bucketer.buckets(context, periods, at).await?)
    }

    /// Folds one award into every enabled period bucket containing its timestamp.
    pub async fn apply(
        &self,
        awarded: &PointAwarded,
        periods: &[Period],
    ) -> Result<AppliedBuckets, AggregationError> {
        let bucketing = self
            .buckets_for(&awarded.context, periods, awarded.timestamp)
            .await?;
        for (period, bucket) in &bucketing.buckets {
            self.increment(awarded, *period, *bucket).await?;
        }
        Ok(AppliedBuckets {
            buckets: bucketing.buckets,
            degraded: bucketing.degraded,
        })
    }

    async fn increment(
        &self,
        awarded: &PointAwarded,
        period: Period,
        bucket: PeriodRange,
    ) -> Result<(), AggregationError> {
        let key = AggregateKey {
            student_id: awarded.student_id.clone(),
            period,
            bucket_start: bucket.start,
        };
        for attempt in 1..=self.max_attempts {
            let current = self.store.load(&awarded.context, &key).await?;
            let expected = current.as_ref().map(|row| row.version);
            let mut next = current.unwrap_or_else(|| AggregateRow {
                student_id: awarded.student_id.clone(),
                context: awarded.context.clone(),
                period,
                bucket,
                points: 0,
                first_point_at: None,
                version: 0,
            });
            fold_amount(&mut next, awarded.amount, awarded.timestamp);
            next.version = expected.map_or(1, |version| version + 1);

            if self.store.compare_and_swap(expected, next).await? {
                return Ok(());
            }
            self.cas_retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                context = %awarded.context,
                student_id = %awarded.student_id,
                period = period.as_str(),
                attempt,
                "aggregate compare-and-swap lost; retrying"
            );
        }
        Err(AggregationError::ConcurrencyConflict {
            student_id: awarded.student_id.clone(),
            attempts: self.max_attempts,
        })
    }

    pub async fn bucket_totals(
        &self,
        context: &ContextRef,
        period: Period,
        bucket: PeriodRange,
    ) -> Result<Vec<AggregateRow>, AggregationError> {
        Ok(self
            .store
            .bucket_rows(context, period, bucket.start)
            .await?)
    }

    /// Rebuilds every row of the context from ledger rows. The caller holds the ingest gate.
    pub async fn recompute(
        &self,
        context: &ContextRef,
        transactions: &[PointTransaction],
        periods: &[Period],
    ) -> Result<RecomputeSummary, AggregationError> {
        let mut rebuilt: HashMap<AggregateKey, AggregateRow> = HashMap::new();
        let mut degraded = false;
        for transaction in transactions {
            let bucketing = self
                .buckets_for(context, periods, transaction.timestamp)
                .await?;
            degraded |= bucketing.degraded;
            for (period, bucket) in bucketing.buckets {
                accumulate(&mut rebuilt, context, period, bucket, transaction);
            }
        }

        let previous: HashMap<AggregateKey, AggregateRow> = self
            .store
            .context_rows(context)
            .await?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect();

        let mut drift_corrected = 0;
        let mut touched: HashSet<BucketKey> = HashSet::new();
        for (key, row) in &mut rebuilt {
            match previous.get(key) {
                Some(old) => {
                    if !old.same_totals(row) {
                        drift_corrected += 1;
                    }
                    row.version = old.version + 1;
                }
                None => drift_corrected += 1,
            }
            touched.insert(bucket_key(row));
        }
        for (key, old) in &previous {
            if !rebuilt.contains_key(key) {
                drift_corrected += 1;
                touched.insert(bucket_key(old));
            }
        }

        let rows_rebuilt = rebuilt.len();
        self.store
            .replace_context(context, rebuilt.into_values().collect())
            .await?;

        tracing::info!(
            context = %context,
            transactions = transactions.len(),
            rows_rebuilt,
            drift_corrected,
            degraded,
            "aggregates recomputed from ledger"
        );
        Ok(RecomputeSummary {
            context_type: context.context_type,
            context_id: context.context_id.clone(),
            transactions_scanned: transactions.len(),
            rows_rebuilt,
            drift_corrected,
            degraded,
            touched: touched.into_iter().collect(),
        })
    }
}

/// Totals for one bucket straight from ledger rows, bypassing the aggregate store.
pub fn totals_from_transactions<'a>(
    context: &ContextRef,
    period: Period,
    bucket: PeriodRange,
    transactions: impl IntoIterator<Item = &'a PointTransaction>,
) -> Vec<AggregateRow> {
    let mut rows = HashMap::new();
    for transaction in transactions {
        if bucket.contains(transaction.timestamp) {
            accumulate(&mut rows, context, period, bucket, transaction);
        }
    }
    let mut rows: Vec<AggregateRow> = rows.into_values().collect();
    rows.sort_by(|left, right| left.student_id.cmp(&right.student_id));
    rows
}

fn accumulate(
    rows: &mut HashMap<AggregateKey, AggregateRow>,
    context: &ContextRef,
    period: Period,
    bucket: PeriodRange,
    transaction: &PointTransaction,
) {
    let key = AggregateKey {
        student_id: transaction.student_id.clone(),
        period,
        bucket_start: bucket.start,
    };
    let row = rows.entry(key).or_insert_with(|| AggregateRow {
        student_id: transaction.student_id.clone(),
        context: context.clone(),
        period,
        bucket,
        points: 0,
        first_point_at: None,
        version: 1,
    });
    fold_amount(row, transaction.amount, transaction.timestamp);
}

fn fold_amount(row: &mut AggregateRow, amount: i64, timestamp: DateTime<Utc>) {
    row.points = row.points.saturating_add(amount);
    if amount > 0 {
        row.first_point_at = Some(
            row.first_point_at
                .map_or(timestamp, |earliest| earliest.min(timestamp)),
        );
    }
}

fn bucket_key(row: &AggregateRow) -> BucketKey {
    BucketKey {
        context: row.context.clone(),
        period: row.period,
        bucket_start: row.bucket.start,
    }
}
