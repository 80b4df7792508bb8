use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::db::LeaderboardDb;
use crate::types::{ContextRef, ContextType, LeaderboardSnapshot, Period, PeriodRange};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Board identity of a snapshot series, without the date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub context: ContextRef,
    pub partition_key: Option<String>,
    pub period: Period,
}

impl SeriesKey {
    fn matches(&self, snapshot: &LeaderboardSnapshot) -> bool {
        snapshot.partition_key == self.partition_key && snapshot.period == self.period
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Half-open window over `as_of`.
    pub range: PeriodRange,
    pub period: Option<Period>,
    pub partition_key: Option<String>,
}

impl HistoryFilter {
    fn matches(&self, snapshot: &LeaderboardSnapshot) -> bool {
        self.range.contains(snapshot.as_of)
            && self.period.is_none_or(|period| snapshot.period == period)
            && self
                .partition_key
                .as_deref()
                .is_none_or(|partition| snapshot.partition_key.as_deref() == Some(partition))
    }
}

/// Keyset position: history pages resume strictly after `(as_of, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCursor {
    pub as_of: DateTime<Utc>,
    pub id: String,
}

impl SnapshotCursor {
    pub fn after(snapshot: &LeaderboardSnapshot) -> Self {
        Self {
            as_of: snapshot.as_of,
            id: snapshot.id.clone(),
        }
    }

    fn precedes(&self, snapshot: &LeaderboardSnapshot) -> bool {
        (self.as_of, self.id.as_str()) < (snapshot.as_of, snapshot.id.as_str())
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Inserts unless a snapshot with the same (series, snapshot_date) exists.
    /// Returns the stored snapshot and whether this call created it.
    async fn create_or_get(
        &self,
        snapshot: LeaderboardSnapshot,
    ) -> Result<(LeaderboardSnapshot, bool), SnapshotStoreError>;

    async fn get(
        &self,
        context: &ContextRef,
        snapshot_id: &str,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError>;

    /// Most recent snapshot of the series with `as_of` strictly before `before`.
    async fn latest_before(
        &self,
        series: &SeriesKey,
        before: DateTime<Utc>,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError>;

    /// One page ordered by `(as_of, id)` ascending.
    async fn list(
        &self,
        context: &ContextRef,
        filter: &HistoryFilter,
        after: Option<&SnapshotCursor>,
        limit: usize,
    ) -> Result<Vec<LeaderboardSnapshot>, SnapshotStoreError>;

    /// Deletes all but the newest `keep_latest` snapshots of the series.
    async fn prune_keep_latest(
        &self,
        series: &SeriesKey,
        keep_latest: usize,
    ) -> Result<u64, SnapshotStoreError>;
}

pub fn memory() -> Arc<dyn SnapshotStore> {
    Arc::new(MemorySnapshotStore::default())
}

pub fn postgres(db: Arc<LeaderboardDb>) -> Arc<dyn SnapshotStore> {
    Arc::new(PostgresSnapshotStore { db })
}

#[derive(Default)]
struct MemorySnapshotStore {
    shards: RwLock<HashMap<ContextRef, Arc<Mutex<Vec<LeaderboardSnapshot>>>>>,
}

impl MemorySnapshotStore {
    async fn shard(&self, context: &ContextRef) -> Option<Arc<Mutex<Vec<LeaderboardSnapshot>>>> {
        self.shards.read().await.get(context).cloned()
    }
}

fn sort_history(rows: &mut [LeaderboardSnapshot]) {
    rows.sort_by(|left, right| {
        left.as_of
            .cmp(&right.as_of)
            .then_with(|| left.id.cmp(&right.id))
    });
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn create_or_get(
        &self,
        snapshot: LeaderboardSnapshot,
    ) -> Result<(LeaderboardSnapshot, bool), SnapshotStoreError> {
        let shard = {
            let mut shards = self.shards.write().await;
            shards.entry(snapshot.context()).or_default().clone()
        };
        let mut rows = shard.lock().await;
        if let Some(existing) = rows.iter().find(|row| {
            row.partition_key == snapshot.partition_key
                && row.period == snapshot.period
                && row.snapshot_date == snapshot.snapshot_date
        }) {
            return Ok((existing.clone(), false));
        }
        rows.push(snapshot.clone());
        Ok((snapshot, true))
    }

    async fn get(
        &self,
        context: &ContextRef,
        snapshot_id: &str,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(None);
        };
        let rows = shard.lock().await;
        Ok(rows.iter().find(|row| row.id == snapshot_id).cloned())
    }

    async fn latest_before(
        &self,
        series: &SeriesKey,
        before: DateTime<Utc>,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        let Some(shard) = self.shard(&series.context).await else {
            return Ok(None);
        };
        let rows = shard.lock().await;
        Ok(rows
            .iter()
            .filter(|row| series.matches(row) && row.as_of < before)
            .max_by(|left, right| {
                left.as_of
                    .cmp(&right.as_of)
                    .then_with(|| left.id.cmp(&right.id))
            })
            .cloned())
    }

    async fn list(
        &self,
        context: &ContextRef,
        filter: &HistoryFilter,
        after: Option<&SnapshotCursor>,
        limit: usize,
    ) -> Result<Vec<LeaderboardSnapshot>, SnapshotStoreError> {
        let Some(shard) = self.shard(context).await else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<LeaderboardSnapshot> = {
            let rows = shard.lock().await;
            rows.iter()
                .filter(|row| filter.matches(row))
                .filter(|row| after.is_none_or(|cursor| cursor.precedes(row)))
                .cloned()
                .collect()
        };
        sort_history(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn prune_keep_latest(
        &self,
        series: &SeriesKey,
        keep_latest: usize,
    ) -> Result<u64, SnapshotStoreError> {
        let Some(shard) = self.shard(&series.context).await else {
            return Ok(0);
        };
        let mut rows = shard.lock().await;
        let mut in_series: Vec<LeaderboardSnapshot> =
            rows.iter().filter(|row| series.matches(row)).cloned().collect();
        sort_history(&mut in_series);
        let doomed: Vec<String> = in_series
            .iter()
            .rev()
            .skip(keep_latest)
            .map(|row| row.id.clone())
            .collect();
        rows.retain(|row| !doomed.contains(&row.id));
        Ok(doomed.len() as u64)
    }
}

struct PostgresSnapshotStore {
    db: Arc<LeaderboardDb>,
}

const BY_SERIES_DATE_SQL: &str = r#"
    SELECT snapshot_id, context_type, context_id, partition_key, period,
           snapshot_date, as_of, bucket_start, bucket_end, entries, degraded, created_at
      FROM leaderboard.snapshots
     WHERE context_type = $1 AND context_id = $2 AND partition_key = $3
       AND period = $4 AND snapshot_date = $5
"#;

const BY_ID_SQL: &str = r#"
    SELECT snapshot_id, context_type, context_id, partition_key, period,
           snapshot_date, as_of, bucket_start, bucket_end, entries, degraded, created_at
      FROM leaderboard.snapshots
     WHERE context_type = $1 AND context_id = $2 AND snapshot_id = $3
"#;

const LATEST_BEFORE_SQL: &str = r#"
    SELECT snapshot_id, context_type, context_id, partition_key, period,
           snapshot_date, as_of, bucket_start, bucket_end, entries, degraded, created_at
      FROM leaderboard.snapshots
     WHERE context_type = $1 AND context_id = $2 AND partition_key = $3
       AND period = $4 AND as_of < $5
     ORDER BY as_of DESC, snapshot_id DESC
     LIMIT 1
"#;

const LIST_SQL: &str = r#"
    SELECT snapshot_id, context_type, context_id, partition_key, period,
           snapshot_date, as_of, bucket_start, bucket_end, entries, degraded, created_at
      FROM leaderboard.snapshots
     WHERE context_type = $1 AND context_id = $2
       AND ($3::timestamptz IS NULL OR as_of >= $3)
       AND ($4::timestamptz IS NULL OR as_of < $4)
       AND ($5::text IS NULL OR period = $5)
       AND ($6::text IS NULL OR partition_key = $6)
       AND ($7::timestamptz IS NULL OR (as_of, snapshot_id) > ($7, $8::text))
     ORDER BY as_of ASC, snapshot_id ASC
     LIMIT $9
"#;

const PRUNE_SQL: &str = r#"
    DELETE FROM leaderboard.snapshots
     WHERE snapshot_id IN (
        SELECT snapshot_id
          FROM leaderboard.snapshots
         WHERE context_type = $1 AND context_id = $2 AND partition_key = $3 AND period = $4
         ORDER BY as_of DESC, snapshot_id DESC
        OFFSET $5
     )
"#;

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn create_or_get(
        &self,
        snapshot: LeaderboardSnapshot,
    ) -> Result<(LeaderboardSnapshot, bool), SnapshotStoreError> {
        let entries = serde_json::to_value(&snapshot.entries)
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;
        let partition_key = snapshot.partition_key.clone().unwrap_or_default();
        let client = self.db.client();
        let client = client.lock().await;

        let inserted = client
            .query_opt(
                r#"
                INSERT INTO leaderboard.snapshots (
                    snapshot_id, context_type, context_id, partition_key, period,
                    snapshot_date, as_of, bucket_start, bucket_end, entries, degraded, created_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12
                )
                ON CONFLICT (context_type, context_id, partition_key, period, snapshot_date) DO NOTHING
                RETURNING snapshot_id
                "#,
                &[
                    &snapshot.id,
                    &snapshot.context_type.as_str(),
                    &snapshot.context_id,
                    &partition_key,
                    &snapshot.period.as_str(),
                    &snapshot.snapshot_date,
                    &snapshot.as_of,
                    &snapshot.bucket.start,
                    &snapshot.bucket.end,
                    &entries,
                    &snapshot.degraded,
                    &snapshot.created_at,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;

        if inserted.is_some() {
            return Ok((snapshot, true));
        }

        let existing = client
            .query_one(
                BY_SERIES_DATE_SQL,
                &[
                    &snapshot.context_type.as_str(),
                    &snapshot.context_id,
                    &partition_key,
                    &snapshot.period.as_str(),
                    &snapshot.snapshot_date,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;
        let existing = map_snapshot_row(&existing).map_err(SnapshotStoreError::Db)?;
        Ok((existing, false))
    }

    async fn get(
        &self,
        context: &ContextRef,
        snapshot_id: &str,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                BY_ID_SQL,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &snapshot_id,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_snapshot_row(&row).map_err(SnapshotStoreError::Db)?))
    }

    async fn latest_before(
        &self,
        series: &SeriesKey,
        before: DateTime<Utc>,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        let partition_key = series.partition_key.clone().unwrap_or_default();
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                LATEST_BEFORE_SQL,
                &[
                    &series.context.context_type.as_str(),
                    &series.context.context_id,
                    &partition_key,
                    &series.period.as_str(),
                    &before,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(map_snapshot_row(&row).map_err(SnapshotStoreError::Db)?))
    }

    async fn list(
        &self,
        context: &ContextRef,
        filter: &HistoryFilter,
        after: Option<&SnapshotCursor>,
        limit: usize,
    ) -> Result<Vec<LeaderboardSnapshot>, SnapshotStoreError> {
        let period = filter.period.map(Period::as_str);
        let after_as_of = after.map(|cursor| cursor.as_of);
        let after_id = after.map(|cursor| cursor.id.as_str());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                LIST_SQL,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &filter.range.start,
                    &filter.range.end,
                    &period,
                    &filter.partition_key,
                    &after_as_of,
                    &after_id,
                    &limit,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_snapshot_row(row).map_err(SnapshotStoreError::Db))
            .collect()
    }

    async fn prune_keep_latest(
        &self,
        series: &SeriesKey,
        keep_latest: usize,
    ) -> Result<u64, SnapshotStoreError> {
        let partition_key = series.partition_key.clone().unwrap_or_default();
        let keep_latest = i64::try_from(keep_latest).unwrap_or(i64::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                PRUNE_SQL,
                &[
                    &series.context.context_type.as_str(),
                    &series.context.context_id,
                    &partition_key,
                    &series.period.as_str(),
                    &keep_latest,
                ],
            )
            .await
            .map_err(|error| SnapshotStoreError::Db(error.to_string()))
    }
}

fn map_snapshot_row(row: &tokio_postgres::Row) -> Result<LeaderboardSnapshot, String> {
    let context_type: String = row.try_get("context_type").map_err(|e| e.to_string())?;
    let period: String = row.try_get("period").map_err(|e| e.to_string())?;
    let partition_key: String = row.try_get("partition_key").map_err(|e| e.to_string())?;
    let entries: serde_json::Value = row.try_get("entries").map_err(|e| e.to_string())?;
    Ok(LeaderboardSnapshot {
        id: row.try_get("snapshot_id").map_err(|e| e.to_string())?,
        context_type: ContextType::parse(&context_type)
            .ok_or_else(|| format!("unknown context_type: {context_type}"))?,
        context_id: row.try_get("context_id").map_err(|e| e.to_string())?,
        partition_key: Some(partition_key).filter(|value| !value.is_empty()),
        period: Period::parse(&period).ok_or_else(|| format!("unknown period: {period}"))?,
        snapshot_date: row.try_get("snapshot_date").map_err(|e| e.to_string())?,
        as_of: row.try_get("as_of").map_err(|e| e.to_string())?,
        bucket: PeriodRange {
            start: row.try_get("bucket_start").map_err(|e| e.to_string())?,
            end: row.try_get("bucket_end").map_err(|e| e.to_string())?,
        },
        entries: serde_json::from_value(entries).map_err(|e| e.to_string())?,
        degraded: row.try_get("degraded").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}
