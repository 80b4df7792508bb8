use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{Stream, TryStreamExt, stream};

use crate::snapshot::store::{
    HistoryFilter, SeriesKey, SnapshotCursor, SnapshotStore, SnapshotStoreError,
};
use crate::types::{ContextRef, LeaderboardSnapshot, sha256_hex};

pub mod store;

#[cfg(test)]
mod tests;

pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;

/// Deterministic id from the idempotency key.
pub fn snapshot_id_for(series: &SeriesKey, snapshot_date: NaiveDate) -> String {
    let date = snapshot_date.to_string();
    let digest = sha256_hex(&[
        series.context.context_type.as_str(),
        series.context.context_id.as_str(),
        series.partition_key.as_deref().unwrap_or(""),
        series.period.as_str(),
        date.as_str(),
    ]);
    format!("lbs_{}", &digest[..24])
}

/// Ranks from the snapshot a fresh computation compares against.
#[derive(Debug, Clone, Default)]
pub struct PreviousRanks {
    pub snapshot_id: Option<String>,
    pub ranks: HashMap<String, u32>,
}

#[derive(Clone)]
pub struct SnapshotService {
    store: Arc<dyn SnapshotStore>,
    page_size: usize,
}

impl SnapshotService {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }

    pub fn memory() -> Self {
        Self::new(store::memory())
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Immutable once written: a second call for the same key returns the first snapshot.
    pub async fn create(
        &self,
        snapshot: LeaderboardSnapshot,
    ) -> Result<(LeaderboardSnapshot, bool), SnapshotStoreError> {
        let (stored, created) = self.store.create_or_get(snapshot).await?;
        if created {
            tracing::info!(
                snapshot_id = %stored.id,
                context_type = stored.context_type.as_str(),
                context_id = %stored.context_id,
                period = stored.period.as_str(),
                snapshot_date = %stored.snapshot_date,
                entries = stored.entries.len(),
                "leaderboard snapshot created"
            );
        }
        Ok((stored, created))
    }

    pub async fn get(
        &self,
        context: &ContextRef,
        snapshot_id: &str,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        self.store.get(context, snapshot_id).await
    }

    pub async fn latest_before(
        &self,
        series: &SeriesKey,
        before: DateTime<Utc>,
    ) -> Result<Option<LeaderboardSnapshot>, SnapshotStoreError> {
        self.store.latest_before(series, before).await
    }

    pub async fn previous_ranks(
        &self,
        series: &SeriesKey,
        before: DateTime<Utc>,
    ) -> Result<PreviousRanks, SnapshotStoreError> {
        let Some(snapshot) = self.store.latest_before(series, before).await? else {
            return Ok(PreviousRanks::default());
        };
        Ok(PreviousRanks {
            ranks: snapshot
                .entries
                .iter()
                .map(|entry| (entry.student_id.clone(), entry.rank))
                .collect(),
            snapshot_id: Some(snapshot.id),
        })
    }

    /// Pages through history on demand. Every new stream starts over from the store.
    pub fn history_stream(
        &self,
        context: ContextRef,
        filter: HistoryFilter,
    ) -> impl Stream<Item = Result<LeaderboardSnapshot, SnapshotStoreError>> + Send + 'static {
        let pager = HistoryPager {
            store: self.store.clone(),
            context,
            filter,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        };
        stream::unfold(Some(pager), |pager| async move {
            let mut pager = pager?;
            if pager.buffer.is_empty() && !pager.exhausted {
                if let Err(error) = pager.fill().await {
                    return Some((Err(error), None));
                }
            }
            let next = pager.buffer.pop_front()?;
            Some((Ok(next), Some(pager)))
        })
    }

    pub async fn history(
        &self,
        context: &ContextRef,
        filter: HistoryFilter,
    ) -> Result<Vec<LeaderboardSnapshot>, SnapshotStoreError> {
        self.history_stream(context.clone(), filter)
            .try_collect()
            .await
    }

    pub async fn prune(
        &self,
        series: &SeriesKey,
        keep_latest: usize,
    ) -> Result<u64, SnapshotStoreError> {
        let keep_latest = keep_latest.max(1);
        let removed = self.store.prune_keep_latest(series, keep_latest).await?;
        if removed > 0 {
            tracing::info!(
                context = %series.context,
                period = series.period.as_str(),
                keep_latest,
                removed,
                "leaderboard snapshots pruned"
            );
        }
        Ok(removed)
    }
}

struct HistoryPager {
    store: Arc<dyn SnapshotStore>,
    context: ContextRef,
    filter: HistoryFilter,
    page_size: usize,
    buffer: VecDeque<LeaderboardSnapshot>,
    after: Option<SnapshotCursor>,
    exhausted: bool,
}

impl HistoryPager {
    async fn fill(&mut self) -> Result<(), SnapshotStoreError> {
        let page = self
            .store
            .list(&self.context, &self.filter, self.after.as_ref(), self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(SnapshotCursor::after(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}
