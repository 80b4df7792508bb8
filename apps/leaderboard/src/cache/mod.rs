use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::types::{BoardKey, BucketKey, ComputedBoard, ContextRef};

pub mod invalidation;
pub mod single_flight;

/// Context epoch and bucket stamp. Any change means cached boards for the bucket are invalid.
pub type Generation = (u64, u64);

#[derive(Debug, Clone)]
pub struct CachedBoard {
    pub board: Arc<ComputedBoard>,
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Shared,
}

#[derive(Debug, thiserror::Error)]
pub enum SharedCacheError {
    #[error("shared cache backend error: {0}")]
    Backend(String),
}

/// Second cache tier. The in-memory implementation ships; a distributed backend plugs in here.
#[async_trait]
pub trait SharedBoardCache: Send + Sync {
    async fn get(&self, key: &BoardKey) -> Result<Option<CachedBoard>, SharedCacheError>;
    async fn put(&self, key: BoardKey, value: CachedBoard) -> Result<(), SharedCacheError>;
    async fn invalidate_buckets(&self, buckets: &[BucketKey]) -> Result<(), SharedCacheError>;
    async fn invalidate_context(&self, context: &ContextRef) -> Result<(), SharedCacheError>;
}

pub struct MemorySharedCache {
    inner: Cache<BoardKey, CachedBoard>,
}

impl MemorySharedCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    async fn invalidate_where(&self, predicate: impl Fn(&BoardKey) -> bool) {
        let doomed: Vec<Arc<BoardKey>> = self
            .inner
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            self.inner.invalidate(key.as_ref()).await;
        }
    }
}

#[async_trait]
impl SharedBoardCache for MemorySharedCache {
    async fn get(&self, key: &BoardKey) -> Result<Option<CachedBoard>, SharedCacheError> {
        Ok(self.inner.get(key).await)
    }

    async fn put(&self, key: BoardKey, value: CachedBoard) -> Result<(), SharedCacheError> {
        self.inner.insert(key, value).await;
        Ok(())
    }

    async fn invalidate_buckets(&self, buckets: &[BucketKey]) -> Result<(), SharedCacheError> {
        self.invalidate_where(|key| buckets.contains(&key.bucket_key()))
            .await;
        Ok(())
    }

    async fn invalidate_context(&self, context: &ContextRef) -> Result<(), SharedCacheError> {
        self.invalidate_where(|key| &key.context == context).await;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub local_ttl: Duration,
    pub shared_ttl: Duration,
    pub local_capacity: u64,
    pub last_good_capacity: u64,
}

impl CacheSettings {
    /// How long an untouched bucket stamp is kept. Outlives any board cached under it.
    fn generation_idle(&self) -> Duration {
        self.local_ttl.max(self.shared_ttl).saturating_mul(2)
    }
}

/// Bucket stamps expire by idle time only. Evicting by capacity could drop the stamp of a
/// bucket whose boards are still cached and make them readable again.
struct Generations {
    contexts: std::sync::Mutex<HashMap<ContextRef, u64>>,
    buckets: moka::sync::Cache<BucketKey, u64>,
    sequence: AtomicU64,
}

impl Generations {
    fn new(idle: Duration) -> Self {
        Self {
            contexts: std::sync::Mutex::new(HashMap::new()),
            buckets: moka::sync::Cache::builder().time_to_idle(idle).build(),
            sequence: AtomicU64::new(0),
        }
    }
}

/// Two cache tiers plus last-known-good boards for stale fallback.
pub struct BoardCache {
    local: Cache<BoardKey, CachedBoard>,
    shared: Arc<dyn SharedBoardCache>,
    last_good: Cache<BoardKey, Arc<ComputedBoard>>,
    generations: Generations,
}

impl BoardCache {
    pub fn new(settings: CacheSettings, shared: Arc<dyn SharedBoardCache>) -> Self {
        Self {
            local: Cache::builder()
                .max_capacity(settings.local_capacity)
                .time_to_live(settings.local_ttl)
                .build(),
            shared,
            last_good: Cache::builder()
                .max_capacity(settings.last_good_capacity)
                .build(),
            generations: Generations::new(settings.generation_idle()),
        }
    }

    pub fn generation(&self, bucket: &BucketKey) -> Generation {
        let context = self
            .generations
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&bucket.context)
            .copied()
            .unwrap_or(0);
        (context, self.generations.buckets.get(bucket).unwrap_or(0))
    }

    /// Marks buckets dirty immediately. Cached boards for them stop being served even
    /// before the coalesced eviction runs. Stamps come from one sequence, so a bucket
    /// whose stamp expired never gets an old value back.
    pub fn bump_buckets<'a>(&self, buckets: impl IntoIterator<Item = &'a BucketKey>) {
        for bucket in buckets {
            let stamp = self.generations.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            self.generations.buckets.insert(bucket.clone(), stamp);
        }
    }

    pub fn bump_context(&self, context: &ContextRef) {
        let mut contexts = self
            .generations
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let counter = contexts.entry(context.clone()).or_insert(0);
        *counter = counter.wrapping_add(1);
    }

    /// Buckets that currently carry a stamp.
    pub fn tracked_buckets(&self) -> u64 {
        self.generations.buckets.run_pending_tasks();
        self.generations.buckets.entry_count()
    }

    /// Tier 1 then tier 2. Tier 2 hits are promoted into tier 1.
    pub async fn lookup(&self, key: &BoardKey) -> Option<(Arc<ComputedBoard>, CacheTier)> {
        let current = self.generation(&key.bucket_key());
        if let Some(cached) = self.local.get(key).await {
            if cached.generation == current {
                return Some((cached.board, CacheTier::Local));
            }
            self.local.invalidate(key).await;
        }
        match self.shared.get(key).await {
            Ok(Some(cached)) if cached.generation == current => {
                self.local.insert(key.clone(), cached.clone()).await;
                Some((cached.board, CacheTier::Shared))
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(reason = %error, "shared leaderboard cache read failed");
                None
            }
        }
    }

    /// Populates both tiers unless the bucket was invalidated since `started_at`.
    /// Last-known-good is refreshed either way.
    pub async fn store(
        &self,
        key: &BoardKey,
        board: Arc<ComputedBoard>,
        started_at: Generation,
    ) -> bool {
        self.last_good.insert(key.clone(), board.clone()).await;
        if self.generation(&key.bucket_key()) != started_at {
            tracing::debug!(
                context = %key.context,
                period = key.period.as_str(),
                "bucket invalidated during computation; not caching result"
            );
            return false;
        }
        let cached = CachedBoard {
            board,
            generation: started_at,
        };
        self.local.insert(key.clone(), cached.clone()).await;
        if let Err(error) = self.shared.put(key.clone(), cached).await {
            tracing::warn!(reason = %error, "shared leaderboard cache write failed");
        }
        true
    }

    pub async fn last_good(&self, key: &BoardKey) -> Option<Arc<ComputedBoard>> {
        self.last_good.get(key).await
    }

    /// Physically evicts boards for the given buckets from both tiers.
    pub async fn evict_buckets(&self, buckets: &[BucketKey]) {
        let doomed: Vec<Arc<BoardKey>> = self
            .local
            .iter()
            .filter(|(key, _)| buckets.contains(&key.bucket_key()))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            self.local.invalidate(key.as_ref()).await;
        }
        if let Err(error) = self.shared.invalidate_buckets(buckets).await {
            tracing::warn!(reason = %error, "shared leaderboard cache invalidation failed");
        }
    }

    /// Drops every cached board of the context, including last-known-good.
    pub async fn invalidate_context(&self, context: &ContextRef) {
        self.bump_context(context);
        for cache_key in self
            .local
            .iter()
            .filter(|(key, _)| &key.context == context)
            .map(|(key, _)| key)
            .collect::<Vec<_>>()
        {
            self.local.invalidate(cache_key.as_ref()).await;
        }
        for cache_key in self
            .last_good
            .iter()
            .filter(|(key, _)| &key.context == context)
            .map(|(key, _)| key)
            .collect::<Vec<_>>()
        {
            self.last_good.invalidate(cache_key.as_ref()).await;
        }
        if let Err(error) = self.shared.invalidate_context(context).await {
            tracing::warn!(reason = %error, "shared leaderboard cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::types::{ContextType, Period, PeriodRange};

    fn cache_with_ttl(ttl: Duration) -> BoardCache {
        BoardCache::new(
            CacheSettings {
                local_ttl: ttl,
                shared_ttl: ttl,
                local_capacity: 100,
                last_good_capacity: 100,
            },
            Arc::new(MemorySharedCache::new(ttl, 100)),
        )
    }

    fn cache() -> BoardCache {
        cache_with_ttl(Duration::from_secs(60))
    }

    fn board(key: &BoardKey) -> Arc<ComputedBoard> {
        Arc::new(ComputedBoard {
            key: key.clone(),
            entries: Vec::new(),
            computed_at: Utc::now(),
            degraded: false,
            previous_snapshot_id: None,
        })
    }

    fn key(period: Period) -> BoardKey {
        BoardKey {
            context: ContextRef::new(ContextType::Class, "class-1"),
            partition_key: None,
            period,
            bucket: PeriodRange::unbounded(),
        }
    }

    #[tokio::test]
    async fn stored_board_is_served_from_local_tier() {
        let cache = cache();
        let key = key(Period::AllTime);
        let started = cache.generation(&key.bucket_key());
        assert!(cache.store(&key, board(&key), started).await);
        let (_, tier) = cache.lookup(&key).await.unwrap();
        assert_eq!(tier, CacheTier::Local);
    }

    #[tokio::test]
    async fn invalidation_during_compute_blocks_population() {
        let cache = cache();
        let key = key(Period::AllTime);
        let started = cache.generation(&key.bucket_key());
        cache.bump_buckets([&key.bucket_key()]);
        assert!(!cache.store(&key, board(&key), started).await);
        assert!(cache.lookup(&key).await.is_none());
        assert!(cache.last_good(&key).await.is_some());
    }

    #[tokio::test]
    async fn bumped_bucket_hides_cached_board() {
        let cache = cache();
        let all_time = key(Period::AllTime);
        let daily = key(Period::Daily);
        for key in [&all_time, &daily] {
            let started = cache.generation(&key.bucket_key());
            cache.store(key, board(key), started).await;
        }
        cache.bump_buckets([&all_time.bucket_key()]);
        assert!(cache.lookup(&all_time).await.is_none());
        assert!(cache.lookup(&daily).await.is_some());

        cache.invalidate_context(&daily.context).await;
        assert!(cache.lookup(&daily).await.is_none());
        assert!(cache.last_good(&daily).await.is_none());
    }

    #[tokio::test]
    async fn idle_bucket_stamps_expire_without_reuse() {
        let cache = cache_with_ttl(Duration::from_millis(20));
        let key = key(Period::Daily);
        let bucket = key.bucket_key();
        cache.bump_buckets([&bucket]);
        cache.bump_buckets([&bucket]);
        let bumped = cache.generation(&bucket);
        assert_eq!(bumped, (0, 2));
        assert_eq!(cache.tracked_buckets(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.tracked_buckets(), 0);
        assert_eq!(cache.generation(&bucket), (0, 0));

        cache.bump_buckets([&bucket]);
        assert_eq!(cache.generation(&bucket), (0, 3));
    }
}
