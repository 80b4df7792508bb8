use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::BoardCache;
use crate::types::BucketKey;

/// Fans `PointAwarded` out to every affected bucket and coalesces cache eviction.
///
/// Publishing bumps bucket generations synchronously so readers never see a board
/// computed before the write. Physical eviction of both cache tiers runs at most
/// once per window on a background task.
pub struct InvalidationBus {
    cache: Arc<BoardCache>,
    pending: std::sync::Mutex<HashSet<BucketKey>>,
    notify: Notify,
    window: Duration,
    published: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationStats {
    pub published: u64,
    pub flushes: u64,
    pub pending: usize,
}

impl InvalidationBus {
    pub fn new(cache: Arc<BoardCache>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache,
            pending: std::sync::Mutex::new(HashSet::new()),
            notify: Notify::new(),
            window,
            published: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// Never blocks on the flush task.
    pub fn publish(&self, buckets: impl IntoIterator<Item = BucketKey>) {
        let buckets: Vec<BucketKey> = buckets.into_iter().collect();
        if buckets.is_empty() {
            return;
        }
        self.cache.bump_buckets(&buckets);
        self.published
            .fetch_add(buckets.len() as u64, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(buckets);
        self.notify.notify_one();
    }

    /// Evicts everything pending. Returns how many buckets were flushed.
    pub async fn flush(&self) -> usize {
        let drained: Vec<BucketKey> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.drain().collect()
        };
        if drained.is_empty() {
            return 0;
        }
        self.cache.evict_buckets(&drained).await;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(buckets = drained.len(), "leaderboard cache invalidations flushed");
        drained.len()
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            published: self.published.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pending: self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Spawns the coalescing loop. Abort the handle on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                bus.notify.notified().await;
                tokio::time::sleep(bus.window).await;
                bus.flush().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::InvalidationBus;
    use crate::cache::{BoardCache, CacheSettings, MemorySharedCache};
    use crate::types::{BoardKey, BucketKey, ComputedBoard, ContextRef, ContextType, Period, PeriodRange};

    fn cache() -> Arc<BoardCache> {
        Arc::new(BoardCache::new(
            CacheSettings {
                local_ttl: Duration::from_secs(60),
                shared_ttl: Duration::from_secs(300),
                local_capacity: 100,
                last_good_capacity: 100,
            },
            Arc::new(MemorySharedCache::new(Duration::from_secs(300), 100)),
        ))
    }

    fn bucket(period: Period) -> BucketKey {
        BucketKey {
            context: ContextRef::new(ContextType::Class, "class-1"),
            period,
            bucket_start: None,
        }
    }

    #[tokio::test]
    async fn repeated_publishes_coalesce_into_one_flush() {
        let bus = InvalidationBus::new(cache(), Duration::from_millis(50));
        let flusher = bus.spawn_flusher();
        for _ in 0..10 {
            bus.publish([bucket(Period::Daily), bucket(Period::AllTime)]);
        }
        assert_eq!(bus.stats().pending, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = bus.stats();
        assert_eq!(stats.published, 20);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.pending, 0);
        flusher.abort();
    }

    #[tokio::test]
    async fn publish_hides_cached_board_before_flush() {
        let cache = cache();
        let bus = InvalidationBus::new(cache.clone(), Duration::from_secs(60));
        let key = BoardKey {
            context: ContextRef::new(ContextType::Class, "class-1"),
            partition_key: None,
            period: Period::AllTime,
            bucket: PeriodRange::unbounded(),
        };
        let started = cache.generation(&key.bucket_key());
        let board = Arc::new(ComputedBoard {
            key: key.clone(),
            entries: Vec::new(),
            computed_at: Utc::now(),
            degraded: false,
            previous_snapshot_id: None,
        });
        cache.store(&key, board, started).await;

        bus.publish([key.bucket_key()]);
        assert!(cache.lookup(&key).await.is_none());
        assert_eq!(bus.flush().await, 1);
        assert_eq!(bus.flush().await, 0);
    }
}
