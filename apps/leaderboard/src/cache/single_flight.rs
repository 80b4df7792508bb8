//! Request coalescing for expensive computations.
//!
//! The first caller for a key becomes the leader and runs the work; callers arriving
//! while it runs wait on the same slot and receive a clone of the leader's result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;

type Slot<V> = Arc<Mutex<Option<V>>>;

pub struct SingleFlight<K, V> {
    in_flight: std::sync::Mutex<HashMap<K, Slot<V>>>,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            in_flight: std::sync::Mutex::new(HashMap::new()),
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `work` actually ran.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Number of callers served by another caller's run.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let (slot, mut guard) = loop {
            // The leader holds its slot locked before publishing it, so a follower can
            // never observe an empty slot from a live leader.
            let candidate: Slot<V> = Arc::new(Mutex::new(None));
            let guard = candidate.clone().lock_owned().await;
            let existing = {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match in_flight.get(&key) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        in_flight.insert(key.clone(), candidate.clone());
                        None
                    }
                }
            };

            let Some(existing) = existing else {
                break (candidate, guard);
            };
            drop(guard);

            let result = existing.lock().await;
            if let Some(value) = result.as_ref() {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                return value.clone();
            }
            // Leader was cancelled before finishing. Clear its slot and race again.
            drop(result);
            self.remove_if_current(&key, &existing);
        };

        self.executions.fetch_add(1, Ordering::Relaxed);
        let value = work().await;
        *guard = Some(value.clone());
        self.remove_if_current(&key, &slot);
        drop(guard);
        value
    }

    fn remove_if_current(&self, key: &K, slot: &Slot<V>) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            in_flight.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::SingleFlight;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("board", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(flight.executions(), 1);
        assert_eq!(flight.coalesced(), 7);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let flight: SingleFlight<u8, u8> = SingleFlight::new();
        assert_eq!(flight.run(1, || async { 1 }).await, 1);
        assert_eq!(flight.run(1, || async { 2 }).await, 2);
        assert_eq!(flight.executions(), 2);
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_strand_followers() {
        let flight: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::new());
        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        0
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run(1, || async { 9 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        let value = tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 9);
    }
}
