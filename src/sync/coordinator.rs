//! Request coalescing over the session cache
//!
//! At most one producer call per key is in flight. Callers arriving while it
//! runs share its outcome, and settlement populates the cache (on success)
//! and clears the pending entry (always) before anyone observes the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use tokio::task::AbortHandle;

use crate::cache::AsyncCache;
use crate::error::LoadError;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, LoadError>>>;

struct PendingRequest<T> {
    id: u64,
    load: SharedLoad<T>,
    abort: AbortHandle,
}

type PendingMap<T> = Arc<Mutex<HashMap<String, PendingRequest<T>>>>;

fn lock_pending<T>(pending: &PendingMap<T>) -> MutexGuard<'_, HashMap<String, PendingRequest<T>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Lookup<T> {
    Cached(T),
    InFlight(SharedLoad<T>),
}

/// Coordinates producer calls for one value type within a session.
pub struct RequestCoordinator<T> {
    cache: Arc<AsyncCache<T>>,
    pending: PendingMap<T>,
    next_id: AtomicU64,
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<AsyncCache<T>>) -> Self {
        Self {
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<AsyncCache<T>> {
        &self.cache
    }

    /// Number of producer calls currently in flight
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Resolve `key` from cache, from an in-flight call, or by calling `producer`.
    ///
    /// `producer` is invoked at most once per key until that call settles;
    /// every concurrent caller observes the same value or error.
    pub async fn request<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        match self.lookup_or_start(key, ttl, producer) {
            Lookup::Cached(value) => Ok(value),
            Lookup::InFlight(load) => load.await,
        }
    }

    fn lookup_or_start<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Lookup<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        if let Some(value) = self.cache.get_valid(key) {
            debug!("Cache hit: {}", key);
            return Lookup::Cached(value);
        }

        let mut pending = lock_pending(&self.pending);
        if let Some(existing) = pending.get(key) {
            debug!("Joining in-flight request: {}", key);
            return Lookup::InFlight(existing.load.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fut = producer();
        let cache = Arc::clone(&self.cache);
        let pending_map = Arc::clone(&self.pending);
        let owned_key = key.to_string();

        debug!("Starting producer for {}", key);
        let task = tokio::spawn(async move {
            let result = fut.await;
            if let Ok(value) = &result {
                cache.set_with_ttl(&owned_key, value.clone(), ttl);
            }
            let mut pending = lock_pending(&pending_map);
            if pending.get(&owned_key).is_some_and(|p| p.id == id) {
                pending.remove(&owned_key);
            }
            result
        });
        let abort = task.abort_handle();

        let load = task
            .map(|joined| match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(LoadError::Cancelled),
                Err(err) => Err(LoadError::Transient(format!("producer task failed: {}", err))),
            })
            .boxed()
            .shared();

        pending.insert(
            key.to_string(),
            PendingRequest {
                id,
                load: load.clone(),
                abort,
            },
        );
        Lookup::InFlight(load)
    }

    /// Drop the cached value for `key`
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.delete_by_key(key)
    }

    /// Abort every in-flight producer; waiters observe `LoadError::Cancelled`
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest<T>> = lock_pending(&self.pending)
            .drain()
            .map(|(_, request)| request)
            .collect();
        for request in &drained {
            request.abort.abort();
        }
        drained.len()
    }
}

/// Session tear-down hook for type-erased coordinators
pub trait Teardown: Send + Sync {
    fn teardown(&self);
}

impl<T> Teardown for RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn teardown(&self) {
        let cancelled = self.cancel_all();
        let cleared = self.cache.clear_all();
        debug!(
            "Coordinator torn down: {} requests cancelled, {} entries cleared",
            cancelled, cleared.entries_removed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> Arc<RequestCoordinator<String>> {
        let cache = Arc::new(AsyncCache::new(CacheLimits::default(), SystemClock::shared()));
        Arc::new(RequestCoordinator::new(cache))
    }

    const TTL: Duration = Duration::from_secs(180);

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_producer_call() {
        let coord = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coord = Arc::clone(&coord);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coord
                    .request("students", TTL, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("roster-v1".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("roster-v1".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_error() {
        let coord = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coord = Arc::clone(&coord);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coord
                    .request("students", TTL, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<String, _>(LoadError::Transient("503".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(LoadError::Transient("503".to_string()))
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Failures are not cached and leave nothing pending
        assert!(coord.cache().is_empty());
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_cache_entry_skips_producer() {
        let coord = coordinator();
        coord
            .request("students", TTL, || async { Ok("v1".to_string()) })
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = coord
            .request("students", TTL, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("v2".to_string())
            })
            .await;
        assert_eq!(result, Ok("v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_calls_producer_again() {
        let coord = coordinator();
        coord
            .request("students", TTL, || async { Ok("v1".to_string()) })
            .await
            .unwrap();

        tokio::time::advance(TTL).await;

        let result = coord
            .request("students", TTL, || async { Ok("v2".to_string()) })
            .await;
        assert_eq!(result, Ok("v2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_fresh_call() {
        let coord = coordinator();
        coord
            .request("students", TTL, || async { Ok("v1".to_string()) })
            .await
            .unwrap();

        assert!(coord.invalidate("students"));
        let result = coord
            .request("students", TTL, || async { Ok("v2".to_string()) })
            .await;
        assert_eq!(result, Ok("v2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_waiters_and_clears_cache() {
        let coord = coordinator();
        coord
            .request("teachers", TTL, || async { Ok("cached".to_string()) })
            .await
            .unwrap();

        let waiter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .request("students", TTL, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok("late".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coord.pending_count(), 1);

        coord.teardown();

        assert_eq!(waiter.await.unwrap(), Err(LoadError::Cancelled));
        assert!(coord.cache().is_empty());
        assert_eq!(coord.pending_count(), 0);
    }
}
