//! Data consumer bound to a resource and its inputs
//!
//! A `DataSource` is told which identifiers it depends on. It derives its
//! cache key from them and starts a new load only when that key changes.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::debug;
use tokio::sync::watch;

use super::loader::{LoadState, LoadTarget, Producer, RetryingLoader};
use crate::cache::{KeyInputs, resource_prefix};
use crate::error::LoadError;

type Fetch<T> = Arc<dyn Fn(KeyInputs) -> BoxFuture<'static, Result<T, LoadError>> + Send + Sync>;

/// Loader for one resource, re-keyed from its inputs
pub struct DataSource<T> {
    resource: String,
    fetch: Fetch<T>,
    loader: RetryingLoader<T>,
    inputs: Mutex<Option<KeyInputs>>,
}

impl<T> DataSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<F, Fut>(resource: &str, fetch: F, loader: RetryingLoader<T>) -> Self
    where
        F: Fn(KeyInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        Self {
            resource: resource.to_string(),
            fetch: Arc::new(move |inputs: KeyInputs| fetch(inputs).boxed()),
            loader,
            inputs: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Key this source uses for the given inputs
    pub fn key_for(&self, inputs: &KeyInputs) -> String {
        inputs.cache_key(&self.resource)
    }

    pub fn current_key(&self) -> Option<String> {
        self.loader.target_key()
    }

    /// Record changed inputs and reload if they map to a different key.
    ///
    /// Returns `false` (and does nothing) when the key is unchanged.
    pub async fn set_inputs(&self, inputs: KeyInputs) -> bool {
        let key = self.key_for(&inputs);
        {
            let mut current = self
                .inputs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_ref().map(|c| self.key_for(c)).as_deref() == Some(key.as_str()) {
                return false;
            }
            *current = Some(inputs.clone());
        }

        debug!("Inputs for {} changed, reloading {}", self.resource, key);
        let fetch = Arc::clone(&self.fetch);
        let producer: Producer<T> = Arc::new(move || (*fetch)(inputs.clone()));
        self.loader.retarget(LoadTarget { key, producer });
        self.loader.load().await;
        true
    }

    pub async fn load(&self) {
        self.loader.load().await
    }

    pub async fn retry(&self) {
        self.loader.retry().await
    }

    pub async fn refresh(&self) {
        self.loader.refresh().await
    }

    pub fn cancel(&self) {
        self.loader.cancel()
    }

    /// Drop every cached entry of this resource, e.g. after a mutation
    pub fn invalidate_resource(&self) -> usize {
        let prefix = resource_prefix(&self.resource);
        self.loader
            .coordinator()
            .cache()
            .delete_matching(|key| key.starts_with(&prefix))
    }

    pub fn state(&self) -> LoadState {
        self.loader.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.loader.subscribe()
    }

    pub fn data(&self) -> Option<T> {
        self.loader.data()
    }

    pub fn loader(&self) -> &RetryingLoader<T> {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::sync::{SyncContext, SyncSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_source(
        ctx: &SyncContext,
        calls: Arc<AtomicUsize>,
        ttl: Duration,
    ) -> DataSource<String> {
        ctx.data_source_with_ttl("students", ttl, move |inputs: KeyInputs| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok::<_, LoadError>(format!(
                    "{} v{}",
                    inputs.scope().unwrap_or("all"),
                    n
                ))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_inputs_do_not_reload() {
        let ctx = SyncContext::new(SyncSettings::default(), SystemClock::shared());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source(&ctx, Arc::clone(&calls), Duration::from_secs(180));

        assert!(source.set_inputs(KeyInputs::scoped("school-1")).await);
        assert!(!source.set_inputs(KeyInputs::scoped("school-1")).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.data(), Some("school-1 v1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_inputs_rekey_and_reload() {
        let ctx = SyncContext::new(SyncSettings::default(), SystemClock::shared());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source(&ctx, Arc::clone(&calls), Duration::from_secs(180));

        source.set_inputs(KeyInputs::scoped("school-1")).await;
        let first_key = source.current_key().unwrap();
        source.set_inputs(KeyInputs::scoped("school-2")).await;

        assert_ne!(source.current_key().unwrap(), first_key);
        assert_eq!(source.data(), Some("school-2 v2".to_string()));
        assert_eq!(
            source.current_key(),
            Some(KeyInputs::scoped("school-2").cache_key("students"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_within_ttl_calls_producer() {
        let ctx = SyncContext::new(SyncSettings::default(), SystemClock::shared());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source(&ctx, Arc::clone(&calls), Duration::from_secs(3 * 60));

        source.set_inputs(KeyInputs::scoped("school-1")).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        source.refresh().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.data(), Some("school-1 v2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_resource_after_mutation() {
        let ctx = SyncContext::new(SyncSettings::default(), SystemClock::shared());
        let calls = Arc::new(AtomicUsize::new(0));
        let source = counting_source(&ctx, Arc::clone(&calls), Duration::from_secs(180));

        source.set_inputs(KeyInputs::scoped("school-1")).await;
        assert_eq!(source.invalidate_resource(), 1);

        source.load().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
