//! Session-scoped sync state
//!
//! One `SyncContext` exists per authenticated session. It owns a cache and a
//! request coordinator per value type, plus their sweep tasks. Closing it
//! cancels in-flight producers, clears every cache and closes the session
//! scope so no loader writes state afterwards.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};

use super::coordinator::{RequestCoordinator, Teardown};
use super::loader::{RetryPolicy, RetryingLoader};
use super::source::DataSource;
use crate::cache::storage::SweeperHandle;
use crate::cache::{AsyncCache, CacheLimits, CacheTtl, KeyInputs, spawn_sweeper};
use crate::clock::SharedClock;
use crate::error::LoadError;

type RejectionHook = Arc<dyn Fn() + Send + Sync>;

/// Liveness flag shared by everything tied to one session.
///
/// Also carries the hook that ends the session when a producer reports that
/// the backend no longer accepts its credentials.
#[derive(Clone, Default)]
pub struct SessionScope {
    closed: Arc<AtomicBool>,
    on_rejected: Arc<Mutex<Option<RejectionHook>>>,
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("active", &self.is_active())
            .finish()
    }
}

impl SessionScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_hook(&self) -> MutexGuard<'_, Option<RejectionHook>> {
        self.on_rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Close the scope; returns `false` if it was already closed
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.lock_hook().take();
        }
        first
    }

    /// Run `hook` when a load fails with [`LoadError::SessionExpired`]
    pub fn on_credentials_rejected<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.lock_hook() = Some(Arc::new(hook));
    }

    /// Report rejected credentials; `false` once the scope is closed
    pub fn report_credentials_rejected(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let hook = self.lock_hook().clone();
        match hook {
            Some(hook) => {
                warn!("Backend rejected the session credentials");
                hook();
                true
            }
            None => false,
        }
    }
}

/// Settings applied to every cache and loader in a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub cache: CacheLimits,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache: CacheLimits::default(),
            sweep_interval: CacheTtl::SWEEP_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    coordinators: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    teardowns: Vec<Arc<dyn Teardown>>,
    sweepers: Vec<SweeperHandle>,
}

/// Per-session cache, coordinators and scope
pub struct SyncContext {
    settings: SyncSettings,
    clock: SharedClock,
    scope: SessionScope,
    registry: Mutex<Registry>,
}

impl SyncContext {
    pub fn new(settings: SyncSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            scope: SessionScope::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    pub fn is_active(&self) -> bool {
        self.scope.is_active()
    }

    /// The coordinator for value type `T`, created on first use
    pub fn coordinator<T>(&self) -> Arc<RequestCoordinator<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        if let Some(existing) = registry.coordinators.get(&TypeId::of::<T>())
            && let Ok(coordinator) = Arc::clone(existing).downcast::<RequestCoordinator<T>>()
        {
            return coordinator;
        }

        let cache = Arc::new(AsyncCache::new(self.settings.cache, Arc::clone(&self.clock)));
        let sweeper = spawn_sweeper(&cache, self.settings.sweep_interval);
        let coordinator = Arc::new(RequestCoordinator::new(cache));

        registry
            .coordinators
            .insert(TypeId::of::<T>(), coordinator.clone());
        registry.teardowns.push(coordinator.clone());
        registry.sweepers.push(sweeper);
        debug!(
            "Created coordinator for {}",
            std::any::type_name::<T>()
        );
        coordinator
    }

    /// A data consumer using the context's default TTL
    pub fn data_source<T, F, Fut>(&self, resource: &str, fetch: F) -> DataSource<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(KeyInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        self.data_source_with_ttl(resource, self.settings.cache.default_ttl, fetch)
    }

    /// A data consumer with its own cache duration
    pub fn data_source_with_ttl<T, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        fetch: F,
    ) -> DataSource<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(KeyInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        let loader = RetryingLoader::new(
            self.coordinator::<T>(),
            self.settings.retry,
            ttl,
            self.scope.clone(),
        );
        DataSource::new(resource, fetch, loader)
    }

    /// Tear down everything owned by this session.
    ///
    /// Idempotent; only the first call does any work.
    pub fn close(&self) {
        if !self.scope.close() {
            return;
        }
        let mut registry = self.lock();
        for teardown in &registry.teardowns {
            teardown.teardown();
        }
        registry.teardowns.clear();
        registry.coordinators.clear();
        registry.sweepers.clear();
        info!("Sync context closed");
    }
}
