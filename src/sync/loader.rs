//! Per-consumer load state machine
//!
//! `Idle -> Loading -> Success | Failed(retryable) -> Loading(retry) -> ... -> Failed`
//!
//! Every `load` bumps a generation counter. A settlement whose captured
//! generation is no longer current, or that lands after the session scope has
//! closed, is dropped without touching the state.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::TaskGuard;
use super::context::SessionScope;
use super::coordinator::RequestCoordinator;
use crate::error::LoadError;

pub const STAGE_IDLE: &str = "idle";
pub const STAGE_LOADING: &str = "loading";
pub const STAGE_COMPLETE: &str = "complete";
pub const STAGE_FAILED: &str = "failed";
pub const STAGE_CANCELLED: &str = "cancelled";

/// Progress never passes this value before the load settles
const PROGRESS_CAP: u8 = 90;
const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// Boxed producer for a single key
pub type Producer<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, LoadError>> + Send + Sync>;

/// What a loader fetches: the cache key and the producer behind it
pub struct LoadTarget<T> {
    pub key: String,
    pub producer: Producer<T>,
}

impl<T> Clone for LoadTarget<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            producer: Arc::clone(&self.producer),
        }
    }
}

/// Retry bound and backoff.
///
/// Backoff is linear: the retry after failed attempt `n` (zero-based) waits
/// `base_delay * (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total producer invocations allowed per logical load
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// Snapshot read by the presentation layer.
///
/// `progress` is a cosmetic ramp, not a measurement: it rises towards 90
/// while loading and snaps to 100 on settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadState {
    pub is_loading: bool,
    pub error: Option<LoadError>,
    pub progress: u8,
    pub stage: String,
    pub retry_count: u32,
}

impl Default for LoadState {
    fn default() -> Self {
        Self {
            is_loading: false,
            error: None,
            progress: 0,
            stage: STAGE_IDLE.to_string(),
            retry_count: 0,
        }
    }
}

fn retry_stage(failures: u32, max_attempts: u32) -> String {
    format!("retry {}/{}", failures, max_attempts)
}

struct LoaderInner<T> {
    coordinator: Arc<RequestCoordinator<T>>,
    policy: RetryPolicy,
    ttl: Duration,
    scope: SessionScope,
    target: Mutex<Option<LoadTarget<T>>>,
    generation: watch::Sender<u64>,
    state: watch::Sender<LoadState>,
    // Also serializes state transitions against generation bumps
    data: Mutex<Option<T>>,
}

impl<T> LoaderInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lock_data(&self) -> MutexGuard<'_, Option<T>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_target(&self) -> Option<LoadTarget<T>> {
        self.target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation && self.scope.is_active()
    }

    fn begin_load(&self) -> Option<u64> {
        let _data = self.lock_data();
        if !self.scope.is_active() {
            return None;
        }
        self.generation.send_modify(|g| *g += 1);
        let generation = *self.generation.borrow();
        self.state.send_modify(|s| {
            s.is_loading = true;
            s.error = None;
            s.progress = 0;
            s.stage = STAGE_LOADING.to_string();
            s.retry_count = 0;
        });
        Some(generation)
    }

    fn bump_progress(&self, generation: u64) -> bool {
        let _data = self.lock_data();
        if !self.is_current(generation) {
            return false;
        }
        let mut still_loading = true;
        self.state.send_modify(|s| {
            if !s.is_loading {
                still_loading = false;
                return;
            }
            let step = ((PROGRESS_CAP.saturating_sub(s.progress)) / 10).max(1);
            s.progress = s.progress.saturating_add(step).min(PROGRESS_CAP);
        });
        still_loading
    }

    fn mark_retrying(&self, generation: u64, failures: u32) -> bool {
        let _data = self.lock_data();
        if !self.is_current(generation) {
            return false;
        }
        let stage = retry_stage(failures, self.policy.max_attempts);
        self.state.send_modify(|s| {
            s.retry_count = failures;
            s.stage = stage;
        });
        true
    }

    fn finish_success(&self, generation: u64, value: T) {
        let mut data = self.lock_data();
        if !self.is_current(generation) {
            return;
        }
        *data = Some(value);
        self.state.send_modify(|s| {
            s.is_loading = false;
            s.error = None;
            s.progress = 100;
            s.stage = STAGE_COMPLETE.to_string();
            s.retry_count = 0;
        });
    }

    fn finish_failed(&self, generation: u64, failures: u32, err: LoadError) -> bool {
        let _data = self.lock_data();
        if !self.is_current(generation) {
            return false;
        }
        self.state.send_modify(|s| {
            s.is_loading = false;
            s.error = Some(err);
            s.progress = 100;
            s.stage = STAGE_FAILED.to_string();
            s.retry_count = failures;
        });
        true
    }

    fn finish_cancelled(&self, generation: u64) {
        let _data = self.lock_data();
        if !self.is_current(generation) {
            return;
        }
        self.state.send_modify(|s| {
            s.is_loading = false;
            s.stage = STAGE_CANCELLED.to_string();
        });
    }

    fn cancel(&self) {
        let _data = self.lock_data();
        self.generation.send_modify(|g| *g += 1);
        if !self.scope.is_active() {
            return;
        }
        self.state.send_if_modified(|s| {
            if !s.is_loading {
                return false;
            }
            s.is_loading = false;
            s.stage = STAGE_CANCELLED.to_string();
            true
        });
    }
}

/// Resolves once the loader's generation moves past `generation`
async fn superseded(mut generations: watch::Receiver<u64>, generation: u64) {
    loop {
        let current = *generations.borrow_and_update();
        if current != generation {
            return;
        }
        if generations.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_progress_ramp<T>(inner: Arc<LoaderInner<T>>, generation: u64) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !inner.bump_progress(generation) {
                break;
            }
        }
    })
}

/// Drives one logical load at a time for a single consumer.
///
/// Cloning yields another handle to the same loader.
pub struct RetryingLoader<T> {
    inner: Arc<LoaderInner<T>>,
}

impl<T> Clone for RetryingLoader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RetryingLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        coordinator: Arc<RequestCoordinator<T>>,
        policy: RetryPolicy,
        ttl: Duration,
        scope: SessionScope,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        let (state, _) = watch::channel(LoadState::default());
        Self {
            inner: Arc::new(LoaderInner {
                coordinator,
                policy,
                ttl,
                scope,
                target: Mutex::new(None),
                generation,
                state,
                data: Mutex::new(None),
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator<T>> {
        &self.inner.coordinator
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Point the loader at a new key. Cancels the in-flight load and drops
    /// data that belonged to the previous key.
    pub fn retarget(&self, target: LoadTarget<T>) {
        self.inner.cancel();
        *self.inner.lock_data() = None;
        *self
            .inner
            .target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(target);
    }

    pub fn target_key(&self) -> Option<String> {
        self.inner.current_target().map(|t| t.key)
    }

    /// Start a fresh logical load and drive it to settlement.
    ///
    /// Returns early, without writing state, if a later `load`, `retry`,
    /// `refresh` or `cancel` supersedes it.
    pub async fn load(&self) {
        let inner = &self.inner;
        let Some(target) = inner.current_target() else {
            debug!("Load requested with no target");
            return;
        };
        let Some(generation) = inner.begin_load() else {
            debug!("Load of {} refused: session closed", target.key);
            return;
        };
        let _ramp = TaskGuard::new(spawn_progress_ramp(Arc::clone(inner), generation));

        let mut failures: u32 = 0;
        loop {
            // Session may have closed during backoff
            if !inner.is_current(generation) {
                return;
            }
            let producer = Arc::clone(&target.producer);
            let attempt = inner
                .coordinator
                .request(&target.key, inner.ttl, move || (*producer)());

            let outcome = tokio::select! {
                outcome = attempt => outcome,
                _ = superseded(inner.generation.subscribe(), generation) => {
                    debug!("Load of {} superseded", target.key);
                    return;
                }
            };

            match outcome {
                Ok(value) => {
                    inner.finish_success(generation, value);
                    return;
                }
                Err(err) if err.is_cancellation() => {
                    inner.finish_cancelled(generation);
                    return;
                }
                Err(err) => {
                    failures += 1;
                    if err.is_retryable() && failures < inner.policy.max_attempts {
                        let delay = inner.policy.delay_for(failures - 1);
                        warn!(
                            "Load of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            target.key, failures, inner.policy.max_attempts, delay, err
                        );
                        if !inner.mark_retrying(generation, failures) {
                            return;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = superseded(inner.generation.subscribe(), generation) => return,
                        }
                    } else {
                        info!(
                            "Load of {} failed after {} attempt(s): {}",
                            target.key, failures, err
                        );
                        let credential_error = err.is_credential_error();
                        if inner.finish_failed(generation, failures, err) && credential_error {
                            inner.scope.report_credentials_rejected();
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Run `load` on a background task
    pub fn spawn_load(&self) -> JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move { loader.load().await })
    }

    /// Start over from the first attempt, skipping any pending backoff
    pub async fn retry(&self) {
        self.load().await
    }

    /// Drop the cached value for the current key, then load
    pub async fn refresh(&self) {
        if let Some(target) = self.inner.current_target() {
            self.inner.coordinator.invalidate(&target.key);
        }
        self.load().await
    }

    /// Abandon the in-flight load; its settlement will be ignored
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn state(&self) -> LoadState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.inner.state.subscribe()
    }

    /// Last loaded value; hidden once the session scope has closed
    pub fn data(&self) -> Option<T> {
        if !self.inner.scope.is_active() {
            return None;
        }
        self.inner.lock_data().clone()
    }
}
