//! Client-side data synchronization
//!
//! - [`RequestCoordinator`] coalesces concurrent requests per key over the cache
//! - [`RetryingLoader`] drives one consumer's load with retries and cancellation
//! - [`DataSource`] re-keys a loader from the identifiers it depends on
//! - [`SyncContext`] owns all of the above for one authenticated session

pub mod context;
pub mod coordinator;
pub mod loader;
pub mod source;

use tokio::task::JoinHandle;

pub use context::{SessionScope, SyncContext, SyncSettings};
pub use coordinator::RequestCoordinator;
pub use loader::{LoadState, LoadTarget, Producer, RetryPolicy, RetryingLoader};
pub use source::DataSource;

/// Aborts the wrapped task when dropped
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
