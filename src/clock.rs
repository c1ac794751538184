//! Time source shared by the cache, loaders and the session lifecycle.
//!
//! Monotonic readings come from `tokio::time::Instant` so that tests can run
//! on a paused runtime and drive time forward with `tokio::time::advance`.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync + Debug {
    /// Monotonic instant used for TTLs, inactivity and backoff
    fn now(&self) -> Instant;

    /// Wall-clock time, used only to compare against remote token expiry
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock implementation
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the tokio timer and the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared system clock
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock whose wall time starts at a fixed point and advances with the
/// tokio timer, so paused-time tests move token expiry and inactivity together
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    started: Instant,
    utc_start: DateTime<Utc>,
}

#[cfg(test)]
impl MockClock {
    pub fn starting_at(utc_start: DateTime<Utc>) -> Self {
        Self {
            started: Instant::now(),
            utc_start,
        }
    }

    pub fn shared_at(utc_start: DateTime<Utc>) -> SharedClock {
        Arc::new(Self::starting_at(utc_start))
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.started);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.utc_start + elapsed
    }
}
