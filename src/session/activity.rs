//! User activity tracking
//!
//! Interaction sources push events into the monitor, which keeps the
//! last-activity instant for the authenticated session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::SharedClock;

/// Kinds of user interaction that count as activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Pointer,
    Key,
    Scroll,
    Touch,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 4] = [
        ActivityKind::Pointer,
        ActivityKind::Key,
        ActivityKind::Scroll,
        ActivityKind::Touch,
    ];
}

/// Channel an activity source reports into
pub type ActivitySender = mpsc::UnboundedSender<ActivityKind>;

/// Something that produces interaction events (an input device, a window, a test)
pub trait ActivitySource: Send + Sync {
    fn name(&self) -> &str;

    /// Start reporting events into `sender`
    fn register(&self, sender: ActivitySender);

    /// Stop reporting events
    fn unregister(&self);
}

/// Source driven programmatically through [`ChannelActivitySource::emit`]
#[derive(Default)]
pub struct ChannelActivitySource {
    name: String,
    sender: Mutex<Option<ActivitySender>>,
}

impl ChannelActivitySource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sender: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActivitySender>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_registered(&self) -> bool {
        self.lock().is_some()
    }

    /// Report an event; `false` when not registered
    pub fn emit(&self, kind: ActivityKind) -> bool {
        match self.lock().as_ref() {
            Some(sender) => sender.send(kind).is_ok(),
            None => false,
        }
    }
}

impl ActivitySource for ChannelActivitySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, sender: ActivitySender) {
        *self.lock() = Some(sender);
    }

    fn unregister(&self) {
        *self.lock() = None;
    }
}

/// Activity record of the current session
#[derive(Debug, Default)]
struct Tracking {
    /// Bumped by every `start_session`
    session: u64,
    last_activity_at: Option<Instant>,
}

struct MonitorInner {
    clock: SharedClock,
    kinds: HashSet<ActivityKind>,
    tracking: Mutex<Tracking>,
    warning_pending: AtomicBool,
}

impl MonitorInner {
    fn lock_tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, kind: ActivityKind) -> bool {
        if !self.kinds.contains(&kind) {
            trace!("Ignoring {:?} activity", kind);
            return false;
        }
        let mut tracking = self.lock_tracking();
        // No session to keep alive
        if tracking.last_activity_at.is_none() {
            return false;
        }
        tracking.last_activity_at = Some(self.clock.now());
        self.warning_pending.store(false, Ordering::SeqCst);
        true
    }
}

/// Process-wide record of the last user interaction.
///
/// The record is empty outside an authenticated session.
pub struct ActivityMonitor {
    inner: Arc<MonitorInner>,
    sender: ActivitySender,
    sources: Mutex<Vec<Arc<dyn ActivitySource>>>,
    pump: JoinHandle<()>,
}

impl ActivityMonitor {
    /// Monitor counting only the given kinds of interaction
    pub fn new(clock: SharedClock, kinds: impl IntoIterator<Item = ActivityKind>) -> Self {
        let inner = Arc::new(MonitorInner {
            clock,
            kinds: kinds.into_iter().collect(),
            tracking: Mutex::new(Tracking::default()),
            warning_pending: AtomicBool::new(false),
        });

        let (sender, mut receiver) = mpsc::unbounded_channel::<ActivityKind>();
        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            while let Some(kind) = receiver.recv().await {
                pump_inner.record(kind);
            }
        });

        Self {
            inner,
            sender,
            sources: Mutex::new(Vec::new()),
            pump,
        }
    }

    /// Monitor counting every kind of interaction
    pub fn with_all_kinds(clock: SharedClock) -> Self {
        Self::new(clock, ActivityKind::ALL)
    }

    /// Register a source; its events flow into this monitor
    pub fn attach(&self, source: Arc<dyn ActivitySource>) {
        debug!("Attaching activity source {}", source.name());
        source.register(self.sender.clone());
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(source);
    }

    /// Unregister every attached source
    pub fn detach_all(&self) {
        let sources: Vec<_> = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for source in sources {
            debug!("Detaching activity source {}", source.name());
            source.unregister();
        }
    }

    /// Record an interaction directly
    pub fn record(&self, kind: ActivityKind) -> bool {
        self.inner.record(kind)
    }

    /// Start tracking a new session with activity "now".
    ///
    /// Returns the session id the other session-scoped calls expect.
    pub fn start_session(&self) -> u64 {
        let mut tracking = self.inner.lock_tracking();
        tracking.session += 1;
        tracking.last_activity_at = Some(self.inner.clock.now());
        self.inner.warning_pending.store(false, Ordering::SeqCst);
        debug!("Tracking activity for session {}", tracking.session);
        tracking.session
    }

    /// Id of the most recently started session
    pub fn session(&self) -> u64 {
        self.inner.lock_tracking().session
    }

    /// Treat `session` as active right now; `false` if it is not current
    pub fn reset(&self, session: u64) -> bool {
        let mut tracking = self.inner.lock_tracking();
        if tracking.session != session || tracking.last_activity_at.is_none() {
            return false;
        }
        tracking.last_activity_at = Some(self.inner.clock.now());
        self.inner.warning_pending.store(false, Ordering::SeqCst);
        true
    }

    /// Forget the activity of `session`; a newer session is left alone
    pub fn clear(&self, session: u64) -> bool {
        let mut tracking = self.inner.lock_tracking();
        if tracking.session != session {
            debug!("Session {} already superseded, keeping activity", session);
            return false;
        }
        tracking.last_activity_at = None;
        self.inner.warning_pending.store(false, Ordering::SeqCst);
        true
    }

    pub fn last_activity_at(&self) -> Option<Instant> {
        self.inner.lock_tracking().last_activity_at
    }

    /// Flag set while a Warning is shown; cleared by any activity
    pub fn mark_warning(&self, session: u64) -> bool {
        let tracking = self.inner.lock_tracking();
        if tracking.session != session || tracking.last_activity_at.is_none() {
            return false;
        }
        self.inner.warning_pending.store(true, Ordering::SeqCst);
        true
    }

    pub fn warning_pending(&self) -> bool {
        self.inner.warning_pending.load(Ordering::SeqCst)
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.detach_all();
        self.pump.abort();
    }
}
