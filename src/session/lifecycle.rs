//! Session lifecycle state machine
//!
//! `Active -> Warning -> Expired`, driven by user inactivity and by the
//! remote credential check. Expired is terminal: logout runs exactly once and
//! registered expiry hooks run before it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::activity::ActivityMonitor;
use super::audit::AuditTrail;
use super::refresher::{CredentialCheck, CredentialRefresher};
use crate::client::{AuditAction, AuditLevel, AuthApi};
use crate::clock::SharedClock;
use crate::sync::TaskGuard;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Warning,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Warning => write!(f, "warning"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

/// What the presentation layer reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub state: SessionState,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub max_inactivity: Duration,
    pub warn_before: Duration,
    pub poll_interval: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_inactivity: Duration::from_secs(30 * 60),
            warn_before: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Inactivity,
    RefreshFailed,
    RemoteSessionLost,
    CredentialsRejected,
    ManualLogout,
}

impl ExpiryReason {
    fn audit(&self) -> (AuditAction, AuditLevel) {
        match self {
            ExpiryReason::Inactivity => (AuditAction::SessionExpiredInactivity, AuditLevel::Info),
            ExpiryReason::RefreshFailed => (AuditAction::SessionRefreshFailed, AuditLevel::Critical),
            ExpiryReason::RemoteSessionLost | ExpiryReason::CredentialsRejected => {
                (AuditAction::SessionRemoteLost, AuditLevel::Warning)
            }
            ExpiryReason::ManualLogout => (AuditAction::SessionForcedLogout, AuditLevel::Info),
        }
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryReason::Inactivity => write!(f, "expired after inactivity"),
            ExpiryReason::RefreshFailed => write!(f, "credential refresh failed"),
            ExpiryReason::RemoteSessionLost => write!(f, "remote session lost"),
            ExpiryReason::CredentialsRejected => write!(f, "credentials rejected by backend"),
            ExpiryReason::ManualLogout => write!(f, "logged out"),
        }
    }
}

/// Events that cause an evaluation outside the poll schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTrigger {
    VisibilityRegained,
    NetworkReconnected,
    Activity,
    CountdownElapsed,
    /// A load was refused because the backend no longer accepts the session
    CredentialsRejected,
}

type ExpiryHook = Arc<dyn Fn(ExpiryReason) + Send + Sync>;

struct LifecycleInner {
    settings: LifecycleSettings,
    clock: SharedClock,
    monitor: Arc<ActivityMonitor>,
    /// Monitor session this lifecycle owns
    session: u64,
    refresher: Arc<CredentialRefresher>,
    auth: Arc<dyn AuthApi>,
    audit: Option<AuditTrail>,
    snapshot: watch::Sender<LifecycleSnapshot>,
    expired: AtomicBool,
    reason: Mutex<Option<ExpiryReason>>,
    hooks: Mutex<Vec<ExpiryHook>>,
    countdown: Mutex<Option<TaskGuard>>,
    driver: Mutex<Option<TaskGuard>>,
    triggers: mpsc::UnboundedSender<LifecycleTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<LifecycleTrigger>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Seconds left, rounded up so a partial second still shows as one
fn whole_seconds(remaining: Duration) -> u64 {
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

/// Handle to one session's lifecycle. Clones share the same machine.
#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl SessionLifecycle {
    /// Lifecycle for the monitor's current session; start the monitor
    /// session with [`ActivityMonitor::start_session`] first.
    pub fn new(
        settings: LifecycleSettings,
        clock: SharedClock,
        monitor: Arc<ActivityMonitor>,
        refresher: Arc<CredentialRefresher>,
        auth: Arc<dyn AuthApi>,
        audit: Option<AuditTrail>,
    ) -> Self {
        let (snapshot, _) = watch::channel(LifecycleSnapshot {
            state: SessionState::Active,
            remaining_seconds: whole_seconds(settings.max_inactivity),
        });
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let session = monitor.session();

        Self {
            inner: Arc::new(LifecycleInner {
                settings,
                clock,
                monitor,
                session,
                refresher,
                auth,
                audit,
                snapshot,
                expired: AtomicBool::new(false),
                reason: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
                countdown: Mutex::new(None),
                driver: Mutex::new(None),
                triggers,
                trigger_rx: Mutex::new(Some(trigger_rx)),
            }),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        *self.inner.snapshot.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.expired.load(Ordering::SeqCst)
    }

    pub fn expiry_reason(&self) -> Option<ExpiryReason> {
        *lock(&self.inner.reason)
    }

    /// Run `hook` when the session expires, before the remote logout
    pub fn on_expired<F>(&self, hook: F)
    where
        F: Fn(ExpiryReason) + Send + Sync + 'static,
    {
        lock(&self.inner.hooks).push(Arc::new(hook));
    }

    /// Request an evaluation outside the poll schedule
    pub fn notify(&self, trigger: LifecycleTrigger) -> bool {
        debug!("Lifecycle trigger: {:?}", trigger);
        self.inner.triggers.send(trigger).is_ok()
    }

    /// Start polling. Later calls are no-ops.
    pub fn start(&self) {
        let Some(mut triggers) = lock(&self.inner.trigger_rx).take() else {
            return;
        };
        let weak: Weak<LifecycleInner> = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.settings.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let mut rejected = false;
                tokio::select! {
                    _ = ticker.tick() => {}
                    trigger = triggers.recv() => match trigger {
                        Some(LifecycleTrigger::CredentialsRejected) => rejected = true,
                        Some(_) => {}
                        None => break,
                    }
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let lifecycle = SessionLifecycle { inner };
                if rejected {
                    lifecycle.expire(ExpiryReason::CredentialsRejected).await;
                    break;
                }
                if lifecycle.evaluate().await == SessionState::Expired {
                    break;
                }
            }
            debug!("Lifecycle driver stopped");
        });
        *lock(&self.inner.driver) = Some(TaskGuard::new(handle));
        info!(
            "Session lifecycle started (inactivity {}s, warning {}s)",
            self.inner.settings.max_inactivity.as_secs(),
            self.inner.settings.warn_before.as_secs()
        );
    }

    fn remaining(&self) -> Duration {
        match self.inner.monitor.last_activity_at() {
            Some(last) => {
                let idle = self.inner.clock.now().saturating_duration_since(last);
                self.inner.settings.max_inactivity.saturating_sub(idle)
            }
            None => Duration::ZERO,
        }
    }

    /// Recompute the state from inactivity and the remote session
    pub async fn evaluate(&self) -> SessionState {
        if self.is_expired() {
            return SessionState::Expired;
        }

        let remaining = self.remaining();
        if remaining.is_zero() {
            self.expire(ExpiryReason::Inactivity).await;
            return SessionState::Expired;
        }
        if remaining <= self.inner.settings.warn_before {
            self.enter_warning(remaining);
        } else {
            self.enter_active(remaining);
        }

        let check = self.inner.refresher.check_and_refresh().await;
        if self.handle_check(check).await {
            return SessionState::Expired;
        }
        self.state()
    }

    /// User asked to stay signed in
    pub async fn extend_session(&self) -> SessionState {
        if self.is_expired() {
            return SessionState::Expired;
        }
        let monitor = &self.inner.monitor;
        let session = self.inner.session;
        let snapshot = LifecycleSnapshot {
            state: SessionState::Active,
            remaining_seconds: whole_seconds(self.inner.settings.max_inactivity),
        };
        if !self.publish(snapshot, || {
            monitor.reset(session);
        }) {
            return SessionState::Expired;
        }
        self.stop_countdown();
        info!("Session extended");

        let check = self.inner.refresher.force_refresh().await;
        if self.handle_check(check).await {
            return SessionState::Expired;
        }
        self.state()
    }

    /// End the session now, whatever the timers say
    pub async fn force_logout(&self) -> bool {
        self.expire(ExpiryReason::ManualLogout).await
    }

    /// Returns `true` when the check ended the session
    async fn handle_check(&self, check: CredentialCheck) -> bool {
        let reason = match check {
            CredentialCheck::Valid { .. } => return false,
            CredentialCheck::NoSession => ExpiryReason::RemoteSessionLost,
            CredentialCheck::RefreshFailed => ExpiryReason::RefreshFailed,
        };
        self.expire(reason).await;
        true
    }

    /// Publish a non-terminal snapshot.
    ///
    /// `on_publish` runs under the snapshot lock, so it either lands before
    /// Expired is published or not at all.
    fn publish(&self, next: LifecycleSnapshot, on_publish: impl FnOnce()) -> bool {
        self.inner.snapshot.send_if_modified(|current| {
            if current.state == SessionState::Expired {
                return false;
            }
            on_publish();
            *current = next;
            true
        })
    }

    fn enter_active(&self, remaining: Duration) {
        let previous = self.state();
        let snapshot = LifecycleSnapshot {
            state: SessionState::Active,
            remaining_seconds: whole_seconds(remaining),
        };
        if !self.publish(snapshot, || {}) {
            return;
        }
        self.stop_countdown();
        if previous == SessionState::Warning {
            debug!("Warning cleared");
        }
    }

    fn enter_warning(&self, remaining: Duration) {
        let previous = self.state();
        let monitor = &self.inner.monitor;
        let session = self.inner.session;
        let snapshot = LifecycleSnapshot {
            state: SessionState::Warning,
            remaining_seconds: whole_seconds(remaining),
        };
        if !self.publish(snapshot, || {
            monitor.mark_warning(session);
        }) {
            return;
        }
        if previous != SessionState::Warning || lock(&self.inner.countdown).is_none() {
            info!("Session expires in {}s without activity", remaining.as_secs());
            self.start_countdown();
        }
    }

    fn start_countdown(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + COUNTDOWN_TICK, COUNTDOWN_TICK);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.monitor.warning_pending() {
                    let _ = inner.triggers.send(LifecycleTrigger::Activity);
                    break;
                }

                let mut elapsed = false;
                let still_warning = inner.snapshot.send_if_modified(|snapshot| {
                    if snapshot.state != SessionState::Warning {
                        return false;
                    }
                    snapshot.remaining_seconds = snapshot.remaining_seconds.saturating_sub(1);
                    elapsed = snapshot.remaining_seconds == 0;
                    true
                });
                if !still_warning {
                    break;
                }
                if elapsed {
                    let _ = inner.triggers.send(LifecycleTrigger::CountdownElapsed);
                    break;
                }
            }
        });
        *lock(&self.inner.countdown) = Some(TaskGuard::new(handle));
        // Expiry may have stopped the countdown before this one was stored
        if self.is_expired() {
            self.stop_countdown();
        }
    }

    fn stop_countdown(&self) {
        lock(&self.inner.countdown).take();
    }

    /// Move to Expired. Only the first call has any effect.
    async fn expire(&self, reason: ExpiryReason) -> bool {
        if self.inner.expired.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.inner.reason) = Some(reason);
        self.stop_countdown();
        self.inner.snapshot.send_replace(LifecycleSnapshot {
            state: SessionState::Expired,
            remaining_seconds: 0,
        });
        warn!("Session ended: {}", reason);

        let hooks: Vec<ExpiryHook> = lock(&self.inner.hooks).clone();
        for hook in hooks {
            hook(reason);
        }
        self.inner.monitor.clear(self.inner.session);

        if let Some(audit) = &self.inner.audit {
            let (action, level) = reason.audit();
            audit.emit(action, level, json!({ "reason": reason }));
        }

        if let Err(err) = self.inner.auth.logout().await {
            warn!("Remote logout failed: {}", err);
        }
        true
    }
}
