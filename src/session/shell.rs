//! Application shell wiring for one signed-in user
//!
//! Login creates a fresh [`SyncContext`] and starts a [`SessionLifecycle`].
//! Whatever ends the session, the context is torn down before the remote
//! logout so no cached data outlives it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};

use super::activity::{ActivityKind, ActivityMonitor, ActivitySource};
use super::audit::AuditTrail;
use super::lifecycle::{
    ExpiryReason, LifecycleSettings, LifecycleSnapshot, LifecycleTrigger, SessionLifecycle,
    SessionState,
};
use super::refresher::{CredentialRefresher, DEFAULT_REFRESH_THRESHOLD};
use crate::client::{AuditSink, AuthApi, Credentials};
use crate::clock::SharedClock;
use crate::error::{AuthError, Result};
use crate::sync::{SyncContext, SyncSettings};

/// Everything the shell needs to start a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSettings {
    pub lifecycle: LifecycleSettings,
    pub sync: SyncSettings,
    pub refresh_threshold: Duration,
    pub actor_id: String,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleSettings::default(),
            sync: SyncSettings::default(),
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            actor_id: "anonymous".to_string(),
        }
    }
}

struct ActiveSession {
    context: Arc<SyncContext>,
    lifecycle: SessionLifecycle,
}

pub struct SessionShell {
    auth: Arc<dyn AuthApi>,
    audit: AuditTrail,
    clock: SharedClock,
    settings: ShellSettings,
    monitor: Arc<ActivityMonitor>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionShell {
    pub fn new(
        auth: Arc<dyn AuthApi>,
        audit_sink: Arc<dyn AuditSink>,
        clock: SharedClock,
        settings: ShellSettings,
    ) -> Self {
        let monitor = Arc::new(ActivityMonitor::with_all_kinds(Arc::clone(&clock)));
        Self {
            auth,
            audit: AuditTrail::new(audit_sink, settings.actor_id.clone()),
            clock,
            settings,
            monitor,
            active: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    /// Sign in and start a new session.
    ///
    /// Any previous session's context is closed first.
    pub async fn login(&self, credentials: &Credentials) -> Result<Arc<SyncContext>> {
        debug!("Logging in as {}", credentials.email);
        if !self.auth.login(credentials).await? {
            return Err(AuthError::Unauthorized.into());
        }

        if let Some(previous) = self.lock().take() {
            previous.context.close();
        }

        let context = Arc::new(SyncContext::new(self.settings.sync, Arc::clone(&self.clock)));
        let session = self.monitor.start_session();

        let refresher = Arc::new(
            CredentialRefresher::new(
                Arc::clone(&self.auth),
                Arc::clone(&self.clock),
                self.settings.refresh_threshold,
            )
            .with_audit(self.audit.clone()),
        );
        let lifecycle = SessionLifecycle::new(
            self.settings.lifecycle,
            Arc::clone(&self.clock),
            Arc::clone(&self.monitor),
            refresher,
            Arc::clone(&self.auth),
            Some(self.audit.clone()),
        );

        let weak_context = Arc::downgrade(&context);
        lifecycle.on_expired(move |reason| {
            debug!("Tearing down sync context ({})", reason);
            if let Some(context) = weak_context.upgrade() {
                context.close();
            }
        });
        {
            let lifecycle = lifecycle.clone();
            context.scope().on_credentials_rejected(move || {
                lifecycle.notify(LifecycleTrigger::CredentialsRejected);
            });
        }
        lifecycle.start();

        *self.lock() = Some(ActiveSession {
            context: Arc::clone(&context),
            lifecycle,
        });
        info!("Signed in as {} (session {})", credentials.email, session);
        Ok(context)
    }

    /// Sync context of the live session, if any
    pub fn context(&self) -> Option<Arc<SyncContext>> {
        self.lock()
            .as_ref()
            .filter(|session| session.context.is_active())
            .map(|session| Arc::clone(&session.context))
    }

    pub fn lifecycle(&self) -> Option<SessionLifecycle> {
        self.lock().as_ref().map(|session| session.lifecycle.clone())
    }

    pub fn snapshot(&self) -> Option<LifecycleSnapshot> {
        self.lifecycle().map(|lifecycle| lifecycle.snapshot())
    }

    pub fn is_authenticated(&self) -> bool {
        self.lifecycle()
            .is_some_and(|lifecycle| !lifecycle.is_expired())
    }

    /// Keep the session alive on explicit user request.
    ///
    /// Fails with [`AuthError::NoSession`] when nothing is signed in, and with
    /// [`AuthError::RefreshFailed`] when the forced refresh ends the session.
    pub async fn extend_session(&self) -> Result<SessionState> {
        let lifecycle = self
            .lifecycle()
            .filter(|lifecycle| !lifecycle.is_expired())
            .ok_or(AuthError::NoSession)?;

        match lifecycle.extend_session().await {
            SessionState::Expired => match lifecycle.expiry_reason() {
                Some(ExpiryReason::RefreshFailed) => Err(AuthError::RefreshFailed(
                    "backend refused to extend the session".to_string(),
                )
                .into()),
                _ => Err(AuthError::NoSession.into()),
            },
            state => Ok(state),
        }
    }

    /// `false` when there was no live session to end
    pub async fn force_logout(&self) -> bool {
        match self.lifecycle() {
            Some(lifecycle) => lifecycle.force_logout().await,
            None => false,
        }
    }

    pub fn record_activity(&self, kind: ActivityKind) -> bool {
        let recorded = self.monitor.record(kind);
        if recorded
            && let Some(lifecycle) = self.lifecycle()
            && lifecycle.state() == SessionState::Warning
        {
            lifecycle.notify(LifecycleTrigger::Activity);
        }
        recorded
    }

    pub fn notify_visibility_regained(&self) -> bool {
        self.notify(LifecycleTrigger::VisibilityRegained)
    }

    pub fn notify_network_reconnected(&self) -> bool {
        self.notify(LifecycleTrigger::NetworkReconnected)
    }

    fn notify(&self, trigger: LifecycleTrigger) -> bool {
        self.lifecycle()
            .is_some_and(|lifecycle| lifecycle.notify(trigger))
    }

    pub fn attach_source(&self, source: Arc<dyn ActivitySource>) {
        self.monitor.attach(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyInputs;
    use crate::client::{AuditAction, InMemoryBackend};
    use crate::clock::SystemClock;
    use crate::error::{Error, LoadError};
    use crate::session::activity::ChannelActivitySource;

    const EMAIL: &str = "admin@school.test";
    const PASSWORD: &str = "secret";

    fn shell(backend: &Arc<InMemoryBackend>) -> SessionShell {
        SessionShell::new(
            backend.clone(),
            backend.clone(),
            SystemClock::shared(),
            ShellSettings {
                actor_id: "admin-1".to_string(),
                ..ShellSettings::default()
            },
        )
    }

    fn credentials() -> Credentials {
        Credentials::new(EMAIL, PASSWORD)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);

        let result = shell.login(&Credentials::new(EMAIL, "wrong")).await;

        assert!(matches!(result, Err(Error::Auth(AuthError::Unauthorized))));
        assert!(shell.context().is_none());
        assert!(!shell.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_starts_session() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);

        let context = shell.login(&credentials()).await.unwrap();

        assert!(context.is_active());
        assert!(shell.is_authenticated());
        assert!(shell.monitor().last_activity_at().is_some());
        assert_eq!(shell.snapshot().unwrap().state, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_logout_clears_session_data() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        let context = shell.login(&credentials()).await.unwrap();

        let students = context.data_source("students", |_inputs: KeyInputs| async move {
            Ok::<_, LoadError>(vec!["Ada".to_string(), "Grace".to_string()])
        });
        students.set_inputs(KeyInputs::scoped("school-1")).await;
        assert!(students.data().is_some());
        let cache = Arc::clone(context.coordinator::<Vec<String>>().cache());
        assert_eq!(cache.len(), 1);

        assert!(shell.force_logout().await);

        assert!(!context.is_active());
        assert!(cache.is_empty());
        assert!(students.data().is_none());
        assert!(shell.context().is_none());
        assert_eq!(backend.logout_calls(), 1);
        assert!(!shell.force_logout().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_in_flight_load() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        let context = shell.login(&credentials()).await.unwrap();

        let slow = Arc::new(context.data_source("report", |_inputs: KeyInputs| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, LoadError>("report".to_string())
        }));
        let loading = {
            let slow = Arc::clone(&slow);
            tokio::spawn(async move { slow.set_inputs(KeyInputs::scoped("school-1")).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(slow.state().is_loading);

        shell.force_logout().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        let _ = loading.await;

        assert!(slow.data().is_none());
        assert!(slow.state().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_ends_session_after_login() {
        let backend = Arc::new(
            InMemoryBackend::new()
                .with_account(EMAIL, PASSWORD)
                .with_token_ttl(chrono::Duration::seconds(200))
                .with_failing_refresh(),
        );
        let shell = shell(&backend);
        let context = shell.login(&credentials()).await.unwrap();

        // First evaluation runs as soon as the lifecycle starts
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lifecycle = shell.lifecycle().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Expired);
        assert_eq!(lifecycle.expiry_reason(), Some(ExpiryReason::RefreshFailed));
        assert_eq!(backend.logout_calls(), 1);
        assert!(!context.is_active());

        let actions: Vec<_> = backend.audit_events().iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::SessionRefreshFailed));
        assert!(backend.audit_events().iter().all(|e| e.actor_id == "admin-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_source_keeps_session_alive() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        let source = Arc::new(ChannelActivitySource::new("window"));
        shell.attach_source(source.clone());
        shell.login(&credentials()).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(20 * 60)).await;
            source.emit(ActivityKind::Pointer);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(shell.is_authenticated());
        assert_eq!(backend.logout_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_activity_during_warning() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        shell.login(&credentials()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(26 * 60)).await;
        assert_eq!(shell.snapshot().unwrap().state, SessionState::Warning);

        assert!(shell.record_activity(ActivityKind::Touch));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(shell.snapshot().unwrap().state, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_without_session() {
        let backend = Arc::new(InMemoryBackend::new());
        let shell = shell(&backend);

        assert!(!shell.notify_visibility_regained());
        assert!(!shell.notify_network_reconnected());
        assert!(matches!(
            shell.extend_session().await,
            Err(Error::Auth(AuthError::NoSession))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_reports_refresh_failure() {
        let backend = Arc::new(
            InMemoryBackend::new()
                .with_account(EMAIL, PASSWORD)
                .with_failing_refresh(),
        );
        let shell = shell(&backend);
        let context = shell.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(shell.is_authenticated());

        let result = shell.extend_session().await;

        assert!(matches!(
            result,
            Err(Error::Auth(AuthError::RefreshFailed(_)))
        ));
        assert!(!context.is_active());
        assert_eq!(backend.logout_calls(), 1);
        assert!(matches!(
            shell.extend_session().await,
            Err(Error::Auth(AuthError::NoSession))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_session_active() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        shell.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(26 * 60)).await;

        assert_eq!(shell.extend_session().await.unwrap(), SessionState::Active);
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_during_load_force_logout() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        let context = shell.login(&credentials()).await.unwrap();

        let students = context.data_source("students", |_inputs: KeyInputs| async move {
            Err::<Vec<String>, _>(LoadError::SessionExpired)
        });
        students.set_inputs(KeyInputs::scoped("school-1")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lifecycle = shell.lifecycle().unwrap();
        assert_eq!(lifecycle.state(), SessionState::Expired);
        assert_eq!(
            lifecycle.expiry_reason(),
            Some(ExpiryReason::CredentialsRejected)
        );
        assert!(!context.is_active());
        assert!(students.data().is_none());
        assert_eq!(backend.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_teardown_spares_new_session() {
        let backend = Arc::new(InMemoryBackend::new().with_account(EMAIL, PASSWORD));
        let shell = shell(&backend);
        let first = shell.login(&credentials()).await.unwrap();
        let stale = shell.lifecycle().unwrap();

        let second = shell.login(&credentials()).await.unwrap();
        assert!(!first.is_active());

        // The replaced lifecycle finishing its teardown late
        assert!(stale.force_logout().await);

        assert!(shell.monitor().last_activity_at().is_some());
        assert!(second.is_active());
        assert_eq!(shell.snapshot().unwrap().state, SessionState::Active);
        assert!(shell.record_activity(ActivityKind::Key));
    }
}
