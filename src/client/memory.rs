//! In-memory auth and audit backend
//!
//! Stands in for the remote backend in `campus-sync simulate` and in tests.
//! Behaviour is programmable (token lifetime, refresh outcome, latency) and
//! every call is counted so callers can assert on side effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;

use super::api::{AuditSink, AuthApi};
use super::models::{AuditEvent, Credentials, TokenInfo};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{AuthError, Result};

struct BackendState {
    accounts: HashMap<String, String>,
    session: Option<TokenInfo>,
    token_ttl: chrono::Duration,
    refresh_succeeds: bool,
    refresh_latency: Duration,
    audit_log: Vec<AuditEvent>,
}

/// Programmable auth + audit backend.
///
/// # Example
/// ```ignore
/// let backend = InMemoryBackend::new()
///     .with_account("admin@school.test", "secret")
///     .with_token_ttl(chrono::Duration::minutes(60));
///
/// assert!(backend.login(&Credentials::new("admin@school.test", "secret")).await?);
/// ```
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    clock: SharedClock,
    audit_fails: AtomicBool,
    get_session_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    login_calls: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                accounts: HashMap::new(),
                session: None,
                token_ttl: chrono::Duration::hours(1),
                refresh_succeeds: true,
                refresh_latency: Duration::ZERO,
                audit_log: Vec::new(),
            }),
            clock: SystemClock::shared(),
            audit_fails: AtomicBool::new(false),
            get_session_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an account that `login` accepts
    pub fn with_account(self, email: &str, password: &str) -> Self {
        self.lock()
            .accounts
            .insert(email.to_string(), password.to_string());
        self
    }

    /// Clock used to stamp token expiry
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Lifetime of tokens issued by `login` and `refresh_session`
    pub fn with_token_ttl(self, ttl: chrono::Duration) -> Self {
        self.lock().token_ttl = ttl;
        self
    }

    /// Make every refresh attempt fail
    pub fn with_failing_refresh(self) -> Self {
        self.set_refresh_succeeds(false);
        self
    }

    /// Delay each refresh call
    pub fn with_refresh_latency(self, latency: Duration) -> Self {
        self.lock().refresh_latency = latency;
        self
    }

    /// Make every audit write fail
    pub fn with_failing_audit(self) -> Self {
        self.audit_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_refresh_succeeds(&self, succeeds: bool) {
        self.lock().refresh_succeeds = succeeds;
    }

    /// Install a session directly, bypassing login
    pub fn set_session(&self, session: Option<TokenInfo>) {
        self.lock().session = session;
    }

    /// Drop the session on the backend side, as if revoked elsewhere
    pub fn revoke_session(&self) {
        self.lock().session = None;
    }

    pub fn session(&self) -> Option<TokenInfo> {
        self.lock().session
    }

    pub fn get_session_calls(&self) -> usize {
        self.get_session_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Audit events received so far
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.lock().audit_log.clone()
    }

    fn issue_token(&self, state: &mut BackendState) -> TokenInfo {
        let token = TokenInfo {
            expires_at: self
                .clock
                .utc_now()
                .checked_add_signed(state.token_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        state.session = Some(token);
        token
    }
}

#[async_trait]
impl AuthApi for InMemoryBackend {
    async fn get_session(&self) -> Result<Option<TokenInfo>> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().session)
    }

    async fn refresh_session(&self) -> Result<bool> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.lock().refresh_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if !state.refresh_succeeds || state.session.is_none() {
            debug!("In-memory backend rejected refresh");
            return Ok(false);
        }
        self.issue_token(&mut state);
        Ok(true)
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().session = None;
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> Result<bool> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let accepted = state
            .accounts
            .get(&credentials.email)
            .is_some_and(|password| *password == credentials.password);
        if accepted {
            self.issue_token(&mut state);
        }
        Ok(accepted)
    }
}

#[async_trait]
impl AuditSink for InMemoryBackend {
    async fn log_activity(&self, event: AuditEvent) -> Result<()> {
        if self.audit_fails.load(Ordering::SeqCst) {
            return Err(AuthError::Backend("audit store unavailable".to_string()).into());
        }
        self.lock().audit_log.push(event);
        Ok(())
    }
}
