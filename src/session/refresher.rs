//! Remote credential checks and proactive refresh

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use serde_json::json;

use super::audit::AuditTrail;
use crate::client::{AuditAction, AuditLevel, AuthApi};
use crate::clock::SharedClock;

/// Tokens expiring sooner than this are refreshed (5 minutes)
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Result of a credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    /// Session is usable; `refreshed` when a refresh was performed
    Valid { refreshed: bool },
    /// The backend reports no session
    NoSession,
    /// A refresh was needed and did not succeed
    RefreshFailed,
}

impl CredentialCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, CredentialCheck::Valid { .. })
    }
}

type SharedCheck = Shared<BoxFuture<'static, CredentialCheck>>;

/// Checks remote token expiry and refreshes it before it lapses.
///
/// Calls made while a check is running join that check instead of starting
/// another one, so at most one refresh is ever in flight.
pub struct CredentialRefresher {
    auth: Arc<dyn AuthApi>,
    clock: SharedClock,
    threshold: chrono::Duration,
    audit: Option<AuditTrail>,
    in_flight: Mutex<Option<SharedCheck>>,
}

impl CredentialRefresher {
    pub fn new(auth: Arc<dyn AuthApi>, clock: SharedClock, threshold: Duration) -> Self {
        Self {
            auth,
            clock,
            threshold: chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            audit: None,
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<SharedCheck>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refresh only when the token is close to expiry
    pub async fn check_and_refresh(&self) -> CredentialCheck {
        self.run(false).await
    }

    /// Refresh whenever a session exists, regardless of its expiry
    pub async fn force_refresh(&self) -> CredentialCheck {
        self.run(true).await
    }

    pub fn is_checking(&self) -> bool {
        self.lock().is_some()
    }

    async fn run(&self, force: bool) -> CredentialCheck {
        let check = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Credential check already in flight, joining it");
                    existing.clone()
                }
                None => {
                    let check = check_session(
                        Arc::clone(&self.auth),
                        Arc::clone(&self.clock),
                        self.threshold,
                        self.audit.clone(),
                        force,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(check.clone());
                    check
                }
            }
        };

        let result = check.clone().await;

        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&check)) {
            *slot = None;
        }
        result
    }
}

async fn check_session(
    auth: Arc<dyn AuthApi>,
    clock: SharedClock,
    threshold: chrono::Duration,
    audit: Option<AuditTrail>,
    force: bool,
) -> CredentialCheck {
    let session = match auth.get_session().await {
        Ok(session) => session,
        Err(err) => {
            warn!("Failed to read remote session: {}", err);
            None
        }
    };
    let Some(token) = session else {
        debug!("No remote session");
        return CredentialCheck::NoSession;
    };

    let remaining = token.remaining(clock.utc_now());
    if !force && remaining >= threshold {
        return CredentialCheck::Valid { refreshed: false };
    }

    info!(
        "Refreshing session token (expires in {}s)",
        remaining.num_seconds()
    );
    if let Some(audit) = &audit {
        audit.emit(
            AuditAction::SessionRefreshAttempted,
            AuditLevel::Info,
            json!({ "expiresInSeconds": remaining.num_seconds(), "forced": force }),
        );
    }

    match auth.refresh_session().await {
        Ok(true) => {
            if let Some(audit) = &audit {
                audit.emit(
                    AuditAction::SessionRefreshSucceeded,
                    AuditLevel::Info,
                    serde_json::Value::Null,
                );
            }
            CredentialCheck::Valid { refreshed: true }
        }
        Ok(false) => {
            warn!("Backend refused session refresh");
            CredentialCheck::RefreshFailed
        }
        Err(err) => {
            warn!("Session refresh failed: {}", err);
            CredentialCheck::RefreshFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryBackend, TokenInfo};
    use crate::clock::SystemClock;
    use chrono::Utc;

    fn refresher(backend: &Arc<InMemoryBackend>) -> CredentialRefresher {
        CredentialRefresher::new(
            backend.clone(),
            SystemClock::shared(),
            DEFAULT_REFRESH_THRESHOLD,
        )
        .with_audit(AuditTrail::new(backend.clone(), "admin-1"))
    }

    fn session_expiring_in(backend: &InMemoryBackend, secs: i64) {
        backend.set_session(Some(TokenInfo {
            expires_at: Utc::now() + chrono::Duration::seconds(secs),
        }));
    }

    #[tokio::test]
    async fn test_no_session() {
        let backend = Arc::new(InMemoryBackend::new());
        let check = refresher(&backend).check_and_refresh().await;

        assert_eq!(check, CredentialCheck::NoSession);
        assert!(!check.is_valid());
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_distant_expiry_skips_refresh() {
        let backend = Arc::new(InMemoryBackend::new());
        session_expiring_in(&backend, 3600);

        let check = refresher(&backend).check_and_refresh().await;

        assert_eq!(check, CredentialCheck::Valid { refreshed: false });
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_expiry_refreshes() {
        let backend = Arc::new(InMemoryBackend::new());
        session_expiring_in(&backend, 120);

        let check = refresher(&backend).check_and_refresh().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(check, CredentialCheck::Valid { refreshed: true });
        assert_eq!(backend.refresh_calls(), 1);
        let actions: Vec<_> = backend.audit_events().iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::SessionRefreshAttempted));
        assert!(actions.contains(&AuditAction::SessionRefreshSucceeded));
    }

    #[tokio::test]
    async fn test_failed_refresh_near_expiry() {
        let backend = Arc::new(InMemoryBackend::new().with_failing_refresh());
        session_expiring_in(&backend, 200);

        let check = refresher(&backend).check_and_refresh().await;

        assert_eq!(check, CredentialCheck::RefreshFailed);
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_threshold() {
        let backend = Arc::new(InMemoryBackend::new());
        session_expiring_in(&backend, 3600);

        let check = refresher(&backend).force_refresh().await;

        assert_eq!(check, CredentialCheck::Valid { refreshed: true });
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_share_one_refresh() {
        let backend = Arc::new(
            InMemoryBackend::new().with_refresh_latency(Duration::from_secs(2)),
        );
        session_expiring_in(&backend, 60);
        let refresher = refresher(&backend);

        let (a, b, c) = tokio::join!(
            refresher.check_and_refresh(),
            refresher.check_and_refresh(),
            refresher.check_and_refresh(),
        );

        assert_eq!(a, CredentialCheck::Valid { refreshed: true });
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.get_session_calls(), 1);
        assert!(!refresher.is_checking());
    }

    #[tokio::test]
    async fn test_sequential_checks_each_run() {
        let backend = Arc::new(InMemoryBackend::new());
        session_expiring_in(&backend, 3600);
        let refresher = refresher(&backend);

        refresher.check_and_refresh().await;
        refresher.check_and_refresh().await;

        assert_eq!(backend.get_session_calls(), 2);
    }
}
