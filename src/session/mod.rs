//! Authenticated session lifecycle
//!
//! [`ActivityMonitor`] and [`CredentialRefresher`] feed the
//! [`SessionLifecycle`] state machine; [`SessionShell`] ties a lifecycle to
//! the session's sync context.

pub mod activity;
pub mod audit;
pub mod lifecycle;
pub mod refresher;
pub mod shell;

pub use activity::{ActivityKind, ActivityMonitor, ActivitySource, ChannelActivitySource};
pub use audit::AuditTrail;
pub use lifecycle::{
    ExpiryReason, LifecycleSettings, LifecycleSnapshot, LifecycleTrigger, SessionLifecycle,
    SessionState,
};
pub use refresher::{CredentialCheck, CredentialRefresher, DEFAULT_REFRESH_THRESHOLD};
pub use shell::{SessionShell, ShellSettings};
