//! Collaborator trait definitions split by responsibility
//!
//! - [`AuthApi`] - session, refresh, login and logout against the auth backend
//! - [`AuditSink`] - fire-and-forget audit trail
//!
//! Transport is the implementor's concern; the core only awaits these calls.

mod audit;
mod auth;

pub use audit::AuditSink;
pub use auth::AuthApi;
