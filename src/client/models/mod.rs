//! Collaborator data models

mod audit;
mod auth;

pub use audit::{AuditAction, AuditEvent, AuditLevel};
pub use auth::{Credentials, TokenInfo};
