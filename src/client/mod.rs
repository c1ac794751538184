//! Collaborators consumed by the sync and session core
//!
//! The core talks to the backend only through these traits. Data producers
//! are plain async closures and live with their consumers (see `sync`).

pub mod api;
pub mod memory;
pub mod models;

pub use api::{AuditSink, AuthApi};
pub use memory::InMemoryBackend;
pub use models::{AuditAction, AuditEvent, AuditLevel, Credentials, TokenInfo};
