//! Audit trail trait

use async_trait::async_trait;

use crate::client::models::AuditEvent;
use crate::error::Result;

/// Destination for audit events.
///
/// Callers never wait on or propagate failures from this sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_activity(&self, event: AuditEvent) -> Result<()>;
}
