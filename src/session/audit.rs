//! Best-effort audit trail for lifecycle events

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use crate::client::{AuditAction, AuditEvent, AuditLevel, AuditSink};

const SESSION_ENTITY: &str = "session";

/// Sends lifecycle events for one actor to the audit sink.
///
/// Each event is written on its own task; failures are logged and dropped so
/// they never hold up or abort a lifecycle transition.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    actor_id: String,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>, actor_id: impl Into<String>) -> Self {
        Self {
            sink,
            actor_id: actor_id.into(),
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn emit(&self, action: AuditAction, level: AuditLevel, details: Value) {
        let event = AuditEvent {
            actor_id: self.actor_id.clone(),
            action,
            entity_type: SESSION_ENTITY.to_string(),
            level,
            details,
        };
        let sink = Arc::clone(&self.sink);
        debug!("Audit: {} ({:?})", action.as_str(), level);
        tokio::spawn(async move {
            if let Err(err) = sink.log_activity(event).await {
                warn!("Failed to record audit event {}: {}", action.as_str(), err);
            }
        });
    }
}
