//! Audit event models

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity attached to an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

/// Session lifecycle actions recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionRefreshAttempted,
    SessionRefreshSucceeded,
    SessionRefreshFailed,
    SessionExpiredInactivity,
    SessionForcedLogout,
    SessionRemoteLost,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SessionRefreshAttempted => "session_refresh_attempted",
            AuditAction::SessionRefreshSucceeded => "session_refresh_succeeded",
            AuditAction::SessionRefreshFailed => "session_refresh_failed",
            AuditAction::SessionExpiredInactivity => "session_expired_inactivity",
            AuditAction::SessionForcedLogout => "session_forced_logout",
            AuditAction::SessionRemoteLost => "session_remote_lost",
        }
    }
}

/// Audit record sent to the audit collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// User who owned the session
    pub actor_id: String,

    pub action: AuditAction,

    /// Entity the action applies to (always "session" for lifecycle events)
    pub entity_type: String,

    pub level: AuditLevel,

    /// Action-specific details
    #[serde(default)]
    pub details: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_match_serde() {
        for action in [
            AuditAction::SessionRefreshAttempted,
            AuditAction::SessionRefreshSucceeded,
            AuditAction::SessionRefreshFailed,
            AuditAction::SessionExpiredInactivity,
            AuditAction::SessionForcedLogout,
            AuditAction::SessionRemoteLost,
        ] {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json.trim_matches('"'), action.as_str());
        }
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = AuditEvent {
            actor_id: "user-1".to_string(),
            action: AuditAction::SessionForcedLogout,
            entity_type: "session".to_string(),
            level: AuditLevel::Info,
            details: serde_json::json!({ "reason": "manual" }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["actorId"], "user-1");
        assert_eq!(json["entityType"], "session");
        assert_eq!(json["level"], "info");
    }
}
