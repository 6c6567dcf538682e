use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventCategory {
    Payment,
    Webhook,
    License,
    Security,
}

/// Severity tiers for security events. Critical and high trigger an outbound
/// alert; medium is log-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SecuritySeverity {
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    pub fn triggers_alert(&self) -> bool {
        matches!(self, SecuritySeverity::High | SecuritySeverity::Critical)
    }
}

/// Fixed type-to-severity mapping for security events. Unknown types default
/// to medium so a new event name can never silently page nobody while still
/// being recorded.
pub fn severity_for(event_type: &str) -> SecuritySeverity {
    match event_type {
        "revocation_cascade_failed" | "store_unavailable" => SecuritySeverity::Critical,
        "webhook_signature_invalid" | "internal_fault" => SecuritySeverity::High,
        "webhook_replay_detected"
        | "rate_limit_exceeded"
        | "activation_limit_exceeded"
        | "unknown_license_probe" => SecuritySeverity::Medium,
        _ => SecuritySeverity::Medium,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: i64,
    pub category: EventCategory,
    pub event_type: String,
    /// Set for security events only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<SecuritySeverity>,
    /// Sanitized JSON payload - raw keys/fingerprints never appear here
    pub details: Option<serde_json::Value>,
    pub license_id: Option<String>,
    pub ip_address: Option<String>,
}
