//! Structured audit/security event logging.
//!
//! Every detail payload is sanitized before persistence: raw license keys,
//! machine identifiers, emails, and payment credential fields never reach a
//! log sink. Security events carry a severity tier; critical/high tiers fire
//! an outbound alert on a detached task that can never block or fail the
//! request that raised them.

use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::db::AppState;
use crate::error::Result;
use crate::models::{AuditLog, EventCategory, SecuritySeverity, severity_for};
use crate::privacy;

/// Detail keys whose values get masked rather than stored verbatim.
const MASK_KEY: &[&str] = &["license_key", "key"];
const MASK_MACHINE: &[&str] = &["machine_fingerprint", "machine_id", "fingerprint", "device_id"];
const MASK_EMAIL: &[&str] = &["email", "customer_email", "payer_email"];
const REDACT: &[&str] = &["card_number", "card_cvc", "payment_token", "account_number"];

/// Recursively sanitize a detail payload for logging.
pub fn sanitize_details(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                let lowered = key.to_ascii_lowercase();
                let sanitized = if REDACT.contains(&lowered.as_str()) {
                    Value::String("[redacted]".to_string())
                } else if MASK_KEY.contains(&lowered.as_str()) {
                    mask_with(val, privacy::partial_license_key)
                } else if MASK_MACHINE.contains(&lowered.as_str()) {
                    mask_with(val, privacy::partial_machine_data)
                } else if MASK_EMAIL.contains(&lowered.as_str()) {
                    mask_with(val, privacy::mask_email)
                } else {
                    sanitize_details(val)
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_details).collect()),
        other => other.clone(),
    }
}

fn mask_with(value: &Value, mask: fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(mask(s)),
        Value::Null => Value::Null,
        other => Value::String(mask(&other.to_string())),
    }
}

/// Builder for audit log entries.
///
/// # Example
/// ```ignore
/// AuditLogBuilder::new(&audit_conn, state.audit_log_enabled)
///     .category(EventCategory::License)
///     .event("activate_license")
///     .license(&license.id)
///     .ip(ip.as_deref())
///     .details(&serde_json::json!({ "license_key": raw_key, "outcome": "ok" }))
///     .save()?;
/// ```
pub struct AuditLogBuilder<'a> {
    conn: &'a Connection,
    enabled: bool,
    category: EventCategory,
    event_type: &'a str,
    severity: Option<SecuritySeverity>,
    details: Option<Value>,
    license_id: Option<&'a str>,
    ip_address: Option<&'a str>,
}

impl<'a> AuditLogBuilder<'a> {
    pub fn new(conn: &'a Connection, enabled: bool) -> Self {
        Self {
            conn,
            enabled,
            category: EventCategory::License,
            event_type: "",
            severity: None,
            details: None,
            license_id: None,
            ip_address: None,
        }
    }

    pub fn category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    pub fn event(mut self, event_type: &'a str) -> Self {
        self.event_type = event_type;
        self
    }

    /// Mark this as a security event; severity comes from the fixed
    /// type-to-severity mapping.
    pub fn security(mut self, event_type: &'a str) -> Self {
        self.category = EventCategory::Security;
        self.event_type = event_type;
        self.severity = Some(severity_for(event_type));
        self
    }

    pub fn details(mut self, details: &Value) -> Self {
        self.details = Some(sanitize_details(details));
        self
    }

    pub fn license(mut self, license_id: &'a str) -> Self {
        self.license_id = Some(license_id);
        self
    }

    pub fn ip(mut self, ip: Option<&'a str>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn save(self) -> Result<AuditLog> {
        crate::db::queries::create_audit_log(
            self.conn,
            self.enabled,
            self.category,
            self.event_type,
            self.severity,
            self.details.as_ref(),
            self.license_id,
            self.ip_address,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub event_type: String,
    pub severity: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Record a security event and, for high/critical tiers, dispatch the
/// outbound alert fire-and-forget. Failures writing the audit row are
/// downgraded to warnings - a broken audit sink must not fail license
/// operations.
pub fn record_security_event(
    state: &AppState,
    event_type: &str,
    details: &Value,
    license_id: Option<&str>,
    ip: Option<&str>,
) {
    let severity = severity_for(event_type);
    let sanitized = sanitize_details(details);

    match state.audit.get() {
        Ok(conn) => {
            let mut builder = AuditLogBuilder::new(&conn, state.audit_log_enabled)
                .security(event_type)
                .details(details)
                .ip(ip);
            if let Some(id) = license_id {
                builder = builder.license(id);
            }
            if let Err(e) = builder.save() {
                tracing::warn!("Failed to write security audit log ({}): {}", event_type, e);
            }
        }
        Err(e) => {
            tracing::warn!("Audit DB unavailable for security event {}: {}", event_type, e);
        }
    }

    if severity.triggers_alert() {
        spawn_security_alert(
            state.http_client.clone(),
            state.alert_webhook_url.clone(),
            SecurityAlert {
                event_type: event_type.to_string(),
                severity: severity.as_ref().to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                license_id: license_id.map(String::from),
                details: Some(sanitized),
            },
        );
    }
}

/// Spawn a fire-and-forget security alert.
///
/// If no alert webhook is configured, this is a no-op. The alert is sent on
/// a background task with a short timeout; failures are swallowed into a
/// local warning and never surface to the request that raised the event.
pub fn spawn_security_alert(
    client: reqwest::Client,
    alert_url: Option<String>,
    alert: SecurityAlert,
) {
    let Some(url) = alert_url else {
        return;
    };
    tokio::spawn(async move {
        match client
            .post(&url)
            .json(&alert)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!(
                    "Security alert webhook returned {} for event '{}'",
                    resp.status(),
                    alert.event_type
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Security alert webhook failed for event '{}': {}",
                    alert.event_type,
                    e
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_masks_license_key() {
        let details = json!({ "license_key": "KW-AAAA-BBBB-CCCC-DDDD", "outcome": "ok" });
        let sanitized = sanitize_details(&details);
        assert_eq!(sanitized["license_key"], "KW-A****DDDD");
        assert_eq!(sanitized["outcome"], "ok");
    }

    #[test]
    fn test_sanitize_masks_machine_data_and_email() {
        let details = json!({
            "machine_fingerprint": "fp-1234567890abcdef",
            "customer_email": "alice@example.com",
        });
        let sanitized = sanitize_details(&details);
        assert_eq!(sanitized["machine_fingerprint"], "fp-1****cdef");
        assert_eq!(sanitized["customer_email"], "a***@example.com");
    }

    #[test]
    fn test_sanitize_redacts_payment_fields() {
        let details = json!({ "card_number": "4242424242424242" });
        let sanitized = sanitize_details(&details);
        assert_eq!(sanitized["card_number"], "[redacted]");
    }

    #[test]
    fn test_sanitize_recurses_into_nested_structures() {
        let details = json!({
            "operations": [
                { "license_key": "KW-AAAA-BBBB-CCCC-DDDD" },
                { "nested": { "machine_id": "mid-1234567890" } },
            ]
        });
        let sanitized = sanitize_details(&details);
        assert_eq!(sanitized["operations"][0]["license_key"], "KW-A****DDDD");
        assert_eq!(sanitized["operations"][1]["nested"]["machine_id"], "mid-****7890");
    }

    #[test]
    fn test_sanitize_leaves_null_alone() {
        let details = json!({ "license_key": null });
        let sanitized = sanitize_details(&details);
        assert_eq!(sanitized["license_key"], Value::Null);
    }
}
