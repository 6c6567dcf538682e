use serde::{Deserialize, Serialize};

use crate::privacy;

/// One machine binding for a license. Rows are never hard-deleted:
/// deactivation clears `active`, revocation sets `revoked` on top, and the
/// full history stays for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub id: String,
    pub license_id: String,
    pub fingerprint_hash: String,
    pub machine_id_hash: String,
    pub active: bool,
    pub revoked: bool,
    pub revoked_reason: Option<String>,
    pub activated_at: i64,
    pub deactivated_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub ip_address: Option<String>,
}

/// Masked activation row for the status endpoint. Hashes are opaque already,
/// but even those are truncated so the response cannot be replayed as a
/// lookup key.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationSummary {
    pub fingerprint: String,
    pub machine_id: String,
    pub active: bool,
    pub revoked: bool,
    pub activated_at: i64,
}

impl From<&Activation> for ActivationSummary {
    fn from(activation: &Activation) -> Self {
        Self {
            fingerprint: privacy::partial_machine_data(&activation.fingerprint_hash),
            machine_id: privacy::partial_machine_data(&activation.machine_id_hash),
            active: activation.active,
            revoked: activation.revoked,
            activated_at: activation.activated_at,
        }
    }
}
