use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Canceled,
}

/// Recurring-billing record attached to a license (at most one per license).
/// Status changes are driven exclusively by webhook events or the revocation
/// cascade, never by the validation API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub license_id: String,
    /// "stripe" or "paypal"
    pub provider: String,
    /// Provider-assigned subscription id
    pub external_id: String,
    pub status: SubscriptionStatus,
    pub auto_renew: bool,
    pub last_payment_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
