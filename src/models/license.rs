use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Stored license status. `expired` is not a stored state: it is derived
/// from `expires_at` at read time and blocks validation/activation even
/// while the row still says `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Suspended,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    /// Salted SHA-256 of the license key (raw key never stored)
    pub key_hash: String,
    /// Display-safe fragment for logs and batch result echoes
    pub key_partial: String,
    pub status: LicenseStatus,
    /// HMAC-SHA256 of the purchase email (no PII stored)
    pub email_hash: Option<String>,
    pub customer_id: Option<String>,
    pub product_id: String,
    /// Payment-provider order reference, used to resolve webhook events
    pub order_id: Option<String>,
    pub max_activations: i32,
    pub activation_count: i32,
    /// None = perpetual
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl License {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

#[derive(Debug, Clone)]
pub struct CreateLicense {
    pub key_hash: String,
    pub key_partial: String,
    pub email_hash: Option<String>,
    pub customer_id: Option<String>,
    pub product_id: String,
    pub order_id: Option<String>,
    pub max_activations: i32,
    pub expires_at: Option<i64>,
}

/// Expected (non-exceptional) outcomes of license operations. Variant names
/// are the stable `error` strings exposed in API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum LicenseFailure {
    LicenseNotFound,
    LicenseExpired,
    LicenseSuspended,
    LicenseRevoked,
    LicenseInvalidState,
    ActivationNotFound,
    ActivationLimitExceeded,
}

impl LicenseFailure {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LicenseFailure::LicenseNotFound => StatusCode::NOT_FOUND,
            LicenseFailure::ActivationLimitExceeded => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_is_derived() {
        let license = License {
            id: "kw_lic_x".to_string(),
            key_hash: "h".to_string(),
            key_partial: "KW-A****DDDD".to_string(),
            status: LicenseStatus::Active,
            email_hash: None,
            customer_id: None,
            product_id: "prod".to_string(),
            order_id: None,
            max_activations: 3,
            activation_count: 0,
            expires_at: Some(1000),
            created_at: 0,
            updated_at: 0,
        };
        assert!(license.is_expired(1001));
        assert!(!license.is_expired(999));
        assert!(!license.is_expired(1000));
    }

    #[test]
    fn test_perpetual_never_expires() {
        let license = License {
            id: "kw_lic_x".to_string(),
            key_hash: "h".to_string(),
            key_partial: "****".to_string(),
            status: LicenseStatus::Active,
            email_hash: None,
            customer_id: None,
            product_id: "prod".to_string(),
            order_id: None,
            max_activations: 1,
            activation_count: 0,
            expires_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!license.is_expired(i64::MAX));
    }

    #[test]
    fn test_failure_error_strings_are_stable() {
        assert_eq!(LicenseFailure::LicenseNotFound.as_ref(), "LicenseNotFound");
        assert_eq!(
            LicenseFailure::ActivationLimitExceeded.as_ref(),
            "ActivationLimitExceeded"
        );
        assert_eq!(LicenseFailure::LicenseExpired.as_ref(), "LicenseExpired");
    }

    #[test]
    fn test_failure_status_codes() {
        assert_eq!(
            LicenseFailure::LicenseNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            LicenseFailure::LicenseExpired.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LicenseFailure::ActivationLimitExceeded.status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
