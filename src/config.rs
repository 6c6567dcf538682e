use std::env;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Per-endpoint rate limit thresholds (requests per window).
///
/// Activation is stricter than validation/status because it mutates
/// activation slots; batch gets the strictest per-IP threshold since a
/// single request can carry up to 10 operations.
///
/// Configure via environment variables:
/// - RATE_LIMIT_VALIDATE_RPM (default: 60)
/// - RATE_LIMIT_ACTIVATE_RPM (default: 20)
/// - RATE_LIMIT_DEACTIVATE_RPM (default: 20)
/// - RATE_LIMIT_STATUS_RPM (default: 60)
/// - RATE_LIMIT_BATCH_RPM (default: 5)
/// - RATE_LIMIT_WINDOW_SECONDS (default: 60)
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub validate_rpm: u32,
    pub activate_rpm: u32,
    pub deactivate_rpm: u32,
    pub status_rpm: u32,
    pub batch_rpm: u32,
    pub window_seconds: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            validate_rpm: 60,
            activate_rpm: 20,
            deactivate_rpm: 20,
            status_rpm: 60,
            batch_rpm: 5,
            window_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            validate_rpm: env_u32("RATE_LIMIT_VALIDATE_RPM", defaults.validate_rpm),
            activate_rpm: env_u32("RATE_LIMIT_ACTIVATE_RPM", defaults.activate_rpm),
            deactivate_rpm: env_u32("RATE_LIMIT_DEACTIVATE_RPM", defaults.deactivate_rpm),
            status_rpm: env_u32("RATE_LIMIT_STATUS_RPM", defaults.status_rpm),
            batch_rpm: env_u32("RATE_LIMIT_BATCH_RPM", defaults.batch_rpm),
            window_seconds: env_u32("RATE_LIMIT_WINDOW_SECONDS", defaults.window_seconds).max(1),
        }
    }
}

/// PayPal webhook verification credentials.
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    /// API base, overridable for sandbox (https://api-m.sandbox.paypal.com)
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub audit_database_path: String,
    /// Master secret used to derive the fingerprint/email HMAC keys
    pub master_secret: Vec<u8>,
    /// Ed25519 signing key for validation tokens (generated when unset)
    pub signing_key: Option<Vec<u8>>,
    pub stripe_webhook_secret: Option<String>,
    pub paypal: Option<PayPalConfig>,
    /// Outbound alert webhook for critical/high security events
    pub alert_webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub webhook_event_retention_days: i64,
    pub audit_log_enabled: bool,
    pub audit_log_retention_days: i64,
    pub rate_limit: RateLimitConfig,
    /// Expiry granted to licenses created from payment events (None = perpetual)
    pub license_exp_days: Option<i64>,
    pub default_max_activations: i32,
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("KEYWARDEN_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let master_secret = env::var("KEYWARDEN_MASTER_SECRET")
            .ok()
            .and_then(|s| BASE64.decode(s.trim()).ok())
            .unwrap_or_else(|| {
                if !dev_mode {
                    tracing::warn!(
                        "KEYWARDEN_MASTER_SECRET not set; fingerprint hashes will not survive restarts"
                    );
                }
                use rand::RngCore;
                let mut secret = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut secret);
                secret
            });

        let signing_key = env::var("KEYWARDEN_SIGNING_KEY")
            .ok()
            .and_then(|s| BASE64.decode(s.trim()).ok())
            .filter(|k| k.len() == 32);

        let paypal = match (
            env::var("PAYPAL_CLIENT_ID").ok(),
            env::var("PAYPAL_CLIENT_SECRET").ok(),
            env::var("PAYPAL_WEBHOOK_ID").ok(),
        ) {
            (Some(client_id), Some(client_secret), Some(webhook_id)) => Some(PayPalConfig {
                client_id,
                client_secret,
                webhook_id,
                api_base: env::var("PAYPAL_API_BASE")
                    .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            }),
            _ => None,
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "keywarden.db".to_string()),
            audit_database_path: env::var("AUDIT_DATABASE_PATH")
                .unwrap_or_else(|_| "keywarden_audit.db".to_string()),
            master_secret,
            signing_key,
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").ok(),
            paypal,
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
            webhook_timeout_secs: env_u64("WEBHOOK_TIMEOUT_SECS", 30),
            webhook_event_retention_days: env_i64("WEBHOOK_EVENT_RETENTION_DAYS", 30),
            audit_log_enabled: env::var("AUDIT_LOG_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            audit_log_retention_days: env_i64("AUDIT_LOG_RETENTION_DAYS", 0),
            rate_limit: RateLimitConfig::from_env(),
            license_exp_days: env::var("LICENSE_EXP_DAYS").ok().and_then(|v| v.parse().ok()),
            default_max_activations: env_i64("DEFAULT_MAX_ACTIVATIONS", 3) as i32,
            dev_mode,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
