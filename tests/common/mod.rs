//! Test utilities and fixtures for Keywarden integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tempfile::TempDir;

pub use keywarden::config::RateLimitConfig;
pub use keywarden::db::{AppState, DbPool, init_audit_db, init_db, queries};
pub use keywarden::models::*;
pub use keywarden::privacy::{self, EmailHasher, MachineHasher};

pub const TEST_STRIPE_SECRET: &str = "whsec_test_secret";

/// Generous limits so functional tests never trip the limiter.
pub fn relaxed_rate_limits() -> RateLimitConfig {
    RateLimitConfig {
        validate_rpm: 10_000,
        activate_rpm: 10_000,
        deactivate_rpm: 10_000,
        status_rpm: 10_000,
        batch_rpm: 10_000,
        window_seconds: 60,
    }
}

fn file_pool(dir: &TempDir, name: &str) -> DbPool {
    let path = dir.path().join(name);
    let manager = SqliteConnectionManager::file(path)
        .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
    Pool::builder().max_size(8).build(manager).unwrap()
}

/// Create an AppState over file-backed databases. The TempDir must outlive
/// the state; tests hold on to it.
pub fn test_state() -> (AppState, TempDir) {
    test_state_with_rate_limits(relaxed_rate_limits())
}

pub fn test_state_with_rate_limits(rate_limit: RateLimitConfig) -> (AppState, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let db = file_pool(&dir, "keywarden.db");
    {
        let conn = db.get().unwrap();
        init_db(&conn).unwrap();
    }

    let audit = file_pool(&dir, "keywarden_audit.db");
    {
        let conn = audit.get().unwrap();
        init_audit_db(&conn).unwrap();
    }

    let (signing_key, public_key) = keywarden::jwt::generate_keypair();

    let state = AppState {
        db,
        audit,
        audit_log_enabled: true,
        machine_hasher: MachineHasher::from_bytes([0xAA; 32]),
        email_hasher: EmailHasher::from_bytes([0xBB; 32]),
        rate_limit,
        stripe_webhook_secret: Some(TEST_STRIPE_SECRET.to_string()),
        paypal: None,
        alert_webhook_url: None,
        http_client: reqwest::Client::new(),
        webhook_timeout: Duration::from_secs(30),
        signing_key: Arc::new(signing_key),
        public_key,
        license_exp_days: Some(365),
        default_max_activations: 3,
    };

    (state, dir)
}

/// Router with all public and webhook endpoints, with a fixed peer address
/// injected for IP-based rate limiting.
pub fn app(state: AppState) -> Router {
    app_with_ip(state, "127.0.0.1:12345".parse().unwrap())
}

pub fn app_with_ip(state: AppState, addr: SocketAddr) -> Router {
    Router::new()
        .merge(keywarden::handlers::public::router())
        .merge(keywarden::handlers::webhooks::router())
        .layer(axum::Extension(ConnectInfo(addr)))
        .with_state(state)
}

/// Create a test license from a raw key. Returns the stored row.
pub fn create_test_license(
    conn: &Connection,
    raw_key: &str,
    max_activations: i32,
    expires_at: Option<i64>,
) -> License {
    queries::create_license(
        conn,
        &CreateLicense {
            key_hash: privacy::hash_license_key(raw_key),
            key_partial: privacy::partial_license_key(raw_key),
            email_hash: None,
            customer_id: Some("test-customer".to_string()),
            product_id: "test-product".to_string(),
            order_id: None,
            max_activations,
            expires_at,
        },
    )
    .expect("Failed to create test license")
}

/// Create a test license linked to a provider order (for webhook tests).
pub fn create_test_license_with_order(
    conn: &Connection,
    raw_key: &str,
    max_activations: i32,
    order_id: &str,
) -> License {
    queries::create_license(
        conn,
        &CreateLicense {
            key_hash: privacy::hash_license_key(raw_key),
            key_partial: privacy::partial_license_key(raw_key),
            email_hash: None,
            customer_id: None,
            product_id: "test-product".to_string(),
            order_id: Some(order_id.to_string()),
            max_activations,
            expires_at: Some(future_timestamp(30)),
        },
    )
    .expect("Failed to create test license with order")
}

/// Activate a machine binding directly at the storage layer.
pub fn activate_test_machine(
    state: &AppState,
    license_id: &str,
    fingerprint: &str,
    machine_id: &str,
) -> Activation {
    let mut conn = state.db.get().unwrap();
    let fp_hash = state.machine_hasher.hash(fingerprint);
    let mid_hash = state.machine_hasher.hash(machine_id);
    let license = queries::get_license_by_id(&conn, license_id).unwrap().unwrap();
    match queries::activate_machine_atomic(
        &mut conn,
        license_id,
        &fp_hash,
        &mid_hash,
        Some("198.51.100.1"),
        license.max_activations,
    )
    .expect("activation failed")
    {
        queries::ActivationAcquisition::Created(activation) => activation,
        queries::ActivationAcquisition::Existing(activation) => activation,
        queries::ActivationAcquisition::LimitReached { .. } => {
            panic!("test activation hit the limit")
        }
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn future_timestamp(days: i64) -> i64 {
    now() + (days * 86400)
}

pub fn past_timestamp(days: i64) -> i64 {
    now() - (days * 86400)
}

/// Build a signed Stripe webhook delivery: (header value, body bytes).
pub fn stripe_signed(payload: &serde_json::Value) -> (String, Vec<u8>) {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let body = serde_json::to_vec(payload).unwrap();
    let timestamp = now();
    let mut mac: Hmac<Sha256> = Mac::new_from_slice(TEST_STRIPE_SECRET.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, String::from_utf8_lossy(&body)).as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    (format!("t={},v1={}", timestamp, signature), body)
}
