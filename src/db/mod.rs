mod schema;
pub mod queries;

pub use schema::{init_audit_db, init_db};

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::RateLimitConfig;
use crate::payments::PayPalClient;
use crate::privacy::{EmailHasher, MachineHasher};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding database pools and configuration.
/// Built once at startup; everything here is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Main database pool (licenses, activations, subscriptions, counters)
    pub db: DbPool,
    /// Audit log database pool (separate file to isolate growth)
    pub audit: DbPool,
    pub audit_log_enabled: bool,
    pub machine_hasher: MachineHasher,
    pub email_hasher: EmailHasher,
    pub rate_limit: RateLimitConfig,
    pub stripe_webhook_secret: Option<String>,
    pub paypal: Option<Arc<PayPalClient>>,
    /// Outbound alert sink for critical/high security events
    pub alert_webhook_url: Option<String>,
    pub http_client: reqwest::Client,
    /// Upper bound on webhook processing (providers retry on timeout)
    pub webhook_timeout: Duration,
    /// Ed25519 signing key for validation tokens
    pub signing_key: Arc<Vec<u8>>,
    /// Base64 verification key published to downstream consumers
    pub public_key: String,
    /// Expiry granted to licenses created from payment events
    pub license_exp_days: Option<i64>,
    pub default_max_activations: i32,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    // busy_timeout keeps concurrent IMMEDIATE transactions queueing instead
    // of failing with SQLITE_BUSY
    let manager = SqliteConnectionManager::file(database_path)
        .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
    Pool::builder().max_size(10).build(manager)
}
