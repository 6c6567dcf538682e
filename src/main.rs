use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keywarden::config::Config;
use keywarden::db::{AppState, create_pool, init_audit_db, init_db, queries};
use keywarden::handlers;
use keywarden::jwt;
use keywarden::models::CreateLicense;
use keywarden::payments::PayPalClient;
use keywarden::privacy::{self, EmailHasher, MachineHasher};
use keywarden::rate_limit;

#[derive(Parser, Debug)]
#[command(name = "keywarden")]
#[command(about = "License issuance and validation backend")]
struct Cli {
    /// Seed the database with dev licenses
    #[arg(long)]
    seed: bool,

    /// Delete databases on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

/// Seeds the database with dev licenses for testing.
/// Only runs in dev mode and when the database is empty.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM licenses", [], |row| row.get(0))
        .expect("Failed to count licenses");
    if count > 0 {
        tracing::info!("Database already has data, skipping seed");
        return;
    }

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let now = Utc::now().timestamp();
    let mut seeded = Vec::new();

    for (product, max_activations, expires_at) in [
        ("pro", 3, Some(now + 365 * 86400)),
        ("team", 10, Some(now + 365 * 86400)),
        ("perpetual", 2, None),
    ] {
        let raw_key = queries::generate_license_key();
        let license = queries::create_license(
            &conn,
            &CreateLicense {
                key_hash: privacy::hash_license_key(&raw_key),
                key_partial: privacy::partial_license_key(&raw_key),
                email_hash: Some(state.email_hasher.hash("dev@keywarden.local")),
                customer_id: Some("dev-customer".to_string()),
                product_id: product.to_string(),
                order_id: None,
                max_activations,
                expires_at,
            },
        )
        .expect("Failed to create dev license");

        tracing::info!("License ({}): {} (id: {})", product, raw_key, license.id);
        seeded.push((product, raw_key));
    }

    tracing::info!("============================================");
    tracing::info!("DEV DATA SEEDED SUCCESSFULLY");
    tracing::info!("============================================");

    // Copy-paste friendly output (no log formatting)
    println!();
    println!("--- COPY FROM HERE ---");
    for (product, key) in &seeded {
        println!("  {}_license_key: {}", product, key);
    }
    println!("--- END COPY ---");
    println!();
}

/// Spawns a background task that periodically purges expired rate-limit
/// windows and stale webhook event markers.
fn spawn_cleanup_task(state: AppState, webhook_event_retention_days: i64, window_seconds: u32) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(5 * 60); // 5 minutes

        loop {
            tokio::time::sleep(interval).await;

            match state.db.get() {
                Ok(conn) => {
                    let now = Utc::now().timestamp();
                    match rate_limit::purge_expired_windows(&conn, now, window_seconds) {
                        Ok(count) if count > 0 => {
                            tracing::debug!("Purged {} expired rate-limit windows", count);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Failed to purge rate-limit windows: {}", e),
                    }

                    if webhook_event_retention_days > 0 {
                        match queries::purge_old_webhook_events(&conn, webhook_event_retention_days)
                        {
                            Ok(count) if count > 0 => {
                                tracing::debug!("Purged {} stale webhook event markers", count);
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!("Failed to purge webhook events: {}", e),
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to get db connection for cleanup: {}", e),
            }
        }
    });

    tracing::info!("Background cleanup task started (runs every 5 minutes)");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keywarden=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    let audit_pool =
        create_pool(&config.audit_database_path).expect("Failed to create audit database pool");

    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }
    {
        let conn = audit_pool.get().expect("Failed to get audit connection");
        init_audit_db(&conn).expect("Failed to initialize audit database");
    }

    // Signing key: configured key survives restarts; a generated one only
    // lives as long as the process (tokens are short-lived anyway)
    let signing_key = config.signing_key.clone().unwrap_or_else(|| {
        tracing::warn!("KEYWARDEN_SIGNING_KEY not set; generating an ephemeral signing key");
        jwt::generate_keypair().0
    });
    let public_key =
        jwt::public_key_from_private(&signing_key).expect("Failed to derive public key");

    let http_client = reqwest::Client::new();

    let state = AppState {
        db: db_pool,
        audit: audit_pool,
        audit_log_enabled: config.audit_log_enabled,
        machine_hasher: MachineHasher::from_master_secret(&config.master_secret),
        email_hasher: EmailHasher::from_master_secret(&config.master_secret),
        rate_limit: config.rate_limit,
        stripe_webhook_secret: config.stripe_webhook_secret.clone(),
        paypal: config
            .paypal
            .clone()
            .map(|cfg| Arc::new(PayPalClient::new(http_client.clone(), cfg))),
        alert_webhook_url: config.alert_webhook_url.clone(),
        http_client,
        webhook_timeout: Duration::from_secs(config.webhook_timeout_secs),
        signing_key: Arc::new(signing_key),
        public_key,
        license_exp_days: config.license_exp_days,
        default_max_activations: config.default_max_activations,
    };

    // Purge old audit logs on startup (0 = never purge)
    if config.audit_log_retention_days > 0 {
        let conn = state.audit.get().expect("Failed to get audit connection for purge");
        match queries::purge_old_audit_logs(&conn, config.audit_log_retention_days) {
            Ok(count) if count > 0 => {
                tracing::info!(
                    "Purged {} audit log entries older than {} days",
                    count,
                    config.audit_log_retention_days
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to purge old audit logs: {}", e),
        }
    }

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set KEYWARDEN_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    spawn_cleanup_task(
        state.clone(),
        config.webhook_event_retention_days,
        config.rate_limit.window_seconds,
    );

    let app = Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();
    let audit_path = config.audit_database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: databases will be deleted on exit");
    }

    tracing::info!("Keywarden server listening on {}", addr);

    // Use into_make_service_with_connect_info so handlers can resolve the
    // client IP for rate limiting
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral databases...");
        for path in [&db_path, &audit_path] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove {}: {}", path, e);
            } else {
                tracing::info!("Removed {}", path);
            }
            let _ = std::fs::remove_file(format!("{}-wal", path));
            let _ = std::fs::remove_file(format!("{}-shm", path));
        }
        tracing::info!("Ephemeral cleanup complete");
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
