use rusqlite::Connection;

/// Initialize the main database schema.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA journal_size_limit = 67108864;

        -- Licenses. Raw keys are never stored: key_hash is the lookup
        -- identity, key_partial the only displayable fragment.
        -- 'expired' is not a stored status - it is derived from expires_at.
        CREATE TABLE IF NOT EXISTS licenses (
            id TEXT PRIMARY KEY,
            key_hash TEXT NOT NULL UNIQUE,
            key_partial TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('active', 'suspended', 'revoked')),
            email_hash TEXT,
            customer_id TEXT,
            product_id TEXT NOT NULL,
            order_id TEXT,
            max_activations INTEGER NOT NULL,
            activation_count INTEGER NOT NULL DEFAULT 0
                CHECK (activation_count >= 0 AND activation_count <= max_activations),
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_licenses_email ON licenses(email_hash);
        CREATE INDEX IF NOT EXISTS idx_licenses_order ON licenses(order_id);

        -- Machine activations. Retained forever for audit history;
        -- deactivation clears active, revocation sets revoked on top.
        CREATE TABLE IF NOT EXISTS activations (
            id TEXT PRIMARY KEY,
            license_id TEXT NOT NULL REFERENCES licenses(id),
            fingerprint_hash TEXT NOT NULL,
            machine_id_hash TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            revoked INTEGER NOT NULL DEFAULT 0,
            revoked_reason TEXT,
            activated_at INTEGER NOT NULL,
            deactivated_at INTEGER,
            revoked_at INTEGER,
            ip_address TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_activations_license ON activations(license_id);
        -- At most one live binding per (license, fingerprint, machine id)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_activations_live
            ON activations(license_id, fingerprint_hash, machine_id_hash)
            WHERE active = 1 AND revoked = 0;

        -- Subscriptions (at most one per license). Driven by webhook events
        -- and the revocation cascade only.
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            license_id TEXT NOT NULL UNIQUE REFERENCES licenses(id),
            provider TEXT NOT NULL CHECK (provider IN ('stripe', 'paypal')),
            external_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('active', 'suspended', 'canceled')),
            auto_renew INTEGER NOT NULL DEFAULT 1,
            last_payment_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(provider, external_id)
        );

        -- Fixed-window rate limit counters. Incremented with an atomic
        -- upsert; stale windows are purged by the cleanup task.
        CREATE TABLE IF NOT EXISTS rate_limit_windows (
            subject_type TEXT NOT NULL,
            subject_value TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (subject_type, subject_value, endpoint, window_start)
        );

        -- Processed webhook events (replay attack prevention)
        CREATE TABLE IF NOT EXISTS webhook_events (
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (provider, event_id)
        );
        "#,
    )?;
    Ok(())
}

/// Initialize the audit log database schema (separate DB file)
/// Optimized for append-only workload with WAL mode
pub fn init_audit_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        PRAGMA journal_size_limit = 67108864;

        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            category TEXT NOT NULL CHECK (category IN ('payment', 'webhook', 'license', 'security')),
            event_type TEXT NOT NULL,
            severity TEXT CHECK (severity IS NULL OR severity IN ('critical', 'high', 'medium')),
            details TEXT,
            license_id TEXT,
            ip_address TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_logs_category ON audit_logs(category, timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_logs_license ON audit_logs(license_id);
        "#,
    )?;
    Ok(())
}
