use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::Result;
use crate::id::EntityType;
use crate::models::{
    Activation, AuditLog, CreateLicense, EventCategory, License, LicenseStatus, SecuritySeverity,
    Subscription, SubscriptionStatus,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

// ============ License keys ============

/// Characters used in generated license keys. Ambiguous glyphs (0/O, 1/I/L)
/// are excluded so keys survive being read over the phone.
const KEY_CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generate a new license key: `KW-XXXX-XXXX-XXXX-XXXX`.
/// ~80 bits of entropy; brute force against the API is additionally
/// covered by rate limiting.
pub fn generate_license_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let group = |rng: &mut rand::rngs::ThreadRng| -> String {
        (0..4)
            .map(|_| KEY_CHARSET[rng.gen_range(0..KEY_CHARSET.len())] as char)
            .collect()
    };
    format!(
        "KW-{}-{}-{}-{}",
        group(&mut rng),
        group(&mut rng),
        group(&mut rng),
        group(&mut rng)
    )
}

// ============ Licenses ============

const LICENSE_COLS: &str = "id, key_hash, key_partial, status, email_hash, customer_id, \
     product_id, order_id, max_activations, activation_count, expires_at, created_at, updated_at";

fn license_from_row(row: &Row) -> rusqlite::Result<License> {
    let status: String = row.get(3)?;
    Ok(License {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        key_partial: row.get(2)?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown license status: {}", status).into(),
            )
        })?,
        email_hash: row.get(4)?,
        customer_id: row.get(5)?,
        product_id: row.get(6)?,
        order_id: row.get(7)?,
        max_activations: row.get(8)?,
        activation_count: row.get(9)?,
        expires_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub fn create_license(conn: &Connection, input: &CreateLicense) -> Result<License> {
    let id = EntityType::License.gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO licenses (id, key_hash, key_partial, status, email_hash, customer_id, \
         product_id, order_id, max_activations, activation_count, expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10)",
        params![
            &id,
            &input.key_hash,
            &input.key_partial,
            &input.email_hash,
            &input.customer_id,
            &input.product_id,
            &input.order_id,
            input.max_activations,
            input.expires_at,
            now,
        ],
    )?;

    Ok(License {
        id,
        key_hash: input.key_hash.clone(),
        key_partial: input.key_partial.clone(),
        status: LicenseStatus::Active,
        email_hash: input.email_hash.clone(),
        customer_id: input.customer_id.clone(),
        product_id: input.product_id.clone(),
        order_id: input.order_id.clone(),
        max_activations: input.max_activations,
        activation_count: 0,
        expires_at: input.expires_at,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_license_by_key_hash(conn: &Connection, key_hash: &str) -> Result<Option<License>> {
    conn.query_row(
        &format!("SELECT {} FROM licenses WHERE key_hash = ?1", LICENSE_COLS),
        params![key_hash],
        license_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_license_by_id(conn: &Connection, id: &str) -> Result<Option<License>> {
    conn.query_row(
        &format!("SELECT {} FROM licenses WHERE id = ?1", LICENSE_COLS),
        params![id],
        license_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_license_by_order_id(conn: &Connection, order_id: &str) -> Result<Option<License>> {
    conn.query_row(
        &format!("SELECT {} FROM licenses WHERE order_id = ?1", LICENSE_COLS),
        params![order_id],
        license_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Most recent license for a customer email (webhook license resolution).
pub fn get_license_by_email_hash(conn: &Connection, email_hash: &str) -> Result<Option<License>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM licenses WHERE email_hash = ?1 ORDER BY created_at DESC LIMIT 1",
            LICENSE_COLS
        ),
        params![email_hash],
        license_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Suspend an active license. Returns false if the license was not active.
pub fn suspend_license(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE licenses SET status = 'suspended', updated_at = ?2 \
         WHERE id = ?1 AND status = 'active'",
        params![id, now()],
    )?;
    Ok(affected > 0)
}

/// Reactivate a suspended license. Deliberately guarded on the current
/// status: a revoked license can NEVER come back through this path.
pub fn reactivate_if_suspended(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE licenses SET status = 'active', updated_at = ?2 \
         WHERE id = ?1 AND status = 'suspended'",
        params![id, now()],
    )?;
    Ok(affected > 0)
}

/// Explicit admin override: reactivate a license regardless of current
/// status, including revoked. Not reachable from the public API or the
/// webhook dispatcher.
pub fn admin_reactivate_license(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE licenses SET status = 'active', updated_at = ?2 WHERE id = ?1",
        params![id, now()],
    )?;
    Ok(affected > 0)
}

pub fn extend_license_expiration(
    conn: &Connection,
    id: &str,
    new_expires_at: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE licenses SET expires_at = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, new_expires_at, now()],
    )?;
    Ok(())
}

// ============ Activations ============

const ACTIVATION_COLS: &str = "id, license_id, fingerprint_hash, machine_id_hash, active, \
     revoked, revoked_reason, activated_at, deactivated_at, revoked_at, ip_address";

fn activation_from_row(row: &Row) -> rusqlite::Result<Activation> {
    Ok(Activation {
        id: row.get(0)?,
        license_id: row.get(1)?,
        fingerprint_hash: row.get(2)?,
        machine_id_hash: row.get(3)?,
        active: row.get(4)?,
        revoked: row.get(5)?,
        revoked_reason: row.get(6)?,
        activated_at: row.get(7)?,
        deactivated_at: row.get(8)?,
        revoked_at: row.get(9)?,
        ip_address: row.get(10)?,
    })
}

pub fn find_active_activation(
    conn: &Connection,
    license_id: &str,
    fingerprint_hash: &str,
    machine_id_hash: &str,
) -> Result<Option<Activation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM activations \
             WHERE license_id = ?1 AND fingerprint_hash = ?2 AND machine_id_hash = ?3 \
             AND active = 1 AND revoked = 0",
            ACTIVATION_COLS
        ),
        params![license_id, fingerprint_hash, machine_id_hash],
        activation_from_row,
    )
    .optional()
    .map_err(Into::into)
}

/// Most recent activations for a license, capped for the status endpoint.
pub fn list_activations(conn: &Connection, license_id: &str, limit: i64) -> Result<Vec<Activation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM activations WHERE license_id = ?1 \
         ORDER BY activated_at DESC LIMIT ?2",
        ACTIVATION_COLS
    ))?;
    let rows = stmt.query_map(params![license_id, limit], activation_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn count_active_activations(conn: &Connection, license_id: &str) -> Result<i32> {
    conn.query_row(
        "SELECT COUNT(*) FROM activations WHERE license_id = ?1 AND active = 1 AND revoked = 0",
        params![license_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Result of attempting to activate a machine against a license.
pub enum ActivationAcquisition {
    /// The exact (fingerprint, machine id) binding already exists and is
    /// active - idempotent success, count unchanged.
    Existing(Activation),
    /// New binding created, activation count incremented.
    Created(Activation),
    /// No free activation slot.
    LimitReached { active_count: i32, max: i32 },
}

/// Atomically bind a machine to a license, enforcing the activation ceiling.
///
/// Uses an IMMEDIATE transaction so the write lock is taken up front:
/// two concurrent attempts on a license with one remaining slot serialize,
/// and exactly one of them creates a binding.
pub fn activate_machine_atomic(
    conn: &mut Connection,
    license_id: &str,
    fingerprint_hash: &str,
    machine_id_hash: &str,
    ip_address: Option<&str>,
    max_activations: i32,
) -> Result<ActivationAcquisition> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    // Re-activating an existing live binding is a no-op success
    if let Some(existing) = find_active_activation(&tx, license_id, fingerprint_hash, machine_id_hash)? {
        tx.commit()?;
        return Ok(ActivationAcquisition::Existing(existing));
    }

    let active_count: i32 = tx.query_row(
        "SELECT COUNT(*) FROM activations WHERE license_id = ?1 AND active = 1 AND revoked = 0",
        params![license_id],
        |row| row.get(0),
    )?;

    if active_count >= max_activations {
        // Rolls back on drop; nothing was written
        return Ok(ActivationAcquisition::LimitReached {
            active_count,
            max: max_activations,
        });
    }

    let id = EntityType::Activation.gen_id();
    let now = now();

    tx.execute(
        "INSERT INTO activations (id, license_id, fingerprint_hash, machine_id_hash, \
         active, revoked, activated_at, ip_address)
         VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?6)",
        params![&id, license_id, fingerprint_hash, machine_id_hash, now, ip_address],
    )?;

    tx.execute(
        "UPDATE licenses SET activation_count = activation_count + 1, updated_at = ?2 \
         WHERE id = ?1",
        params![license_id, now],
    )?;

    tx.commit()?;

    Ok(ActivationAcquisition::Created(Activation {
        id,
        license_id: license_id.to_string(),
        fingerprint_hash: fingerprint_hash.to_string(),
        machine_id_hash: machine_id_hash.to_string(),
        active: true,
        revoked: false,
        revoked_reason: None,
        activated_at: now,
        deactivated_at: None,
        revoked_at: None,
        ip_address: ip_address.map(String::from),
    }))
}

/// Atomically release a machine binding. Returns the deactivated row, or
/// None when no live binding matched. The license itself is untouched.
pub fn deactivate_machine_atomic(
    conn: &mut Connection,
    license_id: &str,
    fingerprint_hash: &str,
    machine_id_hash: &str,
) -> Result<Option<Activation>> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let Some(activation) =
        find_active_activation(&tx, license_id, fingerprint_hash, machine_id_hash)?
    else {
        return Ok(None);
    };

    let now = now();
    tx.execute(
        "UPDATE activations SET active = 0, deactivated_at = ?2 WHERE id = ?1",
        params![&activation.id, now],
    )?;
    tx.execute(
        "UPDATE licenses SET activation_count = MAX(activation_count - 1, 0), updated_at = ?2 \
         WHERE id = ?1",
        params![license_id, now],
    )?;

    tx.commit()?;

    Ok(Some(Activation {
        active: false,
        deactivated_at: Some(now),
        ..activation
    }))
}

/// Summary of a revocation cascade.
#[derive(Debug)]
pub struct RevocationSummary {
    pub activations_revoked: usize,
    pub subscription_canceled: bool,
}

/// Cascade a revocation inside an existing transaction: license -> revoked,
/// all live activations -> revoked, any subscription -> canceled.
/// Callers that need the marker-and-transition atomicity (webhooks) run this
/// inside their own transaction; `revoke_license_cascade` wraps it for
/// standalone use.
pub fn revoke_cascade_in_tx(
    tx: &Connection,
    license_id: &str,
    reason: &str,
) -> Result<RevocationSummary> {
    let now = now();

    tx.execute(
        "UPDATE licenses SET status = 'revoked', activation_count = 0, updated_at = ?2 \
         WHERE id = ?1",
        params![license_id, now],
    )?;

    let activations_revoked = tx.execute(
        "UPDATE activations SET revoked = 1, active = 0, revoked_at = ?2, revoked_reason = ?3 \
         WHERE license_id = ?1 AND active = 1 AND revoked = 0",
        params![license_id, now, reason],
    )?;

    let subscription_canceled = tx.execute(
        "UPDATE subscriptions SET status = 'canceled', auto_renew = 0, updated_at = ?2 \
         WHERE license_id = ?1 AND status != 'canceled'",
        params![license_id, now],
    )? > 0;

    Ok(RevocationSummary {
        activations_revoked,
        subscription_canceled,
    })
}

/// Revoke a license and cascade to activations and subscription as a single
/// atomic unit.
pub fn revoke_license_cascade(
    conn: &mut Connection,
    license_id: &str,
    reason: &str,
) -> Result<RevocationSummary> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let summary = revoke_cascade_in_tx(&tx, license_id, reason)?;
    tx.commit()?;
    Ok(summary)
}

// ============ Subscriptions ============

const SUBSCRIPTION_COLS: &str =
    "id, license_id, provider, external_id, status, auto_renew, last_payment_at, \
     created_at, updated_at";

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    let status: String = row.get(4)?;
    Ok(Subscription {
        id: row.get(0)?,
        license_id: row.get(1)?,
        provider: row.get(2)?,
        external_id: row.get(3)?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown subscription status: {}", status).into(),
            )
        })?,
        auto_renew: row.get(5)?,
        last_payment_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub fn create_subscription(
    conn: &Connection,
    license_id: &str,
    provider: &str,
    external_id: &str,
) -> Result<Subscription> {
    let id = EntityType::Subscription.gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO subscriptions (id, license_id, provider, external_id, status, auto_renew, \
         last_payment_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'active', 1, ?5, ?5, ?5)",
        params![&id, license_id, provider, external_id, now],
    )?;

    Ok(Subscription {
        id,
        license_id: license_id.to_string(),
        provider: provider.to_string(),
        external_id: external_id.to_string(),
        status: SubscriptionStatus::Active,
        auto_renew: true,
        last_payment_at: Some(now),
        created_at: now,
        updated_at: now,
    })
}

pub fn get_subscription_by_external_id(
    conn: &Connection,
    provider: &str,
    external_id: &str,
) -> Result<Option<Subscription>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subscriptions WHERE provider = ?1 AND external_id = ?2",
            SUBSCRIPTION_COLS
        ),
        params![provider, external_id],
        subscription_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_subscription_by_license(
    conn: &Connection,
    license_id: &str,
) -> Result<Option<Subscription>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subscriptions WHERE license_id = ?1",
            SUBSCRIPTION_COLS
        ),
        params![license_id],
        subscription_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn mark_subscription_paid(conn: &Connection, id: &str, paid_at: i64) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET status = 'active', last_payment_at = ?2, updated_at = ?3 \
         WHERE id = ?1",
        params![id, paid_at, now()],
    )?;
    Ok(())
}

pub fn set_subscription_status(
    conn: &Connection,
    id: &str,
    status: SubscriptionStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status.as_ref(), now()],
    )?;
    Ok(())
}

// ============ Webhook Event Deduplication ============

/// Atomically record a webhook event, returning true if this is a new event.
/// Returns false if the event was already processed (replay protection).
///
/// Uses INSERT OR IGNORE for atomicity: run inside the same transaction as
/// the state transition so the marker commits only with it.
pub fn try_record_webhook_event(conn: &Connection, provider: &str, event_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (provider, event_id, created_at) VALUES (?1, ?2, ?3)",
        params![provider, event_id, now()],
    )?;
    Ok(affected > 0)
}

/// Purge old webhook event markers beyond the retention period.
/// Providers retry for at most a few days, so markers only need to outlive
/// the retry horizon. Returns the number of deleted records.
pub fn purge_old_webhook_events(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = now() - (retention_days * 86400);
    let deleted = conn.execute(
        "DELETE FROM webhook_events WHERE created_at < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}

// ============ Audit Logs ============

#[allow(clippy::too_many_arguments)]
pub fn create_audit_log(
    conn: &Connection,
    enabled: bool,
    category: EventCategory,
    event_type: &str,
    severity: Option<SecuritySeverity>,
    details: Option<&serde_json::Value>,
    license_id: Option<&str>,
    ip_address: Option<&str>,
) -> Result<AuditLog> {
    let id = EntityType::AuditLog.gen_id();
    let timestamp = now();

    let log = AuditLog {
        id: id.clone(),
        timestamp,
        category,
        event_type: event_type.to_string(),
        severity,
        details: details.cloned(),
        license_id: license_id.map(String::from),
        ip_address: ip_address.map(String::from),
    };

    if !enabled {
        return Ok(log);
    }

    conn.execute(
        "INSERT INTO audit_logs (id, timestamp, category, event_type, severity, details, \
         license_id, ip_address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &id,
            timestamp,
            category.as_ref(),
            event_type,
            severity.map(|s| s.as_ref().to_string()),
            details.map(|d| d.to_string()),
            license_id,
            ip_address,
        ],
    )?;

    Ok(log)
}

/// Purge audit entries older than the retention period.
/// Returns the number of deleted records. Called on startup when
/// AUDIT_LOG_RETENTION_DAYS > 0.
pub fn purge_old_audit_logs(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = now() - (retention_days * 86400);
    let deleted = conn.execute("DELETE FROM audit_logs WHERE timestamp < ?1", params![cutoff])?;
    Ok(deleted)
}

/// Audit rows for a license, newest first (used by tests and ops tooling).
pub fn list_audit_logs_for_license(
    conn: &Connection,
    license_id: &str,
    limit: i64,
) -> Result<Vec<AuditLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, category, event_type, severity, details, license_id, ip_address \
         FROM audit_logs WHERE license_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![license_id, limit], |row| {
        let category: String = row.get(2)?;
        let severity: Option<String> = row.get(4)?;
        let details: Option<String> = row.get(5)?;
        Ok(AuditLog {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            category: category.parse().map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown category: {}", category).into(),
                )
            })?,
            event_type: row.get(3)?,
            severity: severity.and_then(|s| s.parse().ok()),
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            license_id: row.get(6)?,
            ip_address: row.get(7)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}
