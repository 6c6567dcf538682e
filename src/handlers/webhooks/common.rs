//! Common webhook handling infrastructure for payment providers.
//!
//! Providers implement signature verification and event parsing; the shared
//! dispatch below performs exactly one state-machine transition per event,
//! with the replay marker and the transition committed in a single
//! transaction. A partially applied event (marker without transition, or
//! the reverse) cannot be observed.

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

use crate::audit::{AuditLogBuilder, record_security_event};
use crate::db::{AppState, queries};
use crate::error::AppError;
use crate::models::{CreateLicense, EventCategory, License, LicenseStatus, SubscriptionStatus};
use crate::privacy;
use crate::util::extract_request_info;

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

/// Data extracted from a payment/order completion event.
#[derive(Debug)]
pub struct OrderData {
    /// Provider's order/payment reference, stored for refund linkage
    pub order_id: String,
    pub customer_email: Option<String>,
    pub customer_id: Option<String>,
    pub product_id: Option<String>,
    /// Present when the purchase opened a subscription
    pub subscription_id: Option<String>,
}

/// Parsed webhook event with provider-agnostic data. Every variant carries
/// the provider-assigned id used for replay protection.
#[derive(Debug)]
pub enum WebhookEvent {
    /// Payment completed - creates a license (or revives a suspended one
    /// for a known order)
    PaymentCompleted { event_id: String, order: OrderData },
    /// Subscription renewal paid - extends the license
    SubscriptionRenewed {
        event_id: String,
        subscription_id: String,
        period_end: Option<i64>,
    },
    /// Provider suspended the subscription - license suspended
    SubscriptionSuspended {
        event_id: String,
        subscription_id: String,
    },
    /// Provider reactivated the subscription - license reactivated
    /// (only from suspended, never from revoked)
    SubscriptionReactivated {
        event_id: String,
        subscription_id: String,
    },
    /// Subscription cancelled - license revoked, cascade included
    SubscriptionCancelled {
        event_id: String,
        subscription_id: String,
    },
    /// Payment refunded - license revoked, cascade included
    Refunded { event_id: String, order_id: String },
    /// Event type not relevant to license management. Accepted with 200 so
    /// the provider never retries, but logged.
    Ignored { reason: String },
}

/// Trait for payment provider webhook handling.
pub trait WebhookProvider: Send + Sync {
    /// Provider name for logging and database storage (e.g., "stripe", "paypal")
    fn provider_name(&self) -> &'static str;

    /// Verify the delivery's authenticity. Stripe verifies locally against
    /// the endpoint secret; PayPal calls the provider's verification API.
    fn verify_signature(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> impl Future<Output = Result<bool, WebhookResult>> + Send;

    /// Parse the webhook payload into a provider-agnostic event.
    fn parse_event(&self, headers: &HeaderMap, body: &Bytes)
    -> Result<WebhookEvent, WebhookResult>;
}

/// Generic webhook handler that delegates to provider-specific
/// implementations. Processing is bounded: providers apply their own
/// retry/backoff on timeout.
pub async fn handle_webhook<P: WebhookProvider>(
    provider: &P,
    state: &AppState,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let (ip, _) = extract_request_info(&headers);

    let work = async {
        match provider.verify_signature(state, &headers, &body).await {
            Ok(true) => {}
            Ok(false) => {
                record_security_event(
                    state,
                    "webhook_signature_invalid",
                    &json!({ "provider": provider.provider_name() }),
                    None,
                    ip.as_deref(),
                );
                return (StatusCode::UNAUTHORIZED, "Invalid signature");
            }
            Err(e) => return e,
        }

        let event = match provider.parse_event(&headers, &body) {
            Ok(e) => e,
            Err(e) => return e,
        };

        dispatch_event(state, provider.provider_name(), event, ip.as_deref())
    };

    match tokio::time::timeout(state.webhook_timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "{} webhook processing exceeded {:?}",
                provider.provider_name(),
                state.webhook_timeout
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Webhook processing timed out")
        }
    }
}

fn dispatch_event(
    state: &AppState,
    provider: &'static str,
    event: WebhookEvent,
    ip: Option<&str>,
) -> WebhookResult {
    match event {
        WebhookEvent::PaymentCompleted { event_id, order } => {
            process_payment_completed(state, provider, &event_id, &order, ip)
                .unwrap_or_else(|e| e)
        }
        WebhookEvent::SubscriptionRenewed {
            event_id,
            subscription_id,
            period_end,
        } => process_renewal(state, provider, &event_id, &subscription_id, period_end, ip)
            .unwrap_or_else(|e| e),
        WebhookEvent::SubscriptionSuspended {
            event_id,
            subscription_id,
        } => process_suspension(state, provider, &event_id, &subscription_id, ip)
            .unwrap_or_else(|e| e),
        WebhookEvent::SubscriptionReactivated {
            event_id,
            subscription_id,
        } => process_reactivation(state, provider, &event_id, &subscription_id, ip)
            .unwrap_or_else(|e| e),
        WebhookEvent::SubscriptionCancelled {
            event_id,
            subscription_id,
        } => process_cancellation(state, provider, &event_id, &subscription_id, ip)
            .unwrap_or_else(|e| e),
        WebhookEvent::Refunded { event_id, order_id } => {
            process_refund(state, provider, &event_id, &order_id, ip).unwrap_or_else(|e| e)
        }
        WebhookEvent::Ignored { reason } => {
            tracing::info!("{} webhook ignored: {}", provider, reason);
            (StatusCode::OK, "Event ignored")
        }
    }
}

fn db_err(e: AppError) -> WebhookResult {
    tracing::error!("Webhook DB error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
}

/// Replay of an already-processed event: no reprocessing, log-only security
/// event, 200 so the provider stops retrying.
fn note_replay(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    ip: Option<&str>,
) -> WebhookResult {
    record_security_event(
        state,
        "webhook_replay_detected",
        &json!({ "provider": provider, "event_id": event_id }),
        None,
        ip,
    );
    (StatusCode::OK, "Already processed")
}

/// Resolve the license an event refers to: order reference first, then
/// customer email, then subscription external id.
fn resolve_license(
    conn: &Connection,
    provider: &str,
    order_id: Option<&str>,
    email_hash: Option<&str>,
    subscription_id: Option<&str>,
) -> Result<Option<License>, AppError> {
    if let Some(order_id) = order_id
        && let Some(license) = queries::get_license_by_order_id(conn, order_id)?
    {
        return Ok(Some(license));
    }
    if let Some(email_hash) = email_hash
        && let Some(license) = queries::get_license_by_email_hash(conn, email_hash)?
    {
        return Ok(Some(license));
    }
    if let Some(external_id) = subscription_id
        && let Some(subscription) =
            queries::get_subscription_by_external_id(conn, provider, external_id)?
    {
        return queries::get_license_by_id(conn, &subscription.license_id);
    }
    Ok(None)
}

fn audit_webhook_event(
    state: &AppState,
    category: EventCategory,
    event_type: &str,
    license_id: Option<&str>,
    ip: Option<&str>,
    details: serde_json::Value,
) {
    match state.audit.get() {
        Ok(conn) => {
            let mut builder = AuditLogBuilder::new(&conn, state.audit_log_enabled)
                .category(category)
                .event(event_type)
                .details(&details)
                .ip(ip);
            if let Some(id) = license_id {
                builder = builder.license(id);
            }
            if let Err(e) = builder.save() {
                tracing::warn!("Failed to write webhook audit log ({}): {}", event_type, e);
            }
        }
        Err(e) => tracing::warn!("Audit DB unavailable ({}): {}", event_type, e),
    }
}

/// Process a payment completion: create a license for a new order, or
/// revive and extend for a known one. Marker, license, and subscription
/// writes commit together.
fn process_payment_completed(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    order: &OrderData,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;
    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    let now = Utc::now().timestamp();
    let expires_at = state.license_exp_days.map(|days| now + days * 86400);
    let email_hash = order.customer_email.as_deref().map(|e| state.email_hasher.hash(e));

    let existing = resolve_license(
        &tx,
        provider,
        Some(&order.order_id),
        email_hash.as_deref(),
        order.subscription_id.as_deref(),
    )
    .map_err(db_err)?;

    let (license_id, created_key) = match existing {
        Some(license) if license.status == LicenseStatus::Revoked => {
            // Keep the marker so replays short-circuit, but a revoked
            // license stays revoked
            tx.commit().map_err(|e| db_err(e.into()))?;
            tracing::warn!(
                "{} payment ignored for revoked license {}: order={}",
                provider,
                license.id,
                order.order_id
            );
            return Ok((StatusCode::OK, "License revoked; payment ignored"));
        }
        Some(license) => {
            // Repeat payment against a known order: revive a suspended
            // license and push the expiry out
            queries::reactivate_if_suspended(&tx, &license.id).map_err(db_err)?;
            if expires_at.is_some() {
                queries::extend_license_expiration(&tx, &license.id, expires_at)
                    .map_err(db_err)?;
            }
            (license.id, None)
        }
        None => {
            let raw_key = queries::generate_license_key();
            let license = queries::create_license(
                &tx,
                &CreateLicense {
                    key_hash: privacy::hash_license_key(&raw_key),
                    key_partial: privacy::partial_license_key(&raw_key),
                    email_hash,
                    customer_id: order.customer_id.clone(),
                    product_id: order
                        .product_id
                        .clone()
                        .unwrap_or_else(|| "default".to_string()),
                    order_id: Some(order.order_id.clone()),
                    max_activations: state.default_max_activations,
                    expires_at,
                },
            )
            .map_err(db_err)?;
            (license.id, Some(raw_key))
        }
    };

    if let Some(external_id) = &order.subscription_id {
        match queries::get_subscription_by_license(&tx, &license_id).map_err(db_err)? {
            Some(subscription) => {
                queries::mark_subscription_paid(&tx, &subscription.id, now).map_err(db_err)?;
            }
            None => {
                queries::create_subscription(&tx, &license_id, provider, external_id)
                    .map_err(db_err)?;
            }
        }
    }

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Payment,
        "payment_completed",
        Some(&license_id),
        ip,
        json!({
            "provider": provider,
            "order_id": order.order_id,
            "customer_email": order.customer_email,
            "subscription_id": order.subscription_id,
            "license_key": created_key,
            "created": created_key.is_some(),
        }),
    );

    tracing::info!(
        "{} payment completed: order={}, license_id={}, new_license={}",
        provider,
        order.order_id,
        license_id,
        created_key.is_some()
    );

    Ok((StatusCode::OK, "OK"))
}

/// Process a subscription renewal: extend expiry, revive a suspended
/// license, record the payment. All inside one transaction with the marker.
fn process_renewal(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    subscription_id: &str,
    period_end: Option<i64>,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;

    let Some(subscription) =
        queries::get_subscription_by_external_id(&conn, provider, subscription_id)
            .map_err(db_err)?
    else {
        tracing::warn!(
            "No subscription found for {} renewal: {}",
            provider,
            subscription_id
        );
        // 200: retrying cannot make an unknown subscription appear
        return Ok((StatusCode::OK, "License not found for subscription"));
    };

    let Some(license) =
        queries::get_license_by_id(&conn, &subscription.license_id).map_err(db_err)?
    else {
        return Ok((StatusCode::OK, "License not found for subscription"));
    };

    // A revoked license never comes back through payment events, and a
    // renewal must not extend its expiry either
    if license.status == LicenseStatus::Revoked {
        tracing::warn!(
            "{} renewal ignored for revoked license {}: subscription={}",
            provider,
            license.id,
            subscription_id
        );
        return Ok((StatusCode::OK, "License revoked; renewal ignored"));
    }

    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    let now = Utc::now().timestamp();

    // Provider billing period end wins; fall back to the configured term.
    // With neither, the stored expiry stands.
    let new_expires_at = period_end
        .or_else(|| state.license_exp_days.map(|days| now + days * 86400))
        .or(license.expires_at);

    queries::extend_license_expiration(&tx, &license.id, new_expires_at).map_err(db_err)?;
    queries::reactivate_if_suspended(&tx, &license.id).map_err(db_err)?;
    queries::mark_subscription_paid(&tx, &subscription.id, now).map_err(db_err)?;

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Payment,
        "subscription_renewed",
        Some(&license.id),
        ip,
        json!({
            "provider": provider,
            "subscription_id": subscription_id,
            "new_expires_at": new_expires_at,
            "period_end_from_provider": period_end.is_some(),
        }),
    );

    tracing::info!(
        "{} subscription renewed: subscription={}, license_id={}, new_expires_at={:?}",
        provider,
        subscription_id,
        license.id,
        new_expires_at
    );

    Ok((StatusCode::OK, "OK"))
}

fn process_suspension(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    subscription_id: &str,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;

    let Some(subscription) =
        queries::get_subscription_by_external_id(&conn, provider, subscription_id)
            .map_err(db_err)?
    else {
        return Ok((StatusCode::OK, "License not found for subscription"));
    };

    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    queries::suspend_license(&tx, &subscription.license_id).map_err(db_err)?;
    queries::set_subscription_status(&tx, &subscription.id, SubscriptionStatus::Suspended)
        .map_err(db_err)?;

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Webhook,
        "subscription_suspended",
        Some(&subscription.license_id),
        ip,
        json!({ "provider": provider, "subscription_id": subscription_id }),
    );

    Ok((StatusCode::OK, "OK"))
}

fn process_reactivation(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    subscription_id: &str,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;

    let Some(subscription) =
        queries::get_subscription_by_external_id(&conn, provider, subscription_id)
            .map_err(db_err)?
    else {
        return Ok((StatusCode::OK, "License not found for subscription"));
    };

    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    // Only suspended licenses come back; a revoked license never
    // reactivates from a webhook
    let reactivated =
        queries::reactivate_if_suspended(&tx, &subscription.license_id).map_err(db_err)?;
    queries::set_subscription_status(&tx, &subscription.id, SubscriptionStatus::Active)
        .map_err(db_err)?;

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Webhook,
        "subscription_reactivated",
        Some(&subscription.license_id),
        ip,
        json!({
            "provider": provider,
            "subscription_id": subscription_id,
            "reactivated": reactivated,
        }),
    );

    Ok((StatusCode::OK, "OK"))
}

fn process_cancellation(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    subscription_id: &str,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;

    let Some(subscription) =
        queries::get_subscription_by_external_id(&conn, provider, subscription_id)
            .map_err(db_err)?
    else {
        tracing::warn!(
            "No subscription found for {} cancellation: {}",
            provider,
            subscription_id
        );
        return Ok((StatusCode::OK, "License not found for subscription"));
    };

    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    let summary = match queries::revoke_cascade_in_tx(
        &tx,
        &subscription.license_id,
        "subscription_cancelled",
    ) {
        Ok(summary) => summary,
        Err(e) => {
            record_security_event(
                state,
                "revocation_cascade_failed",
                &json!({ "provider": provider, "subscription_id": subscription_id }),
                Some(&subscription.license_id),
                ip,
            );
            return Err(db_err(e));
        }
    };

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Webhook,
        "subscription_cancelled",
        Some(&subscription.license_id),
        ip,
        json!({
            "provider": provider,
            "subscription_id": subscription_id,
            "activations_revoked": summary.activations_revoked,
        }),
    );

    tracing::info!(
        "{} subscription cancelled: subscription={}, license_id={}, activations_revoked={}",
        provider,
        subscription_id,
        subscription.license_id,
        summary.activations_revoked
    );

    Ok((StatusCode::OK, "OK"))
}

fn process_refund(
    state: &AppState,
    provider: &'static str,
    event_id: &str,
    order_id: &str,
    ip: Option<&str>,
) -> Result<WebhookResult, WebhookResult> {
    let mut conn = state.db.get().map_err(|e| db_err(e.into()))?;

    let Some(license) = queries::get_license_by_order_id(&conn, order_id).map_err(db_err)? else {
        tracing::warn!("No license found for {} refund order: {}", provider, order_id);
        // 200: the refund cannot be linked and a retry will not change that
        return Ok((StatusCode::OK, "Original order not found"));
    };

    let tx = conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .map_err(|e| db_err(e.into()))?;

    if !queries::try_record_webhook_event(&tx, provider, event_id).map_err(db_err)? {
        return Ok(note_replay(state, provider, event_id, ip));
    }

    let summary = match queries::revoke_cascade_in_tx(&tx, &license.id, "payment_refunded") {
        Ok(summary) => summary,
        Err(e) => {
            record_security_event(
                state,
                "revocation_cascade_failed",
                &json!({ "provider": provider, "order_id": order_id }),
                Some(&license.id),
                ip,
            );
            return Err(db_err(e));
        }
    };

    tx.commit().map_err(|e| db_err(e.into()))?;

    audit_webhook_event(
        state,
        EventCategory::Payment,
        "payment_refunded",
        Some(&license.id),
        ip,
        json!({
            "provider": provider,
            "order_id": order_id,
            "activations_revoked": summary.activations_revoked,
            "subscription_canceled": summary.subscription_canceled,
        }),
    );

    tracing::info!(
        "{} refund processed: order={}, license_id={}, activations_revoked={}",
        provider,
        order_id,
        license.id,
        summary.activations_revoked
    );

    Ok((StatusCode::OK, "OK"))
}
