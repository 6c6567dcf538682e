//! Webhook dispatcher tests: signature verification, replay protection,
//! and license state transitions driven by provider events.

mod common;
use common::*;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use tower::ServiceExt;

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

fn stripe_request(header: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", header)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn checkout_event(event_id: &str, order_id: &str, email: &str) -> serde_json::Value {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": "cs_test_1",
                "payment_status": "paid",
                "customer_details": { "email": email },
                "payment_intent": order_id,
                "metadata": { "product_id": "pro" },
            }
        }
    })
}

#[tokio::test]
async fn test_checkout_completed_creates_license_and_marks_event() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let app = app(state);

    let (header, body) = stripe_signed(&checkout_event("evt_1", "pi_100", "buyer@example.com"));
    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_order_id(&conn, "pi_100").unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Active);
    assert_eq!(license.product_id, "pro");
    assert_eq!(license.activation_count, 0);
    assert_eq!(license.max_activations, 3);
    // license_exp_days = 365 in the test config
    assert!(license.expires_at.unwrap() > now() + 360 * 86400);

    // The event is marked processed
    assert!(!queries::try_record_webhook_event(&conn, "stripe", "evt_1").unwrap());
}

/// Submitting the identical signed event twice performs exactly one state
/// transition; the second delivery is a reported no-op.
#[tokio::test]
async fn test_replayed_event_is_not_reprocessed() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let app = app(state);

    let event = checkout_event("evt_replay", "pi_200", "buyer@example.com");

    let (header, body) = stripe_signed(&event);
    let response = app
        .clone()
        .oneshot(stripe_request(&header, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (header, body) = stripe_signed(&event);
    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Already processed");

    // Exactly one license exists for the order
    let conn = db.get().unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM licenses WHERE order_id = 'pi_200'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_invalid_signature_rejected_without_state_change() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let audit = state.audit.clone();
    let app = app(state);

    let body = serde_json::to_vec(&checkout_event("evt_bad", "pi_300", "x@example.com")).unwrap();
    let header = format!("t={},v1={}", now(), "0".repeat(64));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let conn = db.get().unwrap();
    assert!(queries::get_license_by_order_id(&conn, "pi_300").unwrap().is_none());
    // The rejected event was never marked processed
    assert!(queries::try_record_webhook_event(&conn, "stripe", "evt_bad").unwrap());

    // A security event was recorded
    let audit_conn = audit.get().unwrap();
    let count: i64 = audit_conn
        .query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE category = 'security' \
             AND event_type = 'webhook_signature_invalid'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_unknown_event_type_is_accepted_noop() {
    let (state, _dir) = test_state();
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_unknown",
        "type": "customer.created",
        "data": { "object": {} }
    }));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Event ignored");
}

/// Refund: license revoked, all activations revoked, subscription
/// canceled - one atomic outcome.
#[tokio::test]
async fn test_refund_revokes_license_with_cascade() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        let license =
            create_test_license_with_order(&conn, "KW-AAAA-BBBB-CCCC-5001", 5, "pi_400");
        queries::create_subscription(&conn, &license.id, "stripe", "sub_400").unwrap();
        license.id
    };
    activate_test_machine(&state, &license_id, "fp-a", "mid-a");
    activate_test_machine(&state, &license_id, "fp-b", "mid-b");
    activate_test_machine(&state, &license_id, "fp-c", "mid-c");
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_refund",
        "type": "refund.created",
        "data": {
            "object": {
                "id": "re_1",
                "status": "succeeded",
                "payment_intent": "pi_400",
            }
        }
    }));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Revoked);
    assert_eq!(license.activation_count, 0);

    let activations = queries::list_activations(&conn, &license_id, 50).unwrap();
    assert_eq!(activations.len(), 3);
    for activation in activations {
        assert!(activation.revoked);
        assert!(!activation.active);
    }

    let subscription = queries::get_subscription_by_license(&conn, &license_id)
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_subscription_cancellation_revokes_license() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        let license =
            create_test_license_with_order(&conn, "KW-AAAA-BBBB-CCCC-5002", 3, "pi_500");
        queries::create_subscription(&conn, &license.id, "stripe", "sub_500").unwrap();
        license.id
    };
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_cancel",
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_500", "status": "canceled" } }
    }));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Revoked);
}

#[tokio::test]
async fn test_renewal_extends_and_reactivates_suspended() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let (license_id, old_exp) = {
        let conn = db.get().unwrap();
        let license =
            create_test_license_with_order(&conn, "KW-AAAA-BBBB-CCCC-5003", 3, "pi_600");
        queries::create_subscription(&conn, &license.id, "stripe", "sub_600").unwrap();
        queries::suspend_license(&conn, &license.id).unwrap();
        (license.id, license.expires_at.unwrap())
    };
    let app = app(state);

    let period_end = future_timestamp(90);
    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_renewal",
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": "in_1",
                "subscription": "sub_600",
                "billing_reason": "subscription_cycle",
                "status": "paid",
                "period_end": period_end,
            }
        }
    }));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Active, "renewal revives a suspended license");
    assert_eq!(license.expires_at, Some(period_end));
    assert!(license.expires_at.unwrap() > old_exp);

    let subscription = queries::get_subscription_by_license(&conn, &license_id)
        .unwrap()
        .unwrap();
    assert!(subscription.last_payment_at.is_some());
}

/// A cancelled (revoked) license never comes back through payment events.
#[tokio::test]
async fn test_renewal_never_revives_revoked_license() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        let license =
            create_test_license_with_order(&conn, "KW-AAAA-BBBB-CCCC-5004", 3, "pi_700");
        queries::create_subscription(&conn, &license.id, "stripe", "sub_700").unwrap();
        drop(conn);
        let mut conn = db.get().unwrap();
        queries::revoke_license_cascade(&mut conn, &license.id, "chargeback").unwrap();
        license.id
    };
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_zombie",
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": "in_2",
                "subscription": "sub_700",
                "billing_reason": "subscription_cycle",
                "status": "paid",
                "period_end": future_timestamp(90),
            }
        }
    }));

    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Revoked);
}

#[tokio::test]
async fn test_renewal_for_unknown_subscription_is_200() {
    let (state, _dir) = test_state();
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_orphan",
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": "in_3",
                "subscription": "sub_nonexistent",
                "billing_reason": "subscription_cycle",
                "status": "paid",
            }
        }
    }));

    // 200 so the provider does not retry-storm an unresolvable event
    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "License not found for subscription");
}

#[tokio::test]
async fn test_subscription_pause_and_resume() {
    let (state, _dir) = test_state();
    let db = state.db.clone();
    let license_id = {
        let conn = db.get().unwrap();
        let license =
            create_test_license_with_order(&conn, "KW-AAAA-BBBB-CCCC-5005", 3, "pi_800");
        queries::create_subscription(&conn, &license.id, "stripe", "sub_800").unwrap();
        license.id
    };
    let app = app(state);

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_pause",
        "type": "customer.subscription.paused",
        "data": { "object": { "id": "sub_800", "status": "paused" } }
    }));
    let response = app.clone().oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    {
        let conn = db.get().unwrap();
        let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
        assert_eq!(license.status, LicenseStatus::Suspended);
    }

    let (header, body) = stripe_signed(&serde_json::json!({
        "id": "evt_resume",
        "type": "customer.subscription.resumed",
        "data": { "object": { "id": "sub_800", "status": "active" } }
    }));
    let response = app.oneshot(stripe_request(&header, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let conn = db.get().unwrap();
    let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
    assert_eq!(license.status, LicenseStatus::Active);
}

#[tokio::test]
async fn test_missing_signature_header_is_bad_request() {
    let (state, _dir) = test_state();
    let app = app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/stripe")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// An unconfigured PayPal endpoint acknowledges deliveries instead of
/// triggering provider retries.
#[tokio::test]
async fn test_paypal_unconfigured_acknowledges() {
    let (state, _dir) = test_state();
    assert!(state.paypal.is_none());
    let app = app(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/paypal")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "PayPal not configured");
}
