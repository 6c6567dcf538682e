use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::db::AppState;
use crate::payments::{PayPalSignatureHeaders, PayPalWebhookEvent};

use super::common::{OrderData, WebhookEvent, WebhookProvider, WebhookResult, handle_webhook};

/// PayPal webhook provider implementation.
///
/// Replay protection is keyed by the transmission id from the delivery
/// headers, not the event body: PayPal re-signs each delivery attempt with
/// a fresh transmission id, and the id is what the verification API attests.
pub struct PayPalWebhookProvider;

impl WebhookProvider for PayPalWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "paypal"
    }

    async fn verify_signature(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<bool, WebhookResult> {
        let Some(client) = &state.paypal else {
            return Err((StatusCode::OK, "PayPal not configured"));
        };

        let Some(sig) = PayPalSignatureHeaders::from_headers(headers) else {
            return Err((StatusCode::BAD_REQUEST, "Missing PayPal signature headers"));
        };

        let event_body: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON"))?;

        client
            .verify_webhook_signature(&sig, &event_body)
            .await
            .map_err(|e| {
                tracing::error!("PayPal signature verification error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Signature verification failed",
                )
            })
    }

    fn parse_event(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<WebhookEvent, WebhookResult> {
        let event: PayPalWebhookEvent = serde_json::from_slice(body).map_err(|e| {
            tracing::error!("Failed to parse PayPal webhook: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid JSON")
        })?;

        // Transmission id keys replay protection; the event id is the
        // fallback for deliveries without one
        let event_id = headers
            .get("paypal-transmission-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| event.id.clone());

        match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => Ok(parse_capture_completed(event_id, &event)),
            "PAYMENT.SALE.COMPLETED" => Ok(parse_sale_completed(event_id, &event)),
            "PAYMENT.CAPTURE.REFUNDED" => Ok(WebhookEvent::Refunded {
                event_id,
                order_id: order_reference(&event.resource),
            }),
            "BILLING.SUBSCRIPTION.CANCELLED" => Ok(WebhookEvent::SubscriptionCancelled {
                event_id,
                subscription_id: resource_id(&event.resource),
            }),
            "BILLING.SUBSCRIPTION.SUSPENDED" => Ok(WebhookEvent::SubscriptionSuspended {
                event_id,
                subscription_id: resource_id(&event.resource),
            }),
            "BILLING.SUBSCRIPTION.ACTIVATED" => Ok(WebhookEvent::SubscriptionReactivated {
                event_id,
                subscription_id: resource_id(&event.resource),
            }),
            other => Ok(WebhookEvent::Ignored {
                reason: format!("unhandled event type: {}", other),
            }),
        }
    }
}

fn resource_id(resource: &serde_json::Value) -> String {
    resource
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Order reference for a capture/refund resource: the related order id when
/// PayPal supplies one, then the invoice id, then the resource's own id.
fn order_reference(resource: &serde_json::Value) -> String {
    resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(|v| v.as_str())
        .or_else(|| resource.get("invoice_id").and_then(|v| v.as_str()))
        .map(String::from)
        .unwrap_or_else(|| resource_id(resource))
}

fn parse_capture_completed(event_id: String, event: &PayPalWebhookEvent) -> WebhookEvent {
    let resource = &event.resource;
    WebhookEvent::PaymentCompleted {
        event_id,
        order: OrderData {
            order_id: order_reference(resource),
            customer_email: resource
                .pointer("/payer/email_address")
                .and_then(|v| v.as_str())
                .map(String::from),
            customer_id: None,
            // custom_id carries the merchant's product reference through checkout
            product_id: resource
                .get("custom_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            subscription_id: None,
        },
    }
}

/// Subscription billing arrives as PAYMENT.SALE.COMPLETED with a
/// billing_agreement_id; one-off sales without it are plain payments.
fn parse_sale_completed(event_id: String, event: &PayPalWebhookEvent) -> WebhookEvent {
    let resource = &event.resource;
    match resource.get("billing_agreement_id").and_then(|v| v.as_str()) {
        Some(subscription_id) => WebhookEvent::SubscriptionRenewed {
            event_id,
            subscription_id: subscription_id.to_string(),
            period_end: None,
        },
        None => WebhookEvent::PaymentCompleted {
            event_id,
            order: OrderData {
                order_id: order_reference(resource),
                customer_email: resource
                    .pointer("/payer/email_address")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                customer_id: None,
                product_id: resource
                    .get("custom_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                subscription_id: None,
            },
        },
    }
}

/// Axum handler for PayPal webhooks.
pub async fn handle_paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&PayPalWebhookProvider, &state, headers, body).await
}
