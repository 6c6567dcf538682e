use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::db::AppState;
use crate::payments::{
    StripeCheckoutSession, StripeInvoice, StripeRefund, StripeSubscription, StripeWebhookEvent,
    StripeWebhookVerifier,
};

use super::common::{OrderData, WebhookEvent, WebhookProvider, WebhookResult, handle_webhook};

/// Stripe webhook provider implementation.
pub struct StripeWebhookProvider;

impl WebhookProvider for StripeWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    async fn verify_signature(
        &self,
        state: &AppState,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<bool, WebhookResult> {
        // Unconfigured endpoints answer 200 so the provider does not retry
        // indefinitely against a dead hook
        let Some(secret) = &state.stripe_webhook_secret else {
            return Err((StatusCode::OK, "Stripe not configured"));
        };

        let signature = headers
            .get("stripe-signature")
            .ok_or((StatusCode::BAD_REQUEST, "Missing stripe-signature header"))?
            .to_str()
            .map_err(|e| {
                tracing::debug!("Invalid UTF-8 in Stripe signature header: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid signature header")
            })?;

        StripeWebhookVerifier::new(secret)
            .verify(body, signature)
            .map_err(|e| {
                tracing::error!("Signature verification error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Signature verification failed",
                )
            })
    }

    fn parse_event(
        &self,
        _headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<WebhookEvent, WebhookResult> {
        let event: StripeWebhookEvent = serde_json::from_slice(body).map_err(|e| {
            tracing::error!("Failed to parse Stripe webhook: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid JSON")
        })?;

        match event.event_type.as_str() {
            "checkout.session.completed" => parse_checkout_completed(&event),
            "invoice.paid" => parse_invoice_paid(&event),
            "refund.created" => parse_refund_created(&event),
            "customer.subscription.deleted" => {
                parse_subscription_lifecycle(&event, |id| WebhookEvent::SubscriptionCancelled {
                    event_id: event.id.clone(),
                    subscription_id: id,
                })
            }
            "customer.subscription.paused" => {
                parse_subscription_lifecycle(&event, |id| WebhookEvent::SubscriptionSuspended {
                    event_id: event.id.clone(),
                    subscription_id: id,
                })
            }
            "customer.subscription.resumed" => {
                parse_subscription_lifecycle(&event, |id| WebhookEvent::SubscriptionReactivated {
                    event_id: event.id.clone(),
                    subscription_id: id,
                })
            }
            other => Ok(WebhookEvent::Ignored {
                reason: format!("unhandled event type: {}", other),
            }),
        }
    }
}

fn parse_checkout_completed(event: &StripeWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let session: StripeCheckoutSession = serde_json::from_value(event.data.object.clone())
        .map_err(|e| {
            tracing::error!("Failed to parse checkout session: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid checkout session")
        })?;

    if session.payment_status != "paid" {
        return Ok(WebhookEvent::Ignored {
            reason: format!("checkout session not paid: {}", session.payment_status),
        });
    }

    // Email entered during checkout wins over the one on the customer object
    let customer_email = session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or(session.customer_email.clone());

    // payment_intent is what refunds reference; session id is the fallback
    // for subscription-mode checkouts without one
    let order_id = session
        .payment_intent
        .clone()
        .unwrap_or_else(|| session.id.clone());

    Ok(WebhookEvent::PaymentCompleted {
        event_id: event.id.clone(),
        order: OrderData {
            order_id,
            customer_email,
            customer_id: session.metadata.customer_id.clone(),
            product_id: session.metadata.product_id.clone(),
            subscription_id: session.subscription.clone(),
        },
    })
}

fn parse_invoice_paid(event: &StripeWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let invoice: StripeInvoice = serde_json::from_value(event.data.object.clone()).map_err(|e| {
        tracing::error!("Failed to parse invoice: {}", e);
        (StatusCode::BAD_REQUEST, "Invalid invoice")
    })?;

    let Some(subscription_id) = invoice.subscription.clone() else {
        return Ok(WebhookEvent::Ignored {
            reason: "invoice without subscription".to_string(),
        });
    };

    // Initial subscription invoices arrive alongside checkout completion;
    // only true renewals extend the license here
    match invoice.billing_reason.as_deref() {
        Some("subscription_cycle") | Some("subscription_update") => {}
        _ => {
            return Ok(WebhookEvent::Ignored {
                reason: format!(
                    "invoice billing_reason not a renewal: {:?}",
                    invoice.billing_reason
                ),
            });
        }
    }

    if invoice.status != "paid" {
        return Ok(WebhookEvent::Ignored {
            reason: format!("invoice not paid: {}", invoice.status),
        });
    }

    Ok(WebhookEvent::SubscriptionRenewed {
        event_id: event.id.clone(),
        subscription_id,
        period_end: invoice.period_end,
    })
}

fn parse_refund_created(event: &StripeWebhookEvent) -> Result<WebhookEvent, WebhookResult> {
    let refund: StripeRefund = serde_json::from_value(event.data.object.clone()).map_err(|e| {
        tracing::error!("Failed to parse refund: {}", e);
        (StatusCode::BAD_REQUEST, "Invalid refund")
    })?;

    if refund.status != "succeeded" {
        return Ok(WebhookEvent::Ignored {
            reason: format!("refund not succeeded: {}", refund.status),
        });
    }

    // Prefer payment_intent for order linkage, fall back to charge ID
    let order_id = refund.payment_intent.or(refund.charge).ok_or_else(|| {
        tracing::error!("Refund {} has no payment_intent or charge", refund.id);
        (StatusCode::BAD_REQUEST, "Refund missing payment reference")
    })?;

    Ok(WebhookEvent::Refunded {
        event_id: event.id.clone(),
        order_id,
    })
}

fn parse_subscription_lifecycle(
    event: &StripeWebhookEvent,
    build: impl FnOnce(String) -> WebhookEvent,
) -> Result<WebhookEvent, WebhookResult> {
    let subscription: StripeSubscription = serde_json::from_value(event.data.object.clone())
        .map_err(|e| {
            tracing::error!("Failed to parse subscription: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid subscription")
        })?;

    Ok(build(subscription.id))
}

/// Axum handler for Stripe webhooks.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&StripeWebhookProvider, &state, headers, body).await
}
