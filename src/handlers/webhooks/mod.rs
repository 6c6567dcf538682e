pub mod common;
mod paypal;
mod stripe;

pub use paypal::*;
pub use stripe::*;

use axum::{Router, routing::post};

use crate::db::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/stripe", post(handle_stripe_webhook))
        .route("/webhooks/paypal", post(handle_paypal_webhook))
}
