mod activation;
mod batch;
mod status;
mod validate;

pub use activation::*;
pub use batch::*;
pub use status::*;
pub use validate::*;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;

use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Static segments win over the {key} capture for overlapping paths
        .route("/licenses/batch", post(run_batch))
        .route("/validate/public-key", get(validation_public_key))
        .route("/{key}/validate", get(validate_license))
        .route("/{key}/validate/jwt", get(validate_license_jwt))
        .route("/{key}/activate", post(activate_license))
        .route("/{key}/deactivate", post(deactivate_license))
        .route("/{key}/status", get(license_status))
}
