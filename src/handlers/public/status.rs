use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Json, Path};
use crate::rate_limit::RateLimitDecision;
use crate::service::{self, LicenseStatusSummary};
use crate::util::client_ip;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub summary: LicenseStatusSummary,
    pub timestamp: i64,
    pub rate_limit: RateLimitDecision,
}

#[derive(Debug, Serialize)]
struct StatusErrorResponse {
    error: String,
    timestamp: i64,
    rate_limit: RateLimitDecision,
}

/// GET /{key}/status - limited license summary, never the raw key
pub async fn license_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response> {
    let ip = client_ip(&headers, Some(addr));

    let (outcome, meta) = service::license_status(&state, &key, ip.as_deref())
        .inspect_err(|e| service::note_internal_fault(&state, "license_status", e, ip.as_deref()))?;

    let timestamp = Utc::now().timestamp();

    match (outcome.summary, outcome.failure) {
        (Some(summary), _) => Ok((
            StatusCode::OK,
            Json(StatusResponse {
                summary,
                timestamp,
                rate_limit: meta,
            }),
        )
            .into_response()),
        (None, failure) => {
            let failure = failure.unwrap_or(crate::models::LicenseFailure::LicenseNotFound);
            Ok((
                failure.status_code(),
                Json(StatusErrorResponse {
                    error: failure.as_ref().to_string(),
                    timestamp,
                    rate_limit: meta,
                }),
            )
                .into_response())
        }
    }
}
