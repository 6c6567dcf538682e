use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Json, Path};
use crate::rate_limit::RateLimitDecision;
use crate::service;
use crate::util::client_ip;

#[derive(Debug, Deserialize)]
pub struct MachineRequest {
    pub machine_fingerprint: String,
    pub machine_id: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_activations: Option<i32>,
    pub timestamp: i64,
    pub rate_limit: RateLimitDecision,
}

/// POST /{key}/activate
pub async fn activate_license(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<MachineRequest>,
) -> Result<Response> {
    let ip = client_ip(&headers, Some(addr));

    let (outcome, meta) = service::activate_license(
        &state,
        &key,
        &req.machine_fingerprint,
        &req.machine_id,
        ip.as_deref(),
    )
    .inspect_err(|e| service::note_internal_fault(&state, "activate_license", e, ip.as_deref()))?;

    let status = outcome
        .failure
        .map(|f| f.status_code())
        .unwrap_or(StatusCode::OK);

    let body = ActivateResponse {
        success: outcome.failure.is_none(),
        error: outcome.failure.map(|f| f.as_ref().to_string()),
        activation_count: outcome.activation_count,
        max_activations: outcome.max_activations,
        timestamp: Utc::now().timestamp(),
        rate_limit: meta,
    };

    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_count: Option<i32>,
    pub timestamp: i64,
    pub rate_limit: RateLimitDecision,
}

/// POST /{key}/deactivate
pub async fn deactivate_license(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<MachineRequest>,
) -> Result<Response> {
    let ip = client_ip(&headers, Some(addr));

    let (outcome, meta) = service::deactivate_license(
        &state,
        &key,
        &req.machine_fingerprint,
        &req.machine_id,
        ip.as_deref(),
    )
    .inspect_err(|e| {
        service::note_internal_fault(&state, "deactivate_license", e, ip.as_deref())
    })?;

    let status = outcome
        .failure
        .map(|f| f.status_code())
        .unwrap_or(StatusCode::OK);

    let body = DeactivateResponse {
        success: outcome.failure.is_none(),
        error: outcome.failure.map(|f| f.as_ref().to_string()),
        activation_count: outcome.activation_count,
        timestamp: Utc::now().timestamp(),
        rate_limit: meta,
    };

    Ok((status, Json(body)).into_response())
}
