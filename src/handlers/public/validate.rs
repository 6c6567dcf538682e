use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::AppState;
use crate::error::Result;
use crate::extractors::{Json, Path, Query};
use crate::jwt::{self, ValidationClaims};
use crate::rate_limit::RateLimitDecision;
use crate::service;
use crate::util::client_ip;

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub machine_fingerprint: Option<String>,
    pub machine_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
    pub rate_limit: RateLimitDecision,
}

/// GET /{key}/validate
pub async fn validate_license(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ValidateQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response> {
    let ip = client_ip(&headers, Some(addr));

    let (outcome, meta) = service::validate_license(
        &state,
        &key,
        query.machine_fingerprint.as_deref(),
        query.machine_id.as_deref(),
        ip.as_deref(),
    )
    .inspect_err(|e| service::note_internal_fault(&state, "validate_license", e, ip.as_deref()))?;

    let status = outcome
        .failure
        .map(|f| f.status_code())
        .unwrap_or(StatusCode::OK);

    let body = ValidateResponse {
        valid: outcome.valid(),
        error: outcome.failure.map(|f| f.as_ref().to_string()),
        timestamp: Utc::now().timestamp(),
        rate_limit: meta,
    };

    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Serialize)]
pub struct ValidateJwtResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Signed token encoding this validation result for stateless
    /// downstream verification
    pub token: String,
    pub timestamp: i64,
    pub rate_limit: RateLimitDecision,
}

/// GET /{key}/validate/jwt
pub async fn validate_license_jwt(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ValidateQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response> {
    let ip = client_ip(&headers, Some(addr));

    let (outcome, meta) = service::validate_license(
        &state,
        &key,
        query.machine_fingerprint.as_deref(),
        query.machine_id.as_deref(),
        ip.as_deref(),
    )
    .inspect_err(|e| {
        service::note_internal_fault(&state, "validate_license_jwt", e, ip.as_deref())
    })?;

    let now = Utc::now().timestamp();
    let error = outcome.failure.map(|f| f.as_ref().to_string());

    let claims = ValidationClaims {
        valid: outcome.valid(),
        error: error.clone(),
        license_key: outcome
            .license
            .as_ref()
            .map(|l| l.key_partial.clone())
            .unwrap_or_else(|| crate::privacy::partial_license_key(&key)),
        status: outcome.license.as_ref().map(|l| l.status.as_ref().to_string()),
        expires_at: outcome.license.as_ref().and_then(|l| l.expires_at),
        checked_at: now,
    };

    let token = jwt::sign_validation_claims(
        &claims,
        &state.signing_key,
        &Uuid::new_v4().to_string(),
    )
    .inspect_err(|e| {
        service::note_internal_fault(&state, "validate_license_jwt", e, ip.as_deref())
    })?;

    let status = outcome
        .failure
        .map(|f| f.status_code())
        .unwrap_or(StatusCode::OK);

    let body = ValidateJwtResponse {
        valid: outcome.valid(),
        error,
        token,
        timestamp: now,
        rate_limit: meta,
    };

    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
    pub algorithm: &'static str,
}

/// GET /validate/public-key - verification key for validation tokens
pub async fn validation_public_key(State(state): State<AppState>) -> Json<PublicKeyResponse> {
    Json(PublicKeyResponse {
        public_key: state.public_key.clone(),
        algorithm: "EdDSA",
    })
}
