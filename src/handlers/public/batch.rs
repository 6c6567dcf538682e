use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::AppState;
use crate::error::Result;
use crate::extractors::Json;
use crate::service::{self, BatchOperation, BatchResultLine};
use crate::util::client_ip;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub batch_id: String,
    pub operations_count: usize,
    pub results: Vec<BatchResultLine>,
    pub timestamp: i64,
}

/// POST /licenses/batch - up to 10 operations, processed independently.
/// Result lines echo only the masked license key.
pub async fn run_batch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    let ip = client_ip(&headers, Some(addr));

    let (batch_id, results) = service::run_batch(&state, &req.operations, ip.as_deref())
        .inspect_err(|e| service::note_internal_fault(&state, "run_batch", e, ip.as_deref()))?;

    Ok(Json(BatchResponse {
        success: true,
        batch_id,
        operations_count: results.len(),
        results,
        timestamp: Utc::now().timestamp(),
    }))
}
