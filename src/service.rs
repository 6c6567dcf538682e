//! License operation orchestration.
//!
//! Every public operation runs the same fixed sequence: rate-limit check by
//! client IP, rate-limit check by license key, state-machine delegation,
//! audit log entry, and rate-limit metadata attached to the response. A
//! denial in either admission step short-circuits before license state is
//! touched.
//!
//! Expected failures (unknown key, expired, limit reached) are values, not
//! errors: handlers map them to structured JSON with stable `error` strings.
//! `AppError` is reserved for plumbing faults and admission denials.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditLogBuilder, record_security_event};
use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{
    ActivationSummary, EventCategory, License, LicenseFailure, LicenseStatus,
};
use crate::privacy;
use crate::rate_limit::{self, Endpoint, RateLimitDecision, Subject};

/// Hard cap on operations per batch request.
pub const MAX_BATCH_OPERATIONS: usize = 10;

/// Activation history rows returned by the status endpoint.
const ACTIVATION_HISTORY_LIMIT: i64 = 50;

// ============ Admission ============

fn check_window(state: &AppState, subject: &Subject, endpoint: Endpoint) -> Result<RateLimitDecision> {
    let conn = state.db.get()?;
    rate_limit::check_rate_limit(
        &conn,
        subject,
        endpoint,
        state.rate_limit.limit_for(endpoint),
        state.rate_limit.window_seconds,
    )
}

fn deny(state: &AppState, subject: &Subject, endpoint: Endpoint, decision: &RateLimitDecision, ip: Option<&str>) -> AppError {
    record_security_event(
        state,
        "rate_limit_exceeded",
        &json!({
            "subject_type": subject.subject_type(),
            "endpoint": endpoint.as_ref(),
            "limit": decision.limit,
        }),
        None,
        ip,
    );
    AppError::RateLimited {
        limit: decision.limit,
        reset_at: decision.reset_at,
        retry_after: decision.retry_after(chrono::Utc::now().timestamp()),
    }
}

/// Admission check in the fixed order: IP window first, license-key window
/// second. Returns the metadata of the tightest applicable window.
fn admit(
    state: &AppState,
    ip: Option<&str>,
    key_hash: Option<&str>,
    endpoint: Endpoint,
) -> Result<RateLimitDecision> {
    let mut meta = None;

    if let Some(ip_value) = ip {
        let subject = Subject::Ip(ip_value.to_string());
        let decision = check_window(state, &subject, endpoint)?;
        if !decision.allowed {
            return Err(deny(state, &subject, endpoint, &decision, ip));
        }
        meta = Some(decision);
    }

    if let Some(hash) = key_hash {
        let subject = Subject::LicenseKey(hash.to_string());
        let decision = check_window(state, &subject, endpoint)?;
        if !decision.allowed {
            return Err(deny(state, &subject, endpoint, &decision, ip));
        }
        meta = Some(match meta {
            Some(prev) if prev.remaining < decision.remaining => prev,
            _ => decision,
        });
    }

    Ok(meta.unwrap_or(RateLimitDecision {
        allowed: true,
        limit: state.rate_limit.limit_for(endpoint),
        remaining: state.rate_limit.limit_for(endpoint),
        reset_at: chrono::Utc::now().timestamp(),
    }))
}

// ============ Audit helpers ============

fn audit_license_event(
    state: &AppState,
    category: EventCategory,
    event_type: &str,
    raw_key: &str,
    license_id: Option<&str>,
    ip: Option<&str>,
    details: serde_json::Value,
) {
    let mut details = details;
    if let Some(obj) = details.as_object_mut() {
        obj.insert("license_key".to_string(), json!(raw_key));
    }
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
                tracing::warn!("Failed to write audit log ({}): {}", event_type, e);
            }
        }
        Err(e) => tracing::warn!("Audit DB unavailable ({}): {}", event_type, e),
    }
}

/// Record a security incident for plumbing faults before the error is
/// mapped to a generic response.
pub fn note_internal_fault(state: &AppState, operation: &str, err: &AppError, ip: Option<&str>) {
    if err.is_internal() {
        record_security_event(
            state,
            "internal_fault",
            &json!({ "operation": operation, "error": err.to_string() }),
            None,
            ip,
        );
    }
}

// ============ Validation ============

#[derive(Debug)]
pub struct ValidationOutcome {
    pub failure: Option<LicenseFailure>,
    pub license: Option<License>,
}

impl ValidationOutcome {
    pub fn valid(&self) -> bool {
        self.failure.is_none()
    }
}

/// Validate a license key, optionally against a machine binding.
/// Returns the outcome plus rate-limit metadata for the response.
pub fn validate_license(
    state: &AppState,
    raw_key: &str,
    fingerprint: Option<&str>,
    machine_id: Option<&str>,
    ip: Option<&str>,
) -> Result<(ValidationOutcome, RateLimitDecision)> {
    // Empty query values count as absent
    let fingerprint = fingerprint.filter(|s| !s.trim().is_empty());
    let machine_id = machine_id.filter(|s| !s.trim().is_empty());

    if fingerprint.is_some() != machine_id.is_some() {
        return Err(AppError::BadRequest(
            "machine_fingerprint and machine_id must be provided together".into(),
        ));
    }

    let key_hash = privacy::hash_license_key(raw_key);
    let meta = admit(state, ip, Some(&key_hash), Endpoint::Validate)?;

    let outcome = validate_core(state, raw_key, &key_hash, fingerprint, machine_id, ip)?;
    Ok((outcome, meta))
}

fn validate_core(
    state: &AppState,
    raw_key: &str,
    key_hash: &str,
    fingerprint: Option<&str>,
    machine_id: Option<&str>,
    ip: Option<&str>,
) -> Result<ValidationOutcome> {
    let conn = state.db.get()?;
    let now = chrono::Utc::now().timestamp();

    let fail = |failure: LicenseFailure, license: Option<License>| {
        audit_license_event(
            state,
            EventCategory::License,
            "validate_license",
            raw_key,
            license.as_ref().map(|l| l.id.as_str()),
            ip,
            json!({ "outcome": failure.as_ref() }),
        );
        Ok(ValidationOutcome { failure: Some(failure), license })
    };

    let Some(license) = queries::get_license_by_key_hash(&conn, key_hash)? else {
        return fail(LicenseFailure::LicenseNotFound, None);
    };

    match license.status {
        LicenseStatus::Revoked => return fail(LicenseFailure::LicenseRevoked, Some(license)),
        LicenseStatus::Suspended => return fail(LicenseFailure::LicenseSuspended, Some(license)),
        LicenseStatus::Active => {}
    }

    // Expiry is derived: a stored 'active' status does not save an expired
    // license.
    if license.is_expired(now) {
        return fail(LicenseFailure::LicenseExpired, Some(license));
    }

    // When the caller identifies a machine, the license must actually be
    // bound to it - otherwise validation would allow unlimited-machine use.
    if let (Some(fp), Some(mid)) = (fingerprint, machine_id) {
        let fp_hash = state.machine_hasher.hash(fp);
        let mid_hash = state.machine_hasher.hash(mid);
        if queries::find_active_activation(&conn, &license.id, &fp_hash, &mid_hash)?.is_none() {
            return fail(LicenseFailure::ActivationNotFound, Some(license));
        }
    }

    audit_license_event(
        state,
        EventCategory::License,
        "validate_license",
        raw_key,
        Some(&license.id),
        ip,
        json!({ "outcome": "valid" }),
    );

    Ok(ValidationOutcome {
        failure: None,
        license: Some(license),
    })
}

// ============ Activation ============

#[derive(Debug)]
pub struct ActivationOutcome {
    pub failure: Option<LicenseFailure>,
    pub activation_count: Option<i32>,
    pub max_activations: Option<i32>,
}

pub fn activate_license(
    state: &AppState,
    raw_key: &str,
    fingerprint: &str,
    machine_id: &str,
    ip: Option<&str>,
) -> Result<(ActivationOutcome, RateLimitDecision)> {
    let key_hash = privacy::hash_license_key(raw_key);
    let meta = admit(state, ip, Some(&key_hash), Endpoint::Activate)?;
    let outcome = activate_core(state, raw_key, &key_hash, fingerprint, machine_id, ip)?;
    Ok((outcome, meta))
}

fn activate_core(
    state: &AppState,
    raw_key: &str,
    key_hash: &str,
    fingerprint: &str,
    machine_id: &str,
    ip: Option<&str>,
) -> Result<ActivationOutcome> {
    if fingerprint.trim().is_empty() || machine_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "machine_fingerprint and machine_id are required".into(),
        ));
    }

    let mut conn = state.db.get()?;
    let now = chrono::Utc::now().timestamp();

    let fail = |failure: LicenseFailure, license_id: Option<&str>, extra: serde_json::Value| {
        audit_license_event(
            state,
            EventCategory::License,
            "activate_license",
            raw_key,
            license_id,
            ip,
            {
                let mut details = extra;
                if let Some(obj) = details.as_object_mut() {
                    obj.insert("outcome".to_string(), json!(failure.as_ref()));
                }
                details
            },
        );
        Ok(ActivationOutcome {
            failure: Some(failure),
            activation_count: None,
            max_activations: None,
        })
    };

    let Some(license) = queries::get_license_by_key_hash(&conn, key_hash)? else {
        return fail(LicenseFailure::LicenseNotFound, None, json!({}));
    };

    // Suspended, revoked, and expired licenses all refuse new bindings
    if license.status != LicenseStatus::Active || license.is_expired(now) {
        return fail(LicenseFailure::LicenseInvalidState, Some(&license.id), json!({
            "status": license.status.as_ref(),
            "expired": license.is_expired(now),
        }));
    }

    let fp_hash = state.machine_hasher.hash(fingerprint);
    let mid_hash = state.machine_hasher.hash(machine_id);

    match queries::activate_machine_atomic(
        &mut conn,
        &license.id,
        &fp_hash,
        &mid_hash,
        ip,
        license.max_activations,
    )? {
        queries::ActivationAcquisition::LimitReached { active_count, max } => {
            record_security_event(
                state,
                "activation_limit_exceeded",
                &json!({
                    "license_key": raw_key,
                    "active_count": active_count,
                    "max_activations": max,
                }),
                Some(&license.id),
                ip,
            );
            fail(
                LicenseFailure::ActivationLimitExceeded,
                Some(&license.id),
                json!({ "active_count": active_count, "max_activations": max }),
            )
        }
        queries::ActivationAcquisition::Existing(_) => {
            audit_license_event(
                state,
                EventCategory::License,
                "activate_license",
                raw_key,
                Some(&license.id),
                ip,
                json!({ "outcome": "already_active", "machine_fingerprint": fingerprint }),
            );
            Ok(ActivationOutcome {
                failure: None,
                activation_count: Some(license.activation_count),
                max_activations: Some(license.max_activations),
            })
        }
        queries::ActivationAcquisition::Created(_) => {
            audit_license_event(
                state,
                EventCategory::License,
                "activate_license",
                raw_key,
                Some(&license.id),
                ip,
                json!({ "outcome": "activated", "machine_fingerprint": fingerprint }),
            );
            Ok(ActivationOutcome {
                failure: None,
                activation_count: Some(license.activation_count + 1),
                max_activations: Some(license.max_activations),
            })
        }
    }
}

// ============ Deactivation ============

#[derive(Debug)]
pub struct DeactivationOutcome {
    pub failure: Option<LicenseFailure>,
    pub activation_count: Option<i32>,
}

pub fn deactivate_license(
    state: &AppState,
    raw_key: &str,
    fingerprint: &str,
    machine_id: &str,
    ip: Option<&str>,
) -> Result<(DeactivationOutcome, RateLimitDecision)> {
    let key_hash = privacy::hash_license_key(raw_key);
    let meta = admit(state, ip, Some(&key_hash), Endpoint::Deactivate)?;
    let outcome = deactivate_core(state, raw_key, &key_hash, fingerprint, machine_id, ip)?;
    Ok((outcome, meta))
}

fn deactivate_core(
    state: &AppState,
    raw_key: &str,
    key_hash: &str,
    fingerprint: &str,
    machine_id: &str,
    ip: Option<&str>,
) -> Result<DeactivationOutcome> {
    if fingerprint.trim().is_empty() || machine_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "machine_fingerprint and machine_id are required".into(),
        ));
    }

    let mut conn = state.db.get()?;

    let Some(license) = queries::get_license_by_key_hash(&conn, key_hash)? else {
        audit_license_event(
            state,
            EventCategory::License,
            "deactivate_license",
            raw_key,
            None,
            ip,
            json!({ "outcome": LicenseFailure::LicenseNotFound.as_ref() }),
        );
        return Ok(DeactivationOutcome {
            failure: Some(LicenseFailure::LicenseNotFound),
            activation_count: None,
        });
    };

    let fp_hash = state.machine_hasher.hash(fingerprint);
    let mid_hash = state.machine_hasher.hash(machine_id);

    match queries::deactivate_machine_atomic(&mut conn, &license.id, &fp_hash, &mid_hash)? {
        None => {
            audit_license_event(
                state,
                EventCategory::License,
                "deactivate_license",
                raw_key,
                Some(&license.id),
                ip,
                json!({ "outcome": LicenseFailure::ActivationNotFound.as_ref() }),
            );
            Ok(DeactivationOutcome {
                failure: Some(LicenseFailure::ActivationNotFound),
                activation_count: None,
            })
        }
        Some(_) => {
            audit_license_event(
                state,
                EventCategory::License,
                "deactivate_license",
                raw_key,
                Some(&license.id),
                ip,
                json!({ "outcome": "deactivated", "machine_fingerprint": fingerprint }),
            );
            Ok(DeactivationOutcome {
                failure: None,
                activation_count: Some((license.activation_count - 1).max(0)),
            })
        }
    }
}

// ============ Status ============

#[derive(Debug, Serialize)]
pub struct LicenseStatusSummary {
    /// Masked - the raw key is never echoed
    pub license_key: String,
    pub status: String,
    pub expired: bool,
    pub expires_at: Option<i64>,
    pub activation_count: i32,
    pub max_activations: i32,
    pub activations: Vec<ActivationSummary>,
}

#[derive(Debug)]
pub struct StatusOutcome {
    pub failure: Option<LicenseFailure>,
    pub summary: Option<LicenseStatusSummary>,
}

pub fn license_status(
    state: &AppState,
    raw_key: &str,
    ip: Option<&str>,
) -> Result<(StatusOutcome, RateLimitDecision)> {
    let key_hash = privacy::hash_license_key(raw_key);
    let meta = admit(state, ip, Some(&key_hash), Endpoint::Status)?;

    let conn = state.db.get()?;
    let now = chrono::Utc::now().timestamp();

    let Some(license) = queries::get_license_by_key_hash(&conn, &key_hash)? else {
        return Ok((
            StatusOutcome {
                failure: Some(LicenseFailure::LicenseNotFound),
                summary: None,
            },
            meta,
        ));
    };

    let activations = queries::list_activations(&conn, &license.id, ACTIVATION_HISTORY_LIMIT)?;

    let summary = LicenseStatusSummary {
        license_key: license.key_partial.clone(),
        status: license.status.as_ref().to_string(),
        expired: license.is_expired(now),
        expires_at: license.expires_at,
        activation_count: license.activation_count,
        max_activations: license.max_activations,
        activations: activations.iter().map(ActivationSummary::from).collect(),
    };

    audit_license_event(
        state,
        EventCategory::License,
        "get_license_status",
        raw_key,
        Some(&license.id),
        ip,
        json!({ "outcome": "ok" }),
    );

    Ok((
        StatusOutcome {
            failure: None,
            summary: Some(summary),
        },
        meta,
    ))
}

// ============ Batch ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOpType {
    Validate,
    Activate,
    Deactivate,
}

impl BatchOpType {
    fn endpoint(&self) -> Endpoint {
        match self {
            BatchOpType::Validate => Endpoint::Validate,
            BatchOpType::Activate => Endpoint::Activate,
            BatchOpType::Deactivate => Endpoint::Deactivate,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchOperation {
    #[serde(rename = "type")]
    pub op_type: BatchOpType,
    pub license_key: String,
    pub machine_fingerprint: Option<String>,
    pub machine_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResultLine {
    /// Masked - batch results never echo the raw key
    pub license_key: String,
    #[serde(rename = "type")]
    pub op_type: BatchOpType,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run a batch of operations. The batch is admitted by a single strict
/// per-IP check; each line still pays its own per-key window. Operations are
/// independent - one failing line never aborts the rest.
pub fn run_batch(
    state: &AppState,
    operations: &[BatchOperation],
    ip: Option<&str>,
) -> Result<(String, Vec<BatchResultLine>)> {
    if operations.is_empty() {
        return Err(AppError::BadRequest("Batch cannot be empty".into()));
    }
    if operations.len() > MAX_BATCH_OPERATIONS {
        return Err(AppError::BadRequest(format!(
            "Batch size exceeds maximum of {} operations",
            MAX_BATCH_OPERATIONS
        )));
    }

    admit(state, ip, None, Endpoint::Batch)?;

    let batch_id = crate::id::EntityType::Batch.gen_id();
    let mut results = Vec::with_capacity(operations.len());

    for op in operations {
        results.push(run_batch_operation(state, op, ip));
    }

    audit_license_event(
        state,
        EventCategory::License,
        "run_batch",
        "",
        None,
        ip,
        json!({
            "batch_id": batch_id,
            "operations_count": operations.len(),
            "failed": results.iter().filter(|r: &&BatchResultLine| !r.success).count(),
        }),
    );

    Ok((batch_id, results))
}

fn run_batch_operation(state: &AppState, op: &BatchOperation, ip: Option<&str>) -> BatchResultLine {
    let masked = privacy::partial_license_key(&op.license_key);
    let key_hash = privacy::hash_license_key(&op.license_key);

    let line = |success: bool, error: Option<String>| BatchResultLine {
        license_key: masked.clone(),
        op_type: op.op_type,
        success,
        error,
    };

    // Per-key window: the batch request was already admitted per-IP
    let subject = Subject::LicenseKey(key_hash.clone());
    match check_window(state, &subject, op.op_type.endpoint()) {
        Ok(decision) if !decision.allowed => {
            return line(false, Some("RateLimitExceeded".to_string()));
        }
        Ok(_) => {}
        Err(_) => return line(false, Some("InternalError".to_string())),
    }

    let result = match op.op_type {
        BatchOpType::Validate => validate_core(
            state,
            &op.license_key,
            &key_hash,
            op.machine_fingerprint.as_deref(),
            op.machine_id.as_deref(),
            ip,
        )
        .map(|outcome| outcome.failure.map(|f| f.as_ref().to_string())),
        BatchOpType::Activate => {
            match (op.machine_fingerprint.as_deref(), op.machine_id.as_deref()) {
                (Some(fp), Some(mid)) => {
                    activate_core(state, &op.license_key, &key_hash, fp, mid, ip)
                        .map(|outcome| outcome.failure.map(|f| f.as_ref().to_string()))
                }
                _ => Ok(Some("ValidationError".to_string())),
            }
        }
        BatchOpType::Deactivate => {
            match (op.machine_fingerprint.as_deref(), op.machine_id.as_deref()) {
                (Some(fp), Some(mid)) => {
                    deactivate_core(state, &op.license_key, &key_hash, fp, mid, ip)
                        .map(|outcome| outcome.failure.map(|f| f.as_ref().to_string()))
                }
                _ => Ok(Some("ValidationError".to_string())),
            }
        }
    };

    match result {
        Ok(None) => line(true, None),
        Ok(Some(error)) => line(false, Some(error)),
        Err(AppError::BadRequest(_)) => line(false, Some("ValidationError".to_string())),
        Err(e) => {
            note_internal_fault(state, "batch_operation", &e, ip);
            line(false, Some("InternalError".to_string()))
        }
    }
}
