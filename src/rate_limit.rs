//! Fixed-window rate limiting keyed by (subject, endpoint).
//!
//! Counters live in the main database so limits hold across every worker
//! touching the same store. Each check is a single atomic upsert - no
//! read-then-write window for concurrent callers to lose increments in.
//!
//! Policy notes, both deliberate:
//! - The increment on a denied call stands. Hammering a denied endpoint
//!   keeps the window full and pushes recovery out.
//! - Fail-closed: if the counter store errors, the request is denied
//!   (propagated as an internal error) rather than admitted uncounted.

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;
use strum::AsRefStr;

use crate::config::RateLimitConfig;
use crate::error::Result;

/// Who is being counted. License subjects use the salted key hash - the raw
/// key never reaches the counter table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Ip(String),
    LicenseKey(String),
}

impl Subject {
    pub fn subject_type(&self) -> &'static str {
        match self {
            Subject::Ip(_) => "ip",
            Subject::LicenseKey(_) => "license",
        }
    }

    pub fn subject_value(&self) -> &str {
        match self {
            Subject::Ip(value) => value,
            Subject::LicenseKey(value) => value,
        }
    }
}

/// Endpoints with independently tracked windows. The same subject gets a
/// separate counter per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Endpoint {
    Validate,
    Activate,
    Deactivate,
    Status,
    Batch,
}

impl RateLimitConfig {
    pub fn limit_for(&self, endpoint: Endpoint) -> u32 {
        match endpoint {
            Endpoint::Validate => self.validate_rpm,
            Endpoint::Activate => self.activate_rpm,
            Endpoint::Deactivate => self.deactivate_rpm,
            Endpoint::Status => self.status_rpm,
            Endpoint::Batch => self.batch_rpm,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitDecision {
    #[serde(skip)]
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: i64,
}

impl RateLimitDecision {
    pub fn retry_after(&self, now: i64) -> i64 {
        (self.reset_at - now).max(0)
    }
}

/// Count one request for (subject, endpoint) in the current window and
/// decide admission.
pub fn check_rate_limit(
    conn: &Connection,
    subject: &Subject,
    endpoint: Endpoint,
    max_requests: u32,
    window_seconds: u32,
) -> Result<RateLimitDecision> {
    check_rate_limit_at(
        conn,
        subject,
        endpoint,
        max_requests,
        window_seconds,
        Utc::now().timestamp(),
    )
}

/// Clock-injected variant of [`check_rate_limit`] for window-boundary tests.
pub fn check_rate_limit_at(
    conn: &Connection,
    subject: &Subject,
    endpoint: Endpoint,
    max_requests: u32,
    window_seconds: u32,
    now: i64,
) -> Result<RateLimitDecision> {
    let window = window_seconds.max(1) as i64;
    let window_start = now - now.rem_euclid(window);
    let reset_at = window_start + window;

    // Atomic increment-and-read; concurrent callers serialize on the row
    let count: i64 = conn.query_row(
        "INSERT INTO rate_limit_windows (subject_type, subject_value, endpoint, window_start, count) \
         VALUES (?1, ?2, ?3, ?4, 1) \
         ON CONFLICT(subject_type, subject_value, endpoint, window_start) \
         DO UPDATE SET count = count + 1 \
         RETURNING count",
        params![
            subject.subject_type(),
            subject.subject_value(),
            endpoint.as_ref(),
            window_start,
        ],
        |row| row.get(0),
    )?;

    Ok(RateLimitDecision {
        allowed: count <= max_requests as i64,
        limit: max_requests,
        remaining: (max_requests as i64 - count).max(0) as u32,
        reset_at,
    })
}

/// Drop windows that ended before `now`. Called by the periodic cleanup task.
pub fn purge_expired_windows(conn: &Connection, now: i64, window_seconds: u32) -> Result<usize> {
    let cutoff = now - window_seconds.max(1) as i64;
    let deleted = conn.execute(
        "DELETE FROM rate_limit_windows WHERE window_start < ?1",
        params![cutoff],
    )?;
    Ok(deleted)
}
