//! Shared request utilities.

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Extract client IP address and user-agent from request headers.
///
/// Tries `x-forwarded-for` first (for proxied requests), then `x-real-ip`.
pub fn extract_request_info(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    (ip, user_agent)
}

/// Resolve the client IP for rate limiting and audit entries: proxy headers
/// win, the socket peer address is the fallback.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let (header_ip, _) = extract_request_info(headers);
    header_ip.or_else(|| peer.map(|addr| addr.ip().to_string()))
}
