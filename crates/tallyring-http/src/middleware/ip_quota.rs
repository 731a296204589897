//! Per-IP quota middleware.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

/// Extracts the client IP from the request.
pub fn extract_ip(req: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    // X-Forwarded-For takes priority when a trusted proxy sets it
    if trust_forwarded_for
        && let Some(xff) = req.headers().get("x-forwarded-for")
        && let Ok(s) = xff.to_str()
        && let Some(first) = s.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    // Fallback to ConnectInfo (direct connection)
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

/// Quota middleware. Returns 429 and skips the handler when the client IP
/// is over quota. Requests without a resolvable IP pass through.
pub async fn ip_quota_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.quota().is_enabled() {
        return Ok(next.run(req).await);
    }

    if let Some(ip) = extract_ip(&req, state.trust_forwarded_for())
        && !state.check_client(&ip.to_string()).is_allowed()
    {
        return Err(ApiError::TooManyRequests);
    }

    Ok(next.run(req).await)
}
