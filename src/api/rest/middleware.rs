//! Request-logging and auth middleware for the narrow REST surface.
//!
//! Plain `axum::middleware::from_fn` functions wrapping `next.run`, logging
//! via `tracing` — job/tick counts already live in the ledger, so there is
//! no separate metrics-struct bookkeeping here.

use super::types::{AdminPrincipal, AppState};
use crate::error::OrchestratorError;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use uuid::Uuid;

pub async fn request_logger_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis(),
        "request completed"
    );
    response
}

/// Enforces `Authorization: Bearer <tick_shared_secret>` on the tick route.
pub async fn tick_auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, OrchestratorError> {
    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, &state.config.tick_shared_secret) => Ok(next.run(req).await),
        _ => Err(OrchestratorError::AuthFailure("invalid or missing tick shared secret".into())),
    }
}

/// Extracts the acting principal for admin routes from
/// `X-Actor-Id`/`X-Super-Admin` headers and rejects anyone lacking the
/// super-admin flag. Every admin operation requires a principal carrying
/// that flag.
pub async fn admin_auth_middleware(req: Request<Body>, next: Next) -> Result<Response, OrchestratorError> {
    let headers = req.headers();
    let is_super_admin = headers
        .get("x-super-admin")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !is_super_admin {
        return Err(OrchestratorError::AuthFailure("super-admin flag required".into()));
    }
    let actor_user_id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| OrchestratorError::AuthFailure("X-Actor-Id header missing or malformed".into()))?;

    let mut req = req;
    req.extensions_mut().insert(AdminPrincipal { actor_user_id });
    Ok(next.run(req).await)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("short", "much-longer"));
    }

    #[test]
    fn constant_time_eq_matches_identical_strings() {
        assert!(constant_time_eq("same-secret", "same-secret"));
    }
}
