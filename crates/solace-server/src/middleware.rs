use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::bearer_token;
use crate::ratelimit::{RateDecision, RateLimitCategory};
use crate::AppState;

/// Maps a request onto its budget category. `None` means unmetered.
pub fn categorize(method: &Method, path: &str) -> Option<RateLimitCategory> {
    if path == "/health" {
        return None;
    }
    if path == "/ws" || path.starts_with("/api/auth") {
        return Some(RateLimitCategory::Auth);
    }
    if path.starts_with("/api/assessments") {
        return Some(RateLimitCategory::Assessment);
    }
    if method == Method::POST && path.starts_with("/api/conversations/") {
        if path.ends_with("/messages") {
            return Some(RateLimitCategory::Message);
        }
        if path.ends_with("/audio") {
            return Some(RateLimitCategory::Voice);
        }
    }
    Some(RateLimitCategory::Api)
}

/// Writes `X-RateLimit-*` metadata. `reset` is in epoch seconds.
pub fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_at.div_euclid(1000).max(0) as u64),
    );
}

/// Rate limiting middleware.
///
/// Authenticated callers are keyed by user id, everyone else by IP. Every
/// metered response carries the rate metadata; a denied request is answered
/// with 429 before any handler runs.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let Some(category) = categorize(req.method(), req.uri().path()) else {
        return Ok(next.run(req).await);
    };

    let user = bearer_token(&req).and_then(|t| state.tokens.verify_token(t).ok());
    let identifier = if let Some(user_id) = user {
        format!("user:{}", user_id)
    } else if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        format!("ip:{}", addr.ip())
    } else {
        // ConnectInfo is missing only when the router is served without
        // `into_make_service_with_connect_info`.
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let decision = state.rate_limiter.check(category, &identifier).await;
    if !decision.allowed {
        let retry_after = decision.retry_after_secs(crate::now_ms());
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "too many requests",
                "limit": decision.limit,
                "remaining": decision.remaining,
                "resetAt": decision.reset_at,
            })),
        )
            .into_response();
        apply_rate_headers(response.headers_mut(), &decision);
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(retry_after),
        );
        return Ok(response);
    }

    let mut response = next.run(req).await;
    apply_rate_headers(response.headers_mut(), &decision);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_map_to_categories() {
        assert_eq!(categorize(&Method::GET, "/health"), None);
        assert_eq!(categorize(&Method::GET, "/ws"), Some(RateLimitCategory::Auth));
        assert_eq!(
            categorize(&Method::POST, "/api/conversations/c1/messages"),
            Some(RateLimitCategory::Message)
        );
        assert_eq!(
            categorize(&Method::POST, "/api/conversations/c1/audio"),
            Some(RateLimitCategory::Voice)
        );
        assert_eq!(
            categorize(&Method::GET, "/api/conversations/c1/messages"),
            Some(RateLimitCategory::Api)
        );
        assert_eq!(categorize(&Method::GET, "/api/queues"), Some(RateLimitCategory::Api));
    }

    #[test]
    fn reset_header_is_in_seconds() {
        let mut headers = HeaderMap::new();
        apply_rate_headers(
            &mut headers,
            &RateDecision {
                allowed: true,
                limit: 30,
                remaining: 29,
                reset_at: 1_700_000_060_000,
            },
        );
        assert_eq!(headers["x-ratelimit-limit"], "30");
        assert_eq!(headers["x-ratelimit-remaining"], "29");
        assert_eq!(headers["x-ratelimit-reset"], "1700000060");
    }
}
