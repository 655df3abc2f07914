//! Bearer-token verification.
//!
//! Users are authenticated by the surrounding application. The pipeline
//! only consumes its tokens: `base64url(user_id|expires_unix_secs|hex(hmac))`,
//! signed with HMAC-SHA256 over `user_id|expires`.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Authenticated caller, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

/// Issues and verifies signed bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            ttl,
        }
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC key length is valid");
        mac.update(payload.as_bytes());
        mac
    }

    /// Mints a token for `user_id` valid for the configured TTL.
    pub fn issue_token(&self, user_id: &str) -> String {
        self.issue_token_at(user_id, unix_now() + self.ttl.as_secs())
    }

    pub fn issue_token_at(&self, user_id: &str, expires: u64) -> String {
        let payload = format!("{}|{}", user_id, expires);
        let signature = self.mac(&payload).finalize().into_bytes();
        let token = format!("{}|{}", payload, hex::encode(signature));
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token.as_bytes())
    }

    /// Returns the user id if the token is authentic and unexpired.
    pub fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim().as_bytes())
            .map_err(|_| AuthError::Malformed)?;
        let token = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;

        // Split from the right: user ids may themselves contain '|'.
        let mut parts = token.rsplitn(3, '|');
        let (Some(sig_hex), Some(expires_str), Some(user_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        if user_id.is_empty() {
            return Err(AuthError::Malformed);
        }

        let provided = hex::decode(sig_hex).map_err(|_| AuthError::Malformed)?;
        self.mac(&format!("{}|{}", user_id, expires_str))
            .verify_slice(&provided)
            .map_err(|_| AuthError::BadSignature)?;

        let expires: u64 = expires_str.parse().map_err(|_| AuthError::Malformed)?;
        if unix_now() > expires {
            return Err(AuthError::Expired);
        }
        Ok(user_id.to_string())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware rejecting requests without a valid bearer token.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let token = bearer_token(&req).ok_or(StatusCode::UNAUTHORIZED)?;
    let user_id = state.tokens.verify_token(token).map_err(|e| {
        tracing::debug!("rejected bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}
