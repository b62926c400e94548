// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token extraction for the browser-facing API.
//!
//! Each browser session carries its own distinct Gateway token, so there is
//! nothing to compare against locally. A request either carries a token
//! (and the Gateway decides if it's good) or it doesn't (401 immediately).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::GatewayError;

/// The bearer token extracted from `Authorization: Bearer <token>`.
pub struct BearerToken(pub String);

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthorized)?;

        let token = header.strip_prefix("Bearer ").ok_or(GatewayError::Unauthorized)?;
        if token.is_empty() {
            return Err(GatewayError::Unauthorized);
        }
        Ok(BearerToken(token.to_owned()))
    }
}

/// A short, log-safe prefix of a bearer token. Tokens are credentials and
/// must never be logged in full.
pub fn redact(token: &str) -> String {
    token.chars().take(8).collect()
}
