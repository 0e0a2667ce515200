//! API-key validation for the WebSocket upgrade and the service-only
//! HTTP endpoints.

use std::collections::HashMap;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::auth::jwt::JwtVerifier;
use crate::config::Config;
use crate::error::ApiError;
use crate::AppState;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "apikey";

/// Roles a JWT API key may carry.
pub const ANON_ROLE: &str = "anon";
pub const SERVICE_ROLE: &str = "service_role";

/// Which of the two accepted API keys a request presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Anon,
    Service,
}

/// Pull the API key from the `apikey` query parameter, the `apikey` header,
/// or an `Authorization: Bearer` header, in that order.
pub fn extract_api_key(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(key) = query.get(API_KEY_HEADER).filter(|k| !k.is_empty()) {
        return Some(key.clone());
    }
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Accept a key that equals one of the configured keys, or a valid JWT whose
/// `role` is `anon` or `service_role`.
pub fn validate_api_key(
    key: &str,
    config: &Config,
    verifier: &JwtVerifier,
) -> Result<KeyRole, ApiError> {
    if key == config.service_key {
        return Ok(KeyRole::Service);
    }
    if key == config.anon_key {
        return Ok(KeyRole::Anon);
    }

    let claims = verifier.parse(key).map_err(|e| {
        tracing::debug!(error = %e, "api key is not a valid jwt");
        ApiError::unauthorized("Invalid API key")
    })?;

    match claims.role() {
        Some(SERVICE_ROLE) => Ok(KeyRole::Service),
        Some(ANON_ROLE) => Ok(KeyRole::Anon),
        _ => Err(ApiError::unauthorized("Invalid API key")),
    }
}

/// Extractor that only admits requests presenting the service key.
#[derive(Debug, Clone, Copy)]
pub struct ServiceKey;

impl FromRequestParts<AppState> for ServiceKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map_err(|_| ApiError::bad_request("Malformed query string"))?;
        let key = extract_api_key(&query, &parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Missing API key"))?;

        match validate_api_key(&key, &state.config, state.realtime.verifier())? {
            KeyRole::Service => Ok(ServiceKey),
            KeyRole::Anon => Err(ApiError::forbidden("Service key required")),
        }
    }
}
