//! API key authentication middleware.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::handlers::ErrorResponse;
use super::state::ApiState;

/// Header name for API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Reject requests whose `X-API-Key` does not hash to the configured value.
pub async fn require_api_key(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // No key configured: local development mode
    let Some(expected_hash) = state.api_key_hash.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let error = match provided {
        Some(key) if hash_api_key(key).eq_ignore_ascii_case(expected_hash.trim()) => {
            return next.run(request).await;
        }
        Some(_) => "Invalid API key".to_string(),
        None => format!("Missing {} header", API_KEY_HEADER),
    };

    debug!("Rejected {} {}: {}", request.method(), request.uri().path(), error);
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse { ok: false, error }),
    )
        .into_response()
}

/// Hash an API key using SHA-256.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// Generate a random API key: 32 hex chars (128 bits).
///
/// Entropy comes from the per-process random hasher keys, the clock and the
/// process id, folded through SHA-256.
pub fn generate_api_key() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    for i in 0u64..4 {
        hasher.update(RandomState::new().hash_one(i).to_le_bytes());
    }

    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_api_key() {
        let hash = hash_api_key("segreto");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("segreto"));
        assert_ne!(hash, hash_api_key("Segreto"));
    }

    #[test]
    fn test_generated_keys_are_hex_and_distinct() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
