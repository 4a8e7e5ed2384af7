//! # Authentication Module
//!
//! Optional bearer-token authentication.
//!
//! `TRELLIS_API_KEY`, when set and non-empty, is required on every request
//! except `/health`:
//!
//! ```text
//! Authorization: Bearer <your-api-key>
//! ```

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

// =============================================================================
// API KEY AUTHENTICATION
// =============================================================================

/// The configured API key, `None` when authentication is disabled.
pub fn get_api_key_from_env() -> Option<String> {
    std::env::var("TRELLIS_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

/// Compare keys in time independent of where they first differ.
///
/// Both sides are padded to a common length so the comparison always
/// covers the same number of bytes.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    let max_len = provided.len().max(expected.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided.len()].copy_from_slice(provided);
    padded_expected[..expected.len()].copy_from_slice(expected);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided.len() == expected.len()
}

pub async fn api_key_auth_middleware(
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let Some(expected) = get_api_key_from_env() else {
        return Ok(next.run(request).await);
    };

    // load balancers probe without credentials
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if keys_match(key.as_bytes(), expected.as_bytes()) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(event = "auth_failure", reason = "invalid_api_key", "authentication failed");
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
        None => {
            tracing::warn!(
                event = "auth_failure",
                reason = "missing_bearer_token",
                "authentication failed"
            );
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(keys_match(b"secret", b"secret"));
    }

    #[test]
    fn prefix_and_padding_do_not_match() {
        assert!(!keys_match(b"secre", b"secret"));
        assert!(!keys_match(b"secret\0", b"secret"));
        assert!(!keys_match(b"", b"secret"));
    }
}
