//! Device credential handling.
//!
//! Devices authenticate with a bearer API key issued at provisioning time
//! plus their uuid; the control plane stores only the bcrypt hash.
//! Authentication fails on a missing key, an unknown or deactivated
//! device, or a hash mismatch — all reported identically as
//! `unauthenticated` so probes learn nothing.

use axum::http::HeaderMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use talos_core::Device;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the device uuid alongside the bearer key.
pub const DEVICE_UUID_HEADER: &str = "x-device-uuid";

/// bcrypt cost for device API keys.
const BCRYPT_COST: u32 = 10;

/// Length of generated API keys.
const API_KEY_LEN: usize = 40;

/// Generates a fresh API key and its stored hash.
///
/// The plaintext key is returned exactly once, at provisioning time.
pub fn generate_api_key() -> Result<(String, String), ApiError> {
    let key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect();
    let hash = bcrypt::hash(&key, BCRYPT_COST)
        .map_err(|e| ApiError::new(talos_core::ErrorKind::Internal, e.to_string()))?;
    Ok((key, hash))
}

/// Authenticates a device request from its headers.
///
/// Expects `Authorization: Bearer <key>` and `x-device-uuid: <uuid>`.
pub async fn authenticate_device(state: &AppState, headers: &HeaderMap) -> Result<Device, ApiError> {
    let key = bearer_token(headers).ok_or_else(ApiError::unauthenticated)?;
    let uuid = headers
        .get(DEVICE_UUID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthenticated)?;

    let device = state
        .devices
        .get(uuid)
        .await
        .map_err(|_| ApiError::unauthenticated())?;

    if !device.is_active {
        return Err(ApiError::unauthenticated());
    }
    let Some(hash) = &device.api_key_hash else {
        return Err(ApiError::unauthenticated());
    };
    if !bcrypt::verify(key, hash).unwrap_or(false) {
        return Err(ApiError::unauthenticated());
    }
    Ok(device)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_generate_api_key_hash_verifies() {
        let (key, hash) = generate_api_key().unwrap();
        assert_eq!(key.len(), API_KEY_LEN);
        assert!(bcrypt::verify(&key, &hash).unwrap());
        assert!(!bcrypt::verify("not-the-key", &hash).unwrap());
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let (a, _) = generate_api_key().unwrap();
        let (b, _) = generate_api_key().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(bearer_token(&headers).is_none());
    }
}
