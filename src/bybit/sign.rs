//! Request and challenge signing
//!
//! Bybit v5 signs REST requests over the sorted query string and websocket
//! auth over a `GET/realtime{expires}` challenge, both HMAC-SHA256 hex.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `payload`, hex-encoded.
pub fn sign_payload(api_secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the canonical sorted query string. BTreeMap keeps keys ordered,
/// which is what the signature is computed over.
pub fn query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// The websocket auth challenge for a given expiry timestamp (millis).
pub fn ws_auth_challenge(api_secret: &str, expires: i64) -> String {
    sign_payload(api_secret, &format!("GET/realtime{expires}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_is_sorted() {
        let mut params = BTreeMap::new();
        params.insert("timestamp".to_string(), "123".to_string());
        params.insert("api_key".to_string(), "abc".to_string());
        params.insert("symbol".to_string(), "USDCUSDT".to_string());
        assert_eq!(
            query_string(&params),
            "api_key=abc&symbol=USDCUSDT&timestamp=123"
        );
    }

    #[test]
    fn signature_is_hex_sha256() {
        let sig = sign_payload("secret", "GET/realtime1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable for fixed inputs
        assert_eq!(sig, sign_payload("secret", "GET/realtime1700000000000"));
    }

    #[test]
    fn challenge_depends_on_expiry() {
        let a = ws_auth_challenge("secret", 1);
        let b = ws_auth_challenge("secret", 2);
        assert_ne!(a, b);
    }
}
