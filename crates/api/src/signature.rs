//! Webhook signature verification.
//!
//! GitHub signs the raw request body with HMAC-SHA256 and sends the result
//! as `X-Hub-Signature-256: sha256=<hex>`. Stripe signs `{timestamp}.{body}`
//! and sends `Stripe-Signature: t=<ts>,v1=<hex>[,v1=...]` with a freshness
//! window. Both comparisons are constant-time. Stripe verification is done
//! here rather than through the stripe crate's typed event constructor,
//! which rejects event types it cannot deserialize; the router must instead
//! acknowledge those as unhandled.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use gitshop_core::{ShopError, ShopResult};

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], header: &str) -> ShopResult<()> {
    let provided = header
        .strip_prefix("sha256=")
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(ShopError::WebhookSignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ShopError::WebhookSignatureInvalid)?;
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(&provided).into() {
        Ok(())
    } else {
        Err(ShopError::WebhookSignatureInvalid)
    }
}

/// Maximum accepted age of a Stripe signature timestamp.
pub const STRIPE_SIGNATURE_TOLERANCE: Duration = Duration::from_secs(300);

pub fn verify_stripe_signature(secret: &str, payload: &[u8], header: &str) -> ShopResult<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    verify_stripe_signature_at(secret, payload, header, now)
}

fn verify_stripe_signature_at(
    secret: &str,
    payload: &[u8],
    header: &str,
    now_unix: i64,
) -> ShopResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(digest) = hex::decode(value) {
                    candidates.push(digest);
                }
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(ShopError::WebhookSignatureInvalid)?;
    if candidates.is_empty() {
        return Err(ShopError::WebhookSignatureInvalid);
    }
    if (now_unix - timestamp).unsigned_abs() > STRIPE_SIGNATURE_TOLERANCE.as_secs() {
        return Err(ShopError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ShopError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    if candidates
        .iter()
        .any(|candidate| bool::from(expected.ct_eq(candidate)))
    {
        Ok(())
    } else {
        Err(ShopError::WebhookSignatureInvalid)
    }
}

/// Constant-time token comparison for the admin endpoints.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let header = sign("s3cret", b"{\"zen\":\"ship it\"}");
        verify_github_signature("s3cret", b"{\"zen\":\"ship it\"}", &header).unwrap();
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign("s3cret", b"original");
        let err = verify_github_signature("s3cret", b"tampered", &header).unwrap_err();
        assert!(matches!(err, ShopError::WebhookSignatureInvalid));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign("other", b"payload");
        assert!(verify_github_signature("s3cret", b"payload", &header).is_err());
    }

    #[test]
    fn malformed_header_fails() {
        assert!(verify_github_signature("s", b"p", "sha1=abcd").is_err());
        assert!(verify_github_signature("s", b"p", "sha256=nothex").is_err());
        assert!(verify_github_signature("s", b"p", "").is_err());
    }

    fn stripe_sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn stripe_signature_within_tolerance_passes() {
        let header = stripe_sign("whsec_x", 1_000_000, b"{}");
        verify_stripe_signature_at("whsec_x", b"{}", &header, 1_000_100).unwrap();
    }

    #[test]
    fn stripe_signature_outside_tolerance_fails() {
        let header = stripe_sign("whsec_x", 1_000_000, b"{}");
        let err = verify_stripe_signature_at("whsec_x", b"{}", &header, 1_000_000 + 301)
            .unwrap_err();
        assert!(matches!(err, ShopError::WebhookSignatureInvalid));
    }

    #[test]
    fn stripe_signature_accepts_any_matching_v1() {
        let valid = stripe_sign("whsec_x", 5_000, b"body");
        // Prepend a stale candidate; the second v1 still matches.
        let header = format!("t=5000,v1=00ff,{}", valid.split_once(',').unwrap().1);
        verify_stripe_signature_at("whsec_x", b"body", &header, 5_000).unwrap();
    }

    #[test]
    fn stripe_signature_wrong_secret_fails() {
        let header = stripe_sign("whsec_other", 5_000, b"body");
        assert!(verify_stripe_signature_at("whsec_x", b"body", &header, 5_000).is_err());
    }

    #[test]
    fn stripe_header_without_timestamp_fails() {
        assert!(verify_stripe_signature_at("s", b"p", "v1=abcd", 0).is_err());
        assert!(verify_stripe_signature_at("s", b"p", "t=12", 12).is_err());
        assert!(verify_stripe_signature_at("s", b"p", "", 0).is_err());
    }

    #[test]
    fn admin_token_comparison() {
        assert!(token_matches("tok", "tok"));
        assert!(!token_matches("tok", "tok2"));
        assert!(!token_matches("", "tok"));
    }
}
