//! HMAC-SHA256 payload signing for outbound webhook requests.
//!
//! The signature covers the exact payload bytes that go on the wire — the
//! payload is serialized once at enqueue time and never re-serialized, so
//! receivers can verify against the body verbatim.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature on delivery requests.
pub const SIGNATURE_HEADER: &str = "X-Codessa-Signature";

/// Sign payload bytes with a webhook's shared secret.
///
/// Returns the header value: `sha256=` followed by the lowercase hex MAC.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature header against the payload.
pub fn verify(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let expected = sign(secret, payload);
    expected.as_bytes().ct_eq(signature_header.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hmac_vector() {
        // RFC-style reference vector for HMAC-SHA256
        let sig = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_shape() {
        let sig = sign("whsec_abc", b"{\"event_kind\":\"job.completed\"}");
        let hex_part = sig.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sign_is_deterministic_and_keyed() {
        let payload = b"{\"a\":1}";
        assert_eq!(sign("s1", payload), sign("s1", payload));
        assert_ne!(sign("s1", payload), sign("s2", payload));
        assert_ne!(sign("s1", payload), sign("s1", b"{\"a\":2}"));
    }

    #[test]
    fn verify_accepts_matching_and_rejects_tampered() {
        let payload = b"{\"event_kind\":\"job.failed\"}";
        let sig = sign("whsec_abc", payload);
        assert!(verify("whsec_abc", payload, &sig));
        assert!(!verify("whsec_abc", b"{\"event_kind\":\"job.completed\"}", &sig));
        assert!(!verify("whsec_other", payload, &sig));
        assert!(!verify("whsec_abc", payload, "sha256=deadbeef"));
    }
}
