//! HMAC-SHA256 payload signatures.
//!
//! Outbound provider calls are signed with [`sign`]; inbound gateway
//! requests are checked with [`verify`]. Signatures are hex digests,
//! optionally prefixed with `sha256=`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature, both directions.
pub const SIGNATURE_HEADER: &str = "X-Coachflow-Signature";

/// `sha256=<hex digest>` of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against `payload`.
///
/// An empty secret disables verification.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(provided) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let sig = sign("s3cret", b"{\"user_id\":\"u1\"}");
        assert!(sig.starts_with("sha256="));
        assert!(verify("s3cret", b"{\"user_id\":\"u1\"}", &sig));
        // bare hex works too
        assert!(verify("s3cret", b"{\"user_id\":\"u1\"}", &sig["sha256=".len()..]));
    }

    #[test]
    fn tampered_payload_rejected() {
        let sig = sign("s3cret", b"original");
        assert!(!verify("s3cret", b"tampered", &sig));
        assert!(!verify("other", b"original", &sig));
    }

    #[test]
    fn garbage_signature_rejected() {
        assert!(!verify("s3cret", b"payload", "not-hex"));
        assert!(!verify("s3cret", b"payload", ""));
    }

    #[test]
    fn empty_secret_skips_validation() {
        assert!(verify("", b"anything", "whatever"));
    }
}
