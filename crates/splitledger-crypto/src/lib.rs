//! SplitLedger Crypto - Webhook signature verification
//!
//! The payment processor signs every webhook with HMAC-SHA256 over the
//! exact raw request body using a shared secret, base64 encoded. Features:
//! - Verification over raw bytes (never a re-serialized body)
//! - Constant-time signature comparison
//! - Fail-closed: a missing secret is a configuration error, not a pass

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook was refused before reaching the allocation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No signing secret configured; the request must not be processed
    #[error("Webhook signing secret is not configured")]
    MissingSecret,

    #[error("Missing webhook signature header")]
    MissingSignature,

    #[error("Invalid webhook signature")]
    InvalidSignature,
}

/// Compute the base64 HMAC-SHA256 signature of a raw body
pub fn sign(raw_body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(raw_body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verify a webhook signature.
///
/// Returns `false` for an empty header or secret and for any malformed
/// input; never panics.
pub fn verify(raw_body: &[u8], signature_header: &str, shared_secret: &str) -> bool {
    let provided = signature_header.trim();
    if provided.is_empty() || shared_secret.is_empty() {
        return false;
    }

    let expected = sign(raw_body, shared_secret);
    if expected.is_empty() {
        return false;
    }

    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Verifier bound to the configured processor secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
}

impl WebhookVerifier {
    /// Create a verifier; an empty secret counts as unset
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Whether a signing secret is configured
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Check a request body against its signature header
    pub fn check(&self, raw_body: &[u8], signature_header: Option<&str>) -> Result<(), SignatureError> {
        let secret = self.secret.as_deref().ok_or(SignatureError::MissingSecret)?;
        let header = signature_header
            .filter(|h| !h.trim().is_empty())
            .ok_or(SignatureError::MissingSignature)?;

        if verify(raw_body, header, secret) {
            Ok(())
        } else {
            Err(SignatureError::InvalidSignature)
        }
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"type":"payment.updated","data":{"object":{}}}"#;

    #[test]
    fn test_sign_and_verify() {
        let signature = sign(BODY, "whsec_test");
        assert!(verify(BODY, &signature, "whsec_test"));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2, base64 encoded
        let signature = sign(b"what do ya want for nothing?", "Jefe");
        assert_eq!(signature, "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM=");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signature = sign(BODY, "attacker-secret");
        assert!(!verify(BODY, &signature, "whsec_test"));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign(BODY, "whsec_test");
        let mut tampered = BODY.to_vec();
        tampered.push(b' ');
        assert!(!verify(&tampered, &signature, "whsec_test"));
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert!(!verify(BODY, "", "whsec_test"));
        assert!(!verify(BODY, "not-base64-at-all", "whsec_test"));
        assert!(!verify(BODY, &sign(BODY, ""), ""));
    }

    #[test]
    fn test_header_whitespace_tolerated() {
        let signature = format!(" {} ", sign(BODY, "whsec_test"));
        assert!(verify(BODY, &signature, "whsec_test"));
    }

    #[test]
    fn test_verifier_fails_closed_without_secret() {
        let verifier = WebhookVerifier::new(Some(String::new()));
        assert!(!verifier.has_secret());
        let signature = sign(BODY, "");
        assert_eq!(
            verifier.check(BODY, Some(&signature)),
            Err(SignatureError::MissingSecret)
        );
    }

    #[test]
    fn test_verifier_distinguishes_failures() {
        let verifier = WebhookVerifier::new(Some("whsec_test".to_string()));
        assert_eq!(verifier.check(BODY, None), Err(SignatureError::MissingSignature));
        assert_eq!(verifier.check(BODY, Some("  ")), Err(SignatureError::MissingSignature));
        assert_eq!(
            verifier.check(BODY, Some("AAAA")),
            Err(SignatureError::InvalidSignature)
        );
        assert!(verifier.check(BODY, Some(&sign(BODY, "whsec_test"))).is_ok());
    }

    #[test]
    fn test_debug_masks_secret() {
        let verifier = WebhookVerifier::new(Some("whsec_test".to_string()));
        assert!(!format!("{:?}", verifier).contains("whsec_test"));
    }
}
