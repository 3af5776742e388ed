//! Per-device PIN authentication.
//!
//! Devices may carry an optional 6-digit numeric PIN. When a PIN is set,
//! device-scoped HTTP routes require `Authorization: Bearer <pin>`; when it
//! is not, requests pass unauthenticated. PINs are stored as SHA-256 digests
//! and compared in constant time.

use sha2::{Digest, Sha256};

/// Returns `true` for a well-formed PIN: exactly 6 ASCII digits.
#[must_use]
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == 6 && pin.chars().all(|c| c.is_ascii_digit())
}

/// SHA-256 digest of a PIN, the only form the registry stores.
#[must_use]
pub fn pin_digest(pin: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

/// Extract the credential from an `Authorization: Bearer <pin>` header value.
#[must_use]
pub fn bearer_token(auth_header: Option<&str>) -> Option<&str> {
    match auth_header {
        Some(h) if h.starts_with("Bearer ") => Some(&h[7..]),
        _ => None,
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the secret length from response
/// times.
#[must_use]
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected length to avoid a timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_format_is_six_ascii_digits() {
        assert!(is_valid_pin("123456"));
        assert!(is_valid_pin("000000"));
        assert!(!is_valid_pin("12345"));
        assert!(!is_valid_pin("1234567"));
        assert!(!is_valid_pin("12345a"));
        assert!(!is_valid_pin("１２３４５６")); // full-width digits
        assert!(!is_valid_pin(""));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token(Some("Bearer 123456")), Some("123456"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("123456")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(pin_digest("123456"), pin_digest("123456"));
        assert_ne!(pin_digest("123456"), pin_digest("654321"));
    }
}
