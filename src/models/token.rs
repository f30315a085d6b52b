use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// A bearer credential pulled out of a request.
///
/// Lives for one request. The raw value is wiped on drop and never shows up
/// in `Debug` output; log [`BearerToken::fingerprint`] instead.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Three non-empty dot-separated segments, i.e. a compact JWS.
    pub fn looks_signed(&self) -> bool {
        let mut segments = self.0.split('.');
        let shaped = segments.by_ref().take(3).filter(|s| !s.is_empty()).count() == 3;
        shaped && segments.next().is_none()
    }

    /// Short, non-reversible identifier for logs.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken({})", self.fingerprint())
    }
}

impl Drop for BearerToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Hex SHA-256 of a token.
pub(crate) fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// First 12 hex chars of the token digest.
pub(crate) fn fingerprint(token: &str) -> String {
    let mut digest = digest(token);
    digest.truncate(12);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_signed() {
        assert!(BearerToken::new("aaa.bbb.ccc").looks_signed());
        assert!(!BearerToken::new("opaque-token-value").looks_signed());
        assert!(!BearerToken::new("aaa.bbb").looks_signed());
        assert!(!BearerToken::new("aaa..ccc").looks_signed());
        assert!(!BearerToken::new("aaa.bbb.ccc.ddd").looks_signed());
    }

    #[test]
    fn test_debug_hides_raw_value() {
        let token = BearerToken::new("super-secret-token");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains(&token.fingerprint()));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 12);
    }
}
