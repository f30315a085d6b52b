//! Local verification of signed (JWS compact) access tokens.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};

use super::keys::KeyProvider;
use super::TokenVerifier;
use crate::errors::DenyReason;
use crate::models::claims::{ClaimChecks, RawClaims};
use crate::models::token::fingerprint;
use crate::models::verdict::VerificationResult;

const DEFAULT_CLOCK_SKEW_SECS: i64 = 30;
const MAX_CLOCK_SKEW_SECS: u64 = 86_400;

/// Verifies self-contained JWT access tokens without a network call.
///
/// Check order:
/// 1. structure (three segments, decodable header and payload) → `Malformed`
/// 2. `exp` (present, not past, with skew) → `Malformed` / `Expired`
/// 3. algorithm allow-list, key lookup, signature → `SignatureInvalid`
/// 4. `nbf`, issuer, audience → `Expired` / `InvalidIssuer` / `InvalidAudience`
///
/// Expiry is checked before the signature: an expired token is reported as
/// expired whether or not its signature holds.
#[derive(Clone)]
pub struct SignedTokenVerifier {
    keys: Arc<dyn KeyProvider>,
    algorithms: Vec<Algorithm>,
    clock_skew: Duration,
}

impl SignedTokenVerifier {
    pub fn new(keys: impl KeyProvider + 'static) -> Self {
        Self::from_arc(Arc::new(keys))
    }

    pub fn from_arc(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            keys,
            algorithms: vec![
                Algorithm::HS256,
                Algorithm::HS384,
                Algorithm::HS512,
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
                Algorithm::ES256,
                Algorithm::ES384,
                Algorithm::EdDSA,
            ],
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
        }
    }

    /// Tolerance applied to both `exp` and `nbf`.
    pub fn clock_skew(mut self, seconds: u64) -> Self {
        self.clock_skew = Duration::seconds(seconds.min(MAX_CLOCK_SKEW_SECS) as i64);
        self
    }

    /// Restrict accepted `alg` header values.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    fn signature_validation(algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        // Time, issuer and audience checks run in `RawClaims::validate` so
        // they share skew handling and failure reasons with introspection.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation
    }
}

/// Decode the payload segment without checking the signature.
fn peek_claims(token: &str) -> Option<RawClaims> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn classify(err: &jsonwebtoken::errors::Error) -> DenyReason {
    match err.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            DenyReason::Malformed
        }
        _ => DenyReason::SignatureInvalid,
    }
}

#[async_trait]
impl TokenVerifier for SignedTokenVerifier {
    async fn verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult {
        let token_id = fingerprint(token);

        let header = match jsonwebtoken::decode_header(token) {
            Ok(header) => header,
            Err(err) => {
                tracing::debug!(token = %token_id, error = %err, "undecodable token header");
                return VerificationResult::Invalid(DenyReason::Malformed);
            }
        };
        let Some(unverified) = peek_claims(token) else {
            tracing::debug!(token = %token_id, "undecodable token payload");
            return VerificationResult::Invalid(DenyReason::Malformed);
        };

        let now = Utc::now();
        if let Err(reason) = unverified.check_expiry(now, self.clock_skew) {
            tracing::debug!(token = %token_id, reason = %reason, "token rejected before signature check");
            return VerificationResult::Invalid(reason);
        }

        if !self.algorithms.contains(&header.alg) {
            tracing::debug!(token = %token_id, alg = ?header.alg, "algorithm not allowed");
            return VerificationResult::Invalid(DenyReason::SignatureInvalid);
        }

        // Unknown issuer or key id looks exactly like a bad signature to the
        // caller.
        let Some(key) = self
            .keys
            .decoding_key(unverified.iss.as_deref(), header.kid.as_deref())
            .await
        else {
            tracing::debug!(token = %token_id, kid = ?header.kid, "no key for token");
            return VerificationResult::Invalid(DenyReason::SignatureInvalid);
        };

        let validation = Self::signature_validation(header.alg);
        let claims = match jsonwebtoken::decode::<RawClaims>(token, &key, &validation) {
            Ok(data) => data.claims,
            Err(err) => {
                let reason = classify(&err);
                tracing::debug!(token = %token_id, error = %err, reason = %reason, "token signature rejected");
                return VerificationResult::Invalid(reason);
            }
        };

        let checks = ClaimChecks {
            now,
            skew: self.clock_skew,
            issuer: expected_issuer,
            audience: expected_audience,
            absent_ok: false,
        };
        claims.validate(&checks).into()
    }
}
