use crate::errors::DenyReason;
use crate::models::claims::TokenClaims;

/// Outcome of verifying one token.
///
/// `TransientError` means the outcome could not be determined (e.g. the
/// introspection endpoint was unreachable), as opposed to a definitive
/// rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Valid(TokenClaims),
    Invalid(DenyReason),
    TransientError(String),
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid(_))
    }

    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            VerificationResult::Valid(claims) => Some(claims),
            _ => None,
        }
    }
}

impl From<Result<TokenClaims, DenyReason>> for VerificationResult {
    fn from(result: Result<TokenClaims, DenyReason>) -> Self {
        match result {
            Ok(claims) => VerificationResult::Valid(claims),
            Err(reason) => VerificationResult::Invalid(reason),
        }
    }
}

/// Final answer for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationVerdict {
    Allow(TokenClaims),
    Deny(DenyReason),
}

impl AuthorizationVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationVerdict::Allow(_))
    }

    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            AuthorizationVerdict::Allow(claims) => Some(claims),
            AuthorizationVerdict::Deny(_) => None,
        }
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            AuthorizationVerdict::Allow(_) => None,
            AuthorizationVerdict::Deny(reason) => Some(*reason),
        }
    }
}
