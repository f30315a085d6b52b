use crate::errors::DenyReason;
use crate::models::claims::TokenClaims;
use crate::models::policy::{ScopeMatch, ScopePolicy};
use crate::models::verdict::AuthorizationVerdict;

/// Scope-based access control.
///
/// Compares the scopes an endpoint requires against the scopes a token was
/// granted. Exact string matches only: no wildcards, no prefix matching.
/// Deterministic, no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeAuthorizer;

impl ScopeAuthorizer {
    pub fn new() -> Self {
        Self
    }

    /// `all_of`: every required scope must be granted (extra granted scopes
    /// are fine). `any_of`: at least one. An empty policy always allows.
    pub fn authorize(&self, claims: TokenClaims, policy: &ScopePolicy) -> AuthorizationVerdict {
        if check_scopes(&claims, policy) {
            AuthorizationVerdict::Allow(claims)
        } else {
            tracing::debug!(
                required = ?policy.scopes(),
                missing = ?missing_scopes(&claims, policy),
                "scope check failed"
            );
            AuthorizationVerdict::Deny(DenyReason::InsufficientScope)
        }
    }
}

/// Check a token's scopes against a policy.
pub fn check_scopes(claims: &TokenClaims, policy: &ScopePolicy) -> bool {
    if policy.is_empty() {
        return true;
    }
    match policy.mode() {
        ScopeMatch::AllOf => policy.scopes().iter().all(|s| claims.has_scope(s)),
        ScopeMatch::AnyOf => policy.scopes().iter().any(|s| claims.has_scope(s)),
    }
}

/// Required scopes the token lacks, in policy order.
pub fn missing_scopes<'a>(claims: &TokenClaims, policy: &'a ScopePolicy) -> Vec<&'a str> {
    policy
        .scopes()
        .iter()
        .filter(|s| !claims.has_scope(s))
        .map(String::as_str)
        .collect()
}
