//! The decision facade: extract → verify (signed, or introspected through
//! the cache) → authorize.

use std::sync::Arc;

use crate::cache::IntrospectionCache;
use crate::config::GuardConfig;
use crate::errors::{DenyReason, GuardError};
use crate::middleware::extract::{RequestMetadata, TokenExtractor};
use crate::middleware::scope::ScopeAuthorizer;
use crate::models::policy::ScopePolicy;
use crate::models::token::BearerToken;
use crate::models::verdict::{AuthorizationVerdict, VerificationResult};
use crate::verifier::discovery::{discover, AuthorizationServerMetadata};
use crate::verifier::introspection::{ClientAuthMethod, IntrospectionVerifier};
use crate::verifier::keys::{JwksKeyProvider, KeyProvider, StaticKeyProvider};
use crate::verifier::signed::SignedTokenVerifier;
use crate::verifier::TokenVerifier;

/// Per-request authorization decisions.
///
/// Construct once per process and share (it is cheap to clone). Holds at
/// least one verifier:
/// - signed only: JWT-shaped tokens are verified locally, anything else is
///   `Malformed`
/// - opaque only: every token goes to the opaque verifier
/// - both: JWT-shaped tokens are verified locally, the rest go to the opaque
///   verifier
#[derive(Clone)]
pub struct Guard {
    extractor: TokenExtractor,
    authorizer: ScopeAuthorizer,
    signed: Option<Arc<dyn TokenVerifier>>,
    opaque: Option<Arc<dyn TokenVerifier>>,
    cache: Option<IntrospectionCache>,
    expected_issuer: Option<String>,
    expected_audience: Option<String>,
}

impl Guard {
    pub fn builder() -> GuardBuilder {
        GuardBuilder::default()
    }

    /// Build a guard from configuration, running discovery and fetching
    /// key material as needed.
    pub async fn from_config(config: &GuardConfig) -> Result<Self, GuardError> {
        config.validate().map_err(|e| GuardError::Config(e.to_string()))?;
        // Per-request timeouts on JWKS and introspection calls override this;
        // it bounds discovery.
        let client = reqwest::Client::builder()
            .timeout(config.jwks_timeout().max(config.introspection_timeout()))
            .build()?;
        let strategy = config.verification_strategy;

        let needs_discovery = (strategy.uses_signed() && config.jwks_uri.is_none() && config.hs256_secret.is_none())
            || (strategy.uses_introspection() && config.introspection_endpoint.is_none());
        let metadata = match (&config.issuer, needs_discovery) {
            (Some(issuer), true) => Some(discover(&client, issuer).await?),
            _ => None,
        };

        let mut builder = Guard::builder()
            .extractor(
                TokenExtractor::new()
                    .allow_query(config.allow_query_token)
                    .allow_form(config.allow_form_token),
            )
            .expected_issuer_opt(config.effective_issuer().map(String::from))
            .expected_audience_opt(config.expected_audience.clone());

        if strategy.uses_signed() {
            let keys = signed_keys(&client, config, metadata.as_ref()).await?;
            builder = builder.signed_verifier(SignedTokenVerifier::from_arc(keys).clock_skew(config.clock_skew_seconds));
        }

        if strategy.uses_introspection() {
            let verifier = introspection_verifier(&client, config, metadata.as_ref())?;
            builder = builder.introspection_cache(IntrospectionCache::new(verifier, config.cache_settings()));
        }

        tracing::info!(
            strategy = ?strategy,
            expected_issuer = ?config.effective_issuer(),
            expected_audience = ?config.expected_audience,
            fail_open = config.fail_open_on_transient_error,
            "OAuth2 guard configured"
        );
        if config.fail_open_on_transient_error {
            tracing::warn!("fail-open on transient introspection errors is enabled");
        }

        builder.build()
    }

    /// Decide one request.
    ///
    /// Never fails: every problem with the request or its token becomes a
    /// `Deny` with the reason. Apart from cache reads and writes, calling
    /// this twice with the same input yields the same verdict.
    pub async fn decide(&self, request: &RequestMetadata, policy: &ScopePolicy) -> AuthorizationVerdict {
        match self.extractor.extract(request) {
            Ok(token) => self.decide_token(&token, policy).await,
            Err(reason) => {
                tracing::debug!(reason = %reason, "no usable bearer credential");
                AuthorizationVerdict::Deny(reason)
            }
        }
    }

    /// Decide for an already extracted token.
    pub async fn decide_token(&self, token: &BearerToken, policy: &ScopePolicy) -> AuthorizationVerdict {
        let Some(verifier) = self.route(token) else {
            tracing::debug!(token = %token.fingerprint(), "opaque token but no introspection configured");
            return AuthorizationVerdict::Deny(DenyReason::Malformed);
        };

        let result = verifier
            .verify(
                token.as_str(),
                self.expected_issuer.as_deref(),
                self.expected_audience.as_deref(),
            )
            .await;

        match result {
            VerificationResult::Valid(claims) => {
                let verdict = self.authorizer.authorize(claims, policy);
                if verdict.is_allowed() {
                    tracing::debug!(token = %token.fingerprint(), "request authorized");
                }
                verdict
            }
            VerificationResult::Invalid(reason) => {
                tracing::debug!(token = %token.fingerprint(), reason = %reason, "token rejected");
                AuthorizationVerdict::Deny(reason)
            }
            VerificationResult::TransientError(reason) => {
                tracing::warn!(token = %token.fingerprint(), reason = %reason, "token could not be verified");
                AuthorizationVerdict::Deny(DenyReason::UpstreamUnavailable)
            }
        }
    }

    /// Forget cached introspection results for `token` (out-of-band
    /// revocation). Returns the number of entries removed.
    pub fn invalidate(&self, token: &str) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.invalidate(token))
    }

    pub fn extractor(&self) -> &TokenExtractor {
        &self.extractor
    }

    pub fn cache(&self) -> Option<&IntrospectionCache> {
        self.cache.as_ref()
    }

    fn route(&self, token: &BearerToken) -> Option<&Arc<dyn TokenVerifier>> {
        match (&self.signed, &self.opaque) {
            (Some(signed), _) if token.looks_signed() => Some(signed),
            (_, Some(opaque)) => Some(opaque),
            _ => None,
        }
    }
}

async fn signed_keys(
    client: &reqwest::Client,
    config: &GuardConfig,
    metadata: Option<&AuthorizationServerMetadata>,
) -> Result<Arc<dyn KeyProvider>, GuardError> {
    if let Some(secret) = &config.hs256_secret {
        return Ok(Arc::new(StaticKeyProvider::from_secret(secret.as_bytes())));
    }
    let jwks_uri = config
        .jwks_uri
        .clone()
        .or_else(|| metadata.and_then(|m| m.jwks_uri.clone()))
        .ok_or_else(|| GuardError::Config("no jwks_uri configured or discovered".into()))?;

    let mut provider = JwksKeyProvider::new(client.clone(), jwks_uri)
        .refresh_interval(config.jwks_refresh_interval())
        .timeout(config.jwks_timeout());
    // Tokens carry the issuer the server advertises, so prefer that string.
    if let Some(issuer) = metadata.map(|m| m.issuer.as_str()).or(config.issuer.as_deref()) {
        provider = provider.issuer(issuer);
    }
    Ok(Arc::new(provider.fetch_now().await?))
}

fn introspection_verifier(
    client: &reqwest::Client,
    config: &GuardConfig,
    metadata: Option<&AuthorizationServerMetadata>,
) -> Result<IntrospectionVerifier, GuardError> {
    let endpoint = config
        .introspection_endpoint
        .clone()
        .or_else(|| metadata.and_then(|m| m.introspection_endpoint.clone()))
        .ok_or_else(|| GuardError::Config("no introspection_endpoint configured or discovered".into()))?;
    let method = config.introspection_auth_method.unwrap_or_else(|| {
        metadata
            .map(|m| ClientAuthMethod::from_supported(&m.introspection_endpoint_auth_methods_supported))
            .unwrap_or_default()
    });

    let mut verifier = IntrospectionVerifier::with_client(client.clone(), endpoint)
        .timeout(config.introspection_timeout())
        .clock_skew(config.clock_skew_seconds);
    if let (Some(id), Some(secret)) = (&config.client_id, &config.client_secret) {
        verifier = verifier.client_credentials(id.clone(), secret.clone(), method);
    }
    Ok(verifier)
}

/// Assembles a [`Guard`] from parts.
#[derive(Default)]
pub struct GuardBuilder {
    extractor: TokenExtractor,
    signed: Option<Arc<dyn TokenVerifier>>,
    opaque: Option<Arc<dyn TokenVerifier>>,
    cache: Option<IntrospectionCache>,
    expected_issuer: Option<String>,
    expected_audience: Option<String>,
}

impl GuardBuilder {
    pub fn extractor(mut self, extractor: TokenExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Verifier for JWT-shaped tokens.
    pub fn signed_verifier(mut self, verifier: impl TokenVerifier + 'static) -> Self {
        self.signed = Some(Arc::new(verifier));
        self
    }

    /// Verifier for opaque tokens, used as is. Prefer
    /// [`introspection_cache`](Self::introspection_cache) for remote verifiers.
    pub fn opaque_verifier(mut self, verifier: impl TokenVerifier + 'static) -> Self {
        self.opaque = Some(Arc::new(verifier));
        self.cache = None;
        self
    }

    /// Route opaque tokens through a cache. The guard keeps a handle so
    /// [`Guard::invalidate`] reaches it.
    pub fn introspection_cache(mut self, cache: IntrospectionCache) -> Self {
        self.opaque = Some(Arc::new(cache.clone()));
        self.cache = Some(cache);
        self
    }

    pub fn expected_issuer(self, issuer: impl Into<String>) -> Self {
        self.expected_issuer_opt(Some(issuer.into()))
    }

    pub fn expected_audience(self, audience: impl Into<String>) -> Self {
        self.expected_audience_opt(Some(audience.into()))
    }

    fn expected_issuer_opt(mut self, issuer: Option<String>) -> Self {
        self.expected_issuer = issuer;
        self
    }

    fn expected_audience_opt(mut self, audience: Option<String>) -> Self {
        self.expected_audience = audience;
        self
    }

    pub fn build(self) -> Result<Guard, GuardError> {
        if self.signed.is_none() && self.opaque.is_none() {
            return Err(GuardError::Config(
                "a guard needs a signed or an opaque token verifier".into(),
            ));
        }
        Ok(Guard {
            extractor: self.extractor,
            authorizer: ScopeAuthorizer::new(),
            signed: self.signed,
            opaque: self.opaque,
            cache: self.cache,
            expected_issuer: self.expected_issuer,
            expected_audience: self.expected_audience,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::claims::TokenClaims;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with fixed scopes and counts calls.
    struct FixedVerifier {
        result: VerificationResult,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenVerifier for FixedVerifier {
        async fn verify(&self, _: &str, _: Option<&str>, _: Option<&str>) -> VerificationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn valid(scopes: &[&str]) -> VerificationResult {
        VerificationResult::Valid(TokenClaims {
            subject: Some("user".into()),
            issuer: None,
            expiry: Utc::now() + chrono::Duration::minutes(5),
            issued_at: None,
            not_before: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            audience: Default::default(),
            client_id: None,
            extra: Default::default(),
        })
    }

    fn fixed(result: VerificationResult) -> (FixedVerifier, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (FixedVerifier { result, calls: calls.clone() }, calls)
    }

    fn bearer(token: &str) -> RequestMetadata {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
        RequestMetadata::from_headers(headers)
    }

    #[test]
    fn test_builder_requires_a_verifier() {
        assert!(Guard::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_routes_by_token_shape() {
        let (signed, signed_calls) = fixed(valid(&["read"]));
        let (opaque, opaque_calls) = fixed(valid(&["read"]));
        let guard = Guard::builder()
            .signed_verifier(signed)
            .opaque_verifier(opaque)
            .build()
            .unwrap();
        let policy = ScopePolicy::all_of(["read"]);

        assert!(guard.decide(&bearer("aaa.bbb.ccc"), &policy).await.is_allowed());
        assert!(guard.decide(&bearer("opaque-token"), &policy).await.is_allowed());
        assert_eq!(signed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(opaque_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_opaque_token_without_introspection_is_malformed() {
        let (signed, calls) = fixed(valid(&[]));
        let guard = Guard::builder().signed_verifier(signed).build().unwrap();
        let verdict = guard.decide(&bearer("opaque-token"), &ScopePolicy::new()).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::Malformed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_skips_verification() {
        let (signed, calls) = fixed(valid(&[]));
        let guard = Guard::builder().signed_verifier(signed).build().unwrap();
        let verdict = guard.decide(&RequestMetadata::default(), &ScopePolicy::new()).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::NoCredential));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_error_fails_closed() {
        let (opaque, _) = fixed(VerificationResult::TransientError("timeout".into()));
        let guard = Guard::builder().opaque_verifier(opaque).build().unwrap();
        let verdict = guard.decide(&bearer("opaque"), &ScopePolicy::new()).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::UpstreamUnavailable));
    }

    #[tokio::test]
    async fn test_invalid_short_circuits_before_scopes() {
        let (signed, _) = fixed(VerificationResult::Invalid(DenyReason::SignatureInvalid));
        let guard = Guard::builder().signed_verifier(signed).build().unwrap();
        let verdict = guard.decide(&bearer("a.b.c"), &ScopePolicy::all_of(["admin"])).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::SignatureInvalid));
    }

    #[tokio::test]
    async fn test_insufficient_scope() {
        let (signed, _) = fixed(valid(&["read"]));
        let guard = Guard::builder().signed_verifier(signed).build().unwrap();
        let verdict = guard.decide(&bearer("a.b.c"), &ScopePolicy::all_of(["read", "write"])).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::InsufficientScope));
    }

    #[tokio::test]
    async fn test_invalidate_without_cache_is_noop() {
        let (signed, _) = fixed(valid(&[]));
        let guard = Guard::builder().signed_verifier(signed).build().unwrap();
        assert_eq!(guard.invalidate("anything"), 0);
        assert!(guard.cache().is_none());
    }
}
