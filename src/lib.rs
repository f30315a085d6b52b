//! oauth2-guard: OAuth2 resource server guard.
//!
//! Validates bearer access tokens and enforces scope requirements before a
//! request reaches application code. Tokens are verified either locally
//! (signed JWTs checked against issuer key material) or remotely through an
//! authorization server's introspection endpoint, whose results are cached
//! with single-flight coalescing.
//!
//! The entry point is [`Guard::decide`]:
//!
//! ```rust,no_run
//! use oauth2_guard::{Guard, RequestMetadata, ScopePolicy, StaticKeyProvider, SignedTokenVerifier};
//!
//! # async fn run(headers: axum::http::HeaderMap) -> Result<(), oauth2_guard::GuardError> {
//! let verifier = SignedTokenVerifier::new(StaticKeyProvider::from_secret(b"shared-secret"));
//! let guard = Guard::builder()
//!     .signed_verifier(verifier)
//!     .expected_issuer("https://issuer.local/oauth2")
//!     .build()?;
//!
//! let verdict = guard
//!     .decide(&RequestMetadata::from_headers(headers), &ScopePolicy::all_of(["read"]))
//!     .await;
//! if verdict.is_allowed() {
//!     // hand off to application logic
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod decision;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod verifier;

pub use cache::{CacheSettings, IntrospectionCache};
pub use config::{GuardConfig, VerificationStrategy};
pub use decision::{Guard, GuardBuilder};
pub use errors::{DenyReason, GuardError};
pub use middleware::extract::{RequestMetadata, TokenExtractor};
pub use middleware::guard::{require_scopes, RouteGuard};
pub use middleware::scope::ScopeAuthorizer;
pub use models::claims::TokenClaims;
pub use models::policy::{ScopeMatch, ScopePolicy};
pub use models::token::BearerToken;
pub use models::verdict::{AuthorizationVerdict, VerificationResult};
pub use verifier::discovery::{discover, AuthorizationServerMetadata};
pub use verifier::introspection::{ClientAuthMethod, IntrospectionVerifier};
pub use verifier::keys::{JwksKeyProvider, KeyProvider, StaticKeyProvider};
pub use verifier::signed::SignedTokenVerifier;
pub use verifier::TokenVerifier;
