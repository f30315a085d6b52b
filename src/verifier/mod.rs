//! Token verification strategies.
//!
//! - [`signed::SignedTokenVerifier`]: local signature and claim checks of a
//!   JWT against key material from a [`keys::KeyProvider`].
//! - [`introspection::IntrospectionVerifier`]: RFC 7662 call to the
//!   authorization server.
//!
//! Both produce the same [`TokenClaims`](crate::TokenClaims) shape.

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::verdict::VerificationResult;

pub mod discovery;
pub mod introspection;
pub mod keys;
pub mod signed;

/// One `verify` capability shared by every strategy.
///
/// Implementations never fail outright: every outcome, including malformed
/// input and network trouble, is a [`VerificationResult`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult;
}

#[async_trait]
impl<T: TokenVerifier + ?Sized> TokenVerifier for Arc<T> {
    async fn verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult {
        (**self).verify(token, expected_issuer, expected_audience).await
    }
}
