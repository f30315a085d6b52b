//! RFC 7662 token introspection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::TokenVerifier;
use crate::errors::DenyReason;
use crate::models::claims::{ClaimChecks, RawClaims};
use crate::models::token::fingerprint;
use crate::models::verdict::VerificationResult;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the resource server authenticates to the introspection endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` / `client_secret` form parameters.
    #[default]
    ClientSecretPost,
    /// HTTP Basic with the form-urlencoded client id and secret.
    ClientSecretBasic,
}

impl ClientAuthMethod {
    /// Pick a method from `introspection_endpoint_auth_methods_supported`.
    /// `client_secret_post` wins when offered or when nothing is advertised.
    pub fn from_supported(methods: &[String]) -> Self {
        let offers = |m: &str| methods.iter().any(|s| s == m);
        if methods.is_empty() || offers("client_secret_post") {
            ClientAuthMethod::ClientSecretPost
        } else if offers("client_secret_basic") {
            ClientAuthMethod::ClientSecretBasic
        } else {
            tracing::warn!(
                supported = ?methods,
                "no supported introspection auth method advertised, using client_secret_post"
            );
            ClientAuthMethod::ClientSecretPost
        }
    }
}

impl FromStr for ClientAuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client_secret_post" => Ok(ClientAuthMethod::ClientSecretPost),
            "client_secret_basic" => Ok(ClientAuthMethod::ClientSecretBasic),
            other => Err(format!("unsupported introspection auth method: {}", other)),
        }
    }
}

#[derive(Clone)]
struct ClientCredentials {
    client_id: String,
    client_secret: Zeroizing<String>,
    method: ClientAuthMethod,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("method", &self.method)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(flatten)]
    claims: RawClaims,
}

/// Asks the authorization server whether a token is active.
///
/// - unreachable endpoint, timeout, non-2xx, or an unparseable body →
///   `TransientError`
/// - `"active": false` → `Invalid(Revoked)`
/// - `"active": true` → claims checked like a signed token's, except that
///   a missing `iss` or `aud` is accepted
///
/// A network failure is never `Valid`.
#[derive(Debug, Clone)]
pub struct IntrospectionVerifier {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<ClientCredentials>,
    timeout: Duration,
    clock_skew: chrono::Duration,
}

impl IntrospectionVerifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            clock_skew: chrono::Duration::seconds(30),
        }
    }

    pub fn client_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        method: ClientAuthMethod,
    ) -> Self {
        self.credentials = Some(ClientCredentials {
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            method,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clock_skew(mut self, seconds: u64) -> Self {
        self.clock_skew = chrono::Duration::seconds(seconds.min(86_400) as i64);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, String> {
        let mut form: Vec<(&str, &str)> = vec![("token", token), ("token_type_hint", "access_token")];
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json");

        if let Some(credentials) = &self.credentials {
            match credentials.method {
                ClientAuthMethod::ClientSecretPost => {
                    form.push(("client_id", credentials.client_id.as_str()));
                    form.push(("client_secret", credentials.client_secret.as_str()));
                }
                ClientAuthMethod::ClientSecretBasic => {
                    // RFC 6749 §2.3.1: both parts are form-urlencoded first.
                    let id: String = url::form_urlencoded::byte_serialize(credentials.client_id.as_bytes()).collect();
                    let secret = Zeroizing::new(
                        url::form_urlencoded::byte_serialize(credentials.client_secret.as_bytes()).collect::<String>(),
                    );
                    request = request.basic_auth(id, Some(secret.as_str()));
                }
            }
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| format!("introspection request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("introspection endpoint returned {}", status));
        }

        response
            .json::<IntrospectionResponse>()
            .await
            .map_err(|e| format!("malformed introspection response: {}", e))
    }
}

#[async_trait]
impl TokenVerifier for IntrospectionVerifier {
    async fn verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult {
        let token_id = fingerprint(token);

        let response = match self.introspect(token).await {
            Ok(response) => response,
            Err(reason) => {
                tracing::warn!(token = %token_id, endpoint = %self.endpoint, reason = %reason, "introspection failed");
                return VerificationResult::TransientError(reason);
            }
        };

        if !response.active {
            tracing::debug!(token = %token_id, "token inactive");
            return VerificationResult::Invalid(DenyReason::Revoked);
        }

        let checks = ClaimChecks {
            now: Utc::now(),
            skew: self.clock_skew,
            issuer: expected_issuer,
            audience: expected_audience,
            absent_ok: true,
        };
        let result: VerificationResult = response.claims.validate(&checks).into();
        if let VerificationResult::Invalid(reason) = &result {
            tracing::debug!(token = %token_id, reason = %reason, "active token failed claim checks");
        }
        result
    }
}
