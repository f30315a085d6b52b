use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Why a request was denied.
///
/// Every per-request failure resolves to one of these; none of them are
/// retried inside the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("no bearer credential presented")]
    NoCredential,

    #[error("malformed token")]
    Malformed,

    #[error("token expired or not yet valid")]
    Expired,

    #[error("token signature invalid")]
    SignatureInvalid,

    #[error("token revoked or inactive")]
    Revoked,

    #[error("token issuer not accepted")]
    InvalidIssuer,

    #[error("token audience not accepted")]
    InvalidAudience,

    #[error("insufficient scope")]
    InsufficientScope,

    #[error("authorization server unavailable")]
    UpstreamUnavailable,
}

impl DenyReason {
    /// Stable machine-readable code, used in response bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::NoCredential => "no_credential",
            DenyReason::Malformed => "malformed",
            DenyReason::Expired => "expired",
            DenyReason::SignatureInvalid => "signature_invalid",
            DenyReason::Revoked => "revoked",
            DenyReason::InvalidIssuer => "invalid_issuer",
            DenyReason::InvalidAudience => "invalid_audience",
            DenyReason::InsufficientScope => "insufficient_scope",
            DenyReason::UpstreamUnavailable => "upstream_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DenyReason::InsufficientScope => StatusCode::FORBIDDEN,
            DenyReason::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// `WWW-Authenticate` challenge per RFC 6750 §3.
    ///
    /// A request without credentials gets a bare `Bearer` challenge with no
    /// error code. `required_scopes` is only rendered for `insufficient_scope`.
    pub fn www_authenticate(&self, realm: Option<&str>, required_scopes: &[String]) -> String {
        let mut parts = Vec::new();
        if let Some(realm) = realm {
            parts.push(format!("realm=\"{}\"", realm));
        }

        match self {
            DenyReason::NoCredential => {}
            DenyReason::InsufficientScope => {
                parts.push("error=\"insufficient_scope\"".to_string());
                if !required_scopes.is_empty() {
                    parts.push(format!("scope=\"{}\"", required_scopes.join(" ")));
                }
            }
            DenyReason::UpstreamUnavailable => {
                parts.push("error=\"temporarily_unavailable\"".to_string());
            }
            other => {
                parts.push("error=\"invalid_token\"".to_string());
                parts.push(format!("error_description=\"{}\"", other));
            }
        }

        if parts.is_empty() {
            "Bearer".to_string()
        } else {
            format!("Bearer {}", parts.join(", "))
        }
    }

    /// Build the HTTP denial, advertising the scopes the route requires.
    pub fn into_response_with_scopes(self, realm: Option<&str>, required_scopes: &[String]) -> Response {
        let error_type = match self {
            DenyReason::InsufficientScope => "permission_error",
            DenyReason::UpstreamUnavailable => "upstream_error",
            _ => "authentication_error",
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": self.code(),
            }
        }));

        let mut response = (self.status_code(), body).into_response();
        let challenge = self.www_authenticate(realm, required_scopes);
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        if self == DenyReason::UpstreamUnavailable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

impl IntoResponse for DenyReason {
    fn into_response(self) -> Response {
        self.into_response_with_scopes(None, &[])
    }
}

/// Setup-time failures: configuration, discovery, key material.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("discovery failed for {issuer}: {reason}")]
    Discovery { issuer: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("key material error: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
}
