//! Authorization server metadata discovery.
//!
//! Tries RFC 8414 (`/.well-known/oauth-authorization-server`) first and falls
//! back to OpenID Connect discovery (`/.well-known/openid-configuration`).
//! Both documents are resolved relative to the issuer URL.

use serde::Deserialize;

use crate::errors::GuardError;

/// Authorization server metadata (subset of fields we need).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub introspection_endpoint_auth_methods_supported: Vec<String>,
}

const WELL_KNOWN_PATHS: [&str; 2] = [
    ".well-known/oauth-authorization-server",
    ".well-known/openid-configuration",
];

/// Fetch the metadata document for `issuer`.
///
/// The document's `issuer` must match the requested one (ignoring a trailing
/// slash), otherwise a compromised or misconfigured endpoint could point us
/// at another issuer's keys.
pub async fn discover(client: &reqwest::Client, issuer: &str) -> Result<AuthorizationServerMetadata, GuardError> {
    let base = issuer.trim_end_matches('/');
    let mut last_error = String::new();

    for path in WELL_KNOWN_PATHS {
        let url = format!("{}/{}", base, path);
        tracing::info!(url = %url, "Authorization server discovery");

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                last_error = err.to_string();
                continue;
            }
        };
        if !response.status().is_success() {
            last_error = format!("{} returned {}", url, response.status());
            continue;
        }

        let metadata: AuthorizationServerMetadata = match response.json().await {
            Ok(metadata) => metadata,
            Err(err) => {
                last_error = format!("{} returned an invalid document: {}", url, err);
                continue;
            }
        };

        if metadata.issuer.trim_end_matches('/') != base {
            return Err(GuardError::Discovery {
                issuer: issuer.to_string(),
                reason: format!("metadata names a different issuer: {}", metadata.issuer),
            });
        }
        return Ok(metadata);
    }

    Err(GuardError::Discovery {
        issuer: issuer.to_string(),
        reason: last_error,
    })
}
