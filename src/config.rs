use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheSettings;
use crate::verifier::introspection::ClientAuthMethod;

/// How tokens are verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStrategy {
    /// Local signature check only. Opaque tokens are rejected as malformed.
    #[default]
    Signed,
    /// Every token goes to the introspection endpoint (through the cache).
    Introspection,
    /// JWT-shaped tokens are checked locally, everything else introspected.
    Hybrid,
}

impl VerificationStrategy {
    pub fn uses_signed(self) -> bool {
        matches!(self, VerificationStrategy::Signed | VerificationStrategy::Hybrid)
    }

    pub fn uses_introspection(self) -> bool {
        matches!(self, VerificationStrategy::Introspection | VerificationStrategy::Hybrid)
    }
}

impl FromStr for VerificationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "signed" | "jwt" => Ok(VerificationStrategy::Signed),
            "introspection" => Ok(VerificationStrategy::Introspection),
            "hybrid" => Ok(VerificationStrategy::Hybrid),
            other => Err(format!("unknown verification strategy: {}", other)),
        }
    }
}

/// Guard configuration.
///
/// Every field has a default, so a partial document (or an empty
/// environment) deserializes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub verification_strategy: VerificationStrategy,
    /// Tolerance applied to `exp` and `nbf`.
    pub clock_skew_seconds: u64,
    pub cache_ttl_positive_seconds: u64,
    /// Zero disables negative caching.
    pub cache_ttl_negative_seconds: u64,
    pub cache_max_entries: usize,
    /// Allow requests with previously cached claims when the introspection
    /// endpoint cannot be reached. Off by default.
    pub fail_open_on_transient_error: bool,
    pub expected_issuer: Option<String>,
    pub expected_audience: Option<String>,
    /// Authorization server issuer URL, used for metadata discovery.
    pub issuer: Option<String>,
    pub jwks_uri: Option<String>,
    /// Periodic JWKS refresh. Unknown-`kid` refreshes are spaced by the
    /// smaller of this and 60 seconds.
    pub jwks_refresh_seconds: u64,
    /// Bound on each JWKS download.
    pub jwks_timeout_ms: u64,
    pub introspection_endpoint: Option<String>,
    /// Forced auth method. When unset, picked from discovered metadata.
    pub introspection_auth_method: Option<ClientAuthMethod>,
    pub introspection_timeout_ms: u64,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Shared HMAC secret for HS256 tokens, instead of a JWKS.
    pub hs256_secret: Option<String>,
    pub allow_query_token: bool,
    pub allow_form_token: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            verification_strategy: VerificationStrategy::Signed,
            clock_skew_seconds: 30,
            cache_ttl_positive_seconds: 300,
            cache_ttl_negative_seconds: 30,
            cache_max_entries: 10_000,
            fail_open_on_transient_error: false,
            expected_issuer: None,
            expected_audience: None,
            issuer: None,
            jwks_uri: None,
            jwks_refresh_seconds: 3600,
            jwks_timeout_ms: 5000,
            introspection_endpoint: None,
            introspection_auth_method: None,
            introspection_timeout_ms: 5000,
            client_id: None,
            client_secret: None,
            hs256_secret: None,
            allow_query_token: false,
            allow_form_token: false,
        }
    }
}

impl GuardConfig {
    /// Reject combinations that cannot produce a working guard.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client_id.is_some() && self.client_secret.is_none() {
            anyhow::bail!("OAUTH2_CLIENT_SECRET must be set when OAUTH2_CLIENT_ID is set");
        }

        let strategy = self.verification_strategy;
        if strategy.uses_introspection() {
            if self.client_id.is_none() {
                anyhow::bail!("the {:?} strategy requires OAUTH2_CLIENT_ID and OAUTH2_CLIENT_SECRET", strategy);
            }
            if self.introspection_endpoint.is_none() && self.issuer.is_none() {
                anyhow::bail!(
                    "the {:?} strategy requires OAUTH2_INTROSPECTION_ENDPOINT or OAUTH2_ISSUER for discovery",
                    strategy
                );
            }
        }
        if strategy.uses_signed() && self.jwks_uri.is_none() && self.issuer.is_none() && self.hs256_secret.is_none() {
            anyhow::bail!("the {:?} strategy requires OAUTH2_JWKS_URI, OAUTH2_ISSUER or OAUTH2_HS256_SECRET", strategy);
        }

        if self.cache_ttl_negative_seconds > self.cache_ttl_positive_seconds {
            anyhow::bail!(
                "negative cache TTL ({}s) must not exceed positive cache TTL ({}s)",
                self.cache_ttl_negative_seconds,
                self.cache_ttl_positive_seconds
            );
        }
        if self.jwks_timeout_ms == 0 || self.introspection_timeout_ms == 0 {
            anyhow::bail!("OAUTH2_JWKS_TIMEOUT_MS and OAUTH2_INTROSPECTION_TIMEOUT_MS must be at least 1");
        }
        if self.cache_max_entries == 0 {
            anyhow::bail!("OAUTH2_CACHE_MAX_ENTRIES must be at least 1");
        }
        Ok(())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            positive_ttl: Duration::from_secs(self.cache_ttl_positive_seconds),
            negative_ttl: Duration::from_secs(self.cache_ttl_negative_seconds),
            max_entries: self.cache_max_entries,
            fail_open: self.fail_open_on_transient_error,
        }
    }

    /// Issuer tokens must carry: `expected_issuer`, else the discovery issuer.
    pub fn effective_issuer(&self) -> Option<&str> {
        self.expected_issuer.as_deref().or(self.issuer.as_deref())
    }

    pub fn introspection_timeout(&self) -> Duration {
        Duration::from_millis(self.introspection_timeout_ms)
    }

    pub fn jwks_timeout(&self) -> Duration {
        Duration::from_millis(self.jwks_timeout_ms)
    }

    pub fn jwks_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_refresh_seconds)
    }
}

/// Load configuration from `OAUTH2_*` environment variables (and `.env`).
pub fn load() -> anyhow::Result<GuardConfig> {
    dotenvy::dotenv().ok();
    load_from(|name| std::env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
pub fn load_from(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<GuardConfig> {
    let defaults = GuardConfig::default();
    let text = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let number = |name: &str, default: u64| -> anyhow::Result<u64> {
        match text(name) {
            Some(v) => v
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got {:?}", name, v)),
            None => Ok(default),
        }
    };
    let flag = |name: &str| {
        text(name)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    };

    let verification_strategy = match text("OAUTH2_VERIFICATION_STRATEGY") {
        Some(v) => v.parse::<VerificationStrategy>().map_err(anyhow::Error::msg)?,
        None => defaults.verification_strategy,
    };
    let introspection_auth_method = match text("OAUTH2_INTROSPECTION_AUTH_METHOD") {
        Some(v) => Some(v.parse::<ClientAuthMethod>().map_err(anyhow::Error::msg)?),
        None => None,
    };

    let config = GuardConfig {
        verification_strategy,
        clock_skew_seconds: number("OAUTH2_CLOCK_SKEW_SECONDS", defaults.clock_skew_seconds)?,
        cache_ttl_positive_seconds: number("OAUTH2_CACHE_TTL_POSITIVE_SECONDS", defaults.cache_ttl_positive_seconds)?,
        cache_ttl_negative_seconds: number("OAUTH2_CACHE_TTL_NEGATIVE_SECONDS", defaults.cache_ttl_negative_seconds)?,
        cache_max_entries: number("OAUTH2_CACHE_MAX_ENTRIES", defaults.cache_max_entries as u64)? as usize,
        fail_open_on_transient_error: flag("OAUTH2_FAIL_OPEN_ON_TRANSIENT_ERROR"),
        expected_issuer: text("OAUTH2_EXPECTED_ISSUER"),
        expected_audience: text("OAUTH2_EXPECTED_AUDIENCE"),
        issuer: text("OAUTH2_ISSUER"),
        jwks_uri: text("OAUTH2_JWKS_URI"),
        jwks_refresh_seconds: number("OAUTH2_JWKS_UPDATE_INTERVAL", defaults.jwks_refresh_seconds)?,
        jwks_timeout_ms: number("OAUTH2_JWKS_TIMEOUT_MS", defaults.jwks_timeout_ms)?,
        introspection_endpoint: text("OAUTH2_INTROSPECTION_ENDPOINT"),
        introspection_auth_method,
        introspection_timeout_ms: number("OAUTH2_INTROSPECTION_TIMEOUT_MS", defaults.introspection_timeout_ms)?,
        client_id: text("OAUTH2_CLIENT_ID"),
        client_secret: text("OAUTH2_CLIENT_SECRET"),
        hs256_secret: text("OAUTH2_HS256_SECRET"),
        allow_query_token: flag("OAUTH2_ALLOW_QUERY_TOKEN"),
        allow_form_token: flag("OAUTH2_ALLOW_FORM_TOKEN"),
    };
    config.validate()?;
    Ok(config)
}
