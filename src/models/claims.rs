use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DenyReason;

/// Normalized claims of a verified token.
///
/// Both verification strategies produce this shape, so scope evaluation does
/// not care where a token was checked. `expiry` is always present: a token
/// without `exp` never becomes a `TokenClaims`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub expiry: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
    pub audience: BTreeSet<String>,
    pub client_id: Option<String>,
    /// Claims the guard does not interpret.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// `aud`: a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum AudienceClaim {
    Single(String),
    Multiple(Vec<String>),
}

/// `scope` (space-delimited string) or `scp` (array, as some IdPs emit it).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ScopeClaim {
    Delimited(String),
    List(Vec<String>),
}

impl ScopeClaim {
    fn into_scopes(self) -> Vec<String> {
        match self {
            ScopeClaim::Delimited(s) => s.split_whitespace().map(String::from).collect(),
            ScopeClaim::List(v) => v,
        }
    }
}

/// Claims as they appear on the wire, in a JWT payload or an introspection
/// response.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<AudienceClaim>,
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub iat: Option<f64>,
    #[serde(default)]
    pub nbf: Option<f64>,
    #[serde(default)]
    pub scope: Option<ScopeClaim>,
    #[serde(default)]
    pub scp: Option<ScopeClaim>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What a verifier expects of a token's claims.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimChecks<'a> {
    pub now: DateTime<Utc>,
    pub skew: Duration,
    pub issuer: Option<&'a str>,
    pub audience: Option<&'a str>,
    /// Accept a missing `iss`/`aud` when an expectation is set. Introspection
    /// responses may omit them; the authorization server vouches for the token.
    pub absent_ok: bool,
}

fn numeric_date(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    Utc.timestamp_opt(value.floor() as i64, 0).single()
}

impl RawClaims {
    /// Expiry check on its own, so it can run before any signature work.
    ///
    /// Missing or unparseable `exp` is `Malformed`, as is one so close to the
    /// edge of the calendar that `exp + skew` is unrepresentable.
    /// `exp + skew <= now` is `Expired`.
    pub(crate) fn check_expiry(&self, now: DateTime<Utc>, skew: Duration) -> Result<DateTime<Utc>, DenyReason> {
        let expiry = self.exp.and_then(numeric_date).ok_or(DenyReason::Malformed)?;
        let deadline = expiry.checked_add_signed(skew).ok_or(DenyReason::Malformed)?;
        if deadline <= now {
            return Err(DenyReason::Expired);
        }
        Ok(expiry)
    }

    pub(crate) fn validate(self, checks: &ClaimChecks<'_>) -> Result<TokenClaims, DenyReason> {
        let expiry = self.check_expiry(checks.now, checks.skew)?;

        let not_before = match self.nbf {
            Some(nbf) => Some(numeric_date(nbf).ok_or(DenyReason::Malformed)?),
            None => None,
        };
        if let Some(nbf) = not_before {
            let earliest = nbf.checked_sub_signed(checks.skew).ok_or(DenyReason::Malformed)?;
            if earliest > checks.now {
                return Err(DenyReason::Expired);
            }
        }

        let issued_at = match self.iat {
            Some(iat) => Some(numeric_date(iat).ok_or(DenyReason::Malformed)?),
            None => None,
        };

        if let Some(expected) = checks.issuer {
            match self.iss.as_deref() {
                Some(iss) if iss == expected => {}
                None if checks.absent_ok => {}
                _ => return Err(DenyReason::InvalidIssuer),
            }
        }

        let audience: BTreeSet<String> = match self.aud {
            Some(AudienceClaim::Single(a)) => BTreeSet::from([a]),
            Some(AudienceClaim::Multiple(v)) => v.into_iter().collect(),
            None => BTreeSet::new(),
        };
        if let Some(expected) = checks.audience {
            let absent = audience.is_empty() && checks.absent_ok;
            if !absent && !audience.contains(expected) {
                return Err(DenyReason::InvalidAudience);
            }
        }

        let scopes = self
            .scope
            .into_iter()
            .chain(self.scp)
            .flat_map(ScopeClaim::into_scopes)
            .filter(|s| !s.is_empty())
            .collect();

        Ok(TokenClaims {
            subject: self.sub,
            issuer: self.iss,
            expiry,
            issued_at,
            not_before,
            scopes,
            audience,
            client_id: self.client_id,
            extra: self.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checks(now: DateTime<Utc>) -> ClaimChecks<'static> {
        ClaimChecks {
            now,
            skew: Duration::seconds(30),
            issuer: None,
            audience: None,
            absent_ok: false,
        }
    }

    fn raw(value: serde_json::Value) -> RawClaims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_normalizes_standard_claims() {
        let now = Utc::now();
        let exp = now.timestamp() + 600;
        let claims = raw(json!({
            "sub": "user-1",
            "iss": "https://issuer.local",
            "aud": ["api", "other"],
            "exp": exp,
            "iat": now.timestamp(),
            "scope": "read write",
            "tenant": "acme"
        }))
        .validate(&checks(now))
        .unwrap();

        assert_eq!(claims.subject.as_deref(), Some("user-1"));
        assert_eq!(claims.expiry.timestamp(), exp);
        assert!(claims.has_scope("read"));
        assert!(claims.has_scope("write"));
        assert!(claims.audience.contains("api"));
        assert_eq!(claims.extra["tenant"], "acme");
    }

    #[test]
    fn test_scp_array_is_merged() {
        let now = Utc::now();
        let claims = raw(json!({
            "exp": now.timestamp() + 60,
            "scope": "read",
            "scp": ["admin"]
        }))
        .validate(&checks(now))
        .unwrap();
        assert_eq!(claims.scopes.len(), 2);
        assert!(claims.has_scope("admin"));
    }

    #[test]
    fn test_missing_exp_is_malformed() {
        let result = raw(json!({"sub": "x"})).validate(&checks(Utc::now()));
        assert_eq!(result.unwrap_err(), DenyReason::Malformed);
    }

    #[test]
    fn test_past_exp_is_expired() {
        let now = Utc::now();
        let result = raw(json!({"exp": now.timestamp() - 120})).validate(&checks(now));
        assert_eq!(result.unwrap_err(), DenyReason::Expired);
    }

    #[test]
    fn test_skew_tolerates_recent_expiry() {
        let now = Utc::now();
        let result = raw(json!({"exp": now.timestamp() - 10})).validate(&checks(now));
        assert!(result.is_ok());
    }

    #[test]
    fn test_future_nbf_beyond_skew_is_rejected() {
        let now = Utc::now();
        let result = raw(json!({"exp": now.timestamp() + 600, "nbf": now.timestamp() + 300}))
            .validate(&checks(now));
        assert_eq!(result.unwrap_err(), DenyReason::Expired);

        let result = raw(json!({"exp": now.timestamp() + 600, "nbf": now.timestamp() + 10}))
            .validate(&checks(now));
        assert!(result.is_ok());
    }

    #[test]
    fn test_issuer_and_audience_checks() {
        let now = Utc::now();
        let mut c = checks(now);
        c.issuer = Some("https://issuer.local");
        c.audience = Some("api");

        let ok = raw(json!({"exp": now.timestamp() + 60, "iss": "https://issuer.local", "aud": "api"}));
        assert!(ok.validate(&c).is_ok());

        let wrong_iss = raw(json!({"exp": now.timestamp() + 60, "iss": "https://evil", "aud": "api"}));
        assert_eq!(wrong_iss.validate(&c).unwrap_err(), DenyReason::InvalidIssuer);

        let wrong_aud = raw(json!({"exp": now.timestamp() + 60, "iss": "https://issuer.local", "aud": "web"}));
        assert_eq!(wrong_aud.validate(&c).unwrap_err(), DenyReason::InvalidAudience);

        let missing = raw(json!({"exp": now.timestamp() + 60}));
        assert_eq!(missing.clone().validate(&c).unwrap_err(), DenyReason::InvalidIssuer);

        c.absent_ok = true;
        assert!(missing.validate(&c).is_ok());
    }

    #[test]
    fn test_fractional_timestamps() {
        let now = Utc::now();
        let claims = raw(json!({"exp": now.timestamp() as f64 + 90.75}))
            .validate(&checks(now))
            .unwrap();
        assert_eq!(claims.expiry.timestamp(), now.timestamp() + 90);
    }

    #[test]
    fn test_calendar_edge_timestamps_are_malformed() {
        let now = Utc::now();
        let max = DateTime::<Utc>::MAX_UTC.timestamp();
        let min = DateTime::<Utc>::MIN_UTC.timestamp();

        let result = raw(json!({"exp": max})).validate(&checks(now));
        assert_eq!(result.unwrap_err(), DenyReason::Malformed);

        let result = raw(json!({"exp": now.timestamp() + 60, "nbf": min})).validate(&checks(now));
        assert_eq!(result.unwrap_err(), DenyReason::Malformed);

        // zero skew never overflows
        let mut c = checks(now);
        c.skew = Duration::zero();
        assert!(raw(json!({"exp": max})).validate(&c).is_ok());
    }
}
