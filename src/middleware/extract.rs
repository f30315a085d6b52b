//! Bearer token extraction (RFC 6750 §2).
//!
//! The `Authorization: Bearer <token>` header is always honoured; the
//! `access_token` query and form parameters only when enabled.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};

use crate::errors::DenyReason;
use crate::models::token::BearerToken;

const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Request data the extractor looks at. Built by the integration layer.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
}

impl RequestMetadata {
    pub fn from_headers(headers: HeaderMap) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    /// Parse a raw (still percent-encoded) query string.
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        self
    }

    /// Parse an `application/x-www-form-urlencoded` body.
    pub fn with_form(mut self, body: &[u8]) -> Self {
        self.form = url::form_urlencoded::parse(body).into_owned().collect();
        self
    }
}

/// Pulls the bearer token out of a request. Side-effect free.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenExtractor {
    allow_query: bool,
    allow_form: bool,
}

impl TokenExtractor {
    /// Header-only extraction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also accept `?access_token=`. Tokens in URLs end up in access logs.
    pub fn allow_query(mut self, allow: bool) -> Self {
        self.allow_query = allow;
        self
    }

    /// Also accept an `access_token` form body parameter.
    pub fn allow_form(mut self, allow: bool) -> Self {
        self.allow_form = allow;
        self
    }

    pub fn allows_query(&self) -> bool {
        self.allow_query
    }

    pub fn allows_form(&self) -> bool {
        self.allow_form
    }

    /// Returns the token, `NoCredential`, or `Malformed`.
    ///
    /// A header with another scheme (`Basic ...`), an empty bearer value, or
    /// repeated `Authorization` headers are all `NoCredential`: the caller
    /// learns nothing about why extraction failed. `Malformed` is reserved for
    /// a bearer value containing characters outside the RFC 6750 `b64token`
    /// alphabet.
    pub fn extract(&self, request: &RequestMetadata) -> Result<BearerToken, DenyReason> {
        let mut values = request.headers.get_all(AUTHORIZATION).iter();
        if let Some(value) = values.next() {
            if values.next().is_some() {
                return Err(DenyReason::NoCredential);
            }
            match parse_bearer(value) {
                Err(DenyReason::NoCredential) => {}
                other => return other,
            }
        }

        if self.allow_query {
            if let Some(token) = single_param(&request.query)? {
                return Ok(token);
            }
        }
        if self.allow_form {
            if let Some(token) = single_param(&request.form)? {
                return Ok(token);
            }
        }

        Err(DenyReason::NoCredential)
    }
}

fn parse_bearer(value: &HeaderValue) -> Result<BearerToken, DenyReason> {
    let raw = value.to_str().map_err(|_| DenyReason::NoCredential)?.trim();
    let (scheme, rest) = raw.split_once(' ').ok_or(DenyReason::NoCredential)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(DenyReason::NoCredential);
    }
    checked_token(rest.trim_start())
}

/// `Ok(None)` when the parameter is absent; a repeated parameter is
/// `NoCredential`.
fn single_param(params: &[(String, String)]) -> Result<Option<BearerToken>, DenyReason> {
    let mut matches = params.iter().filter(|(k, _)| k == ACCESS_TOKEN_PARAM);
    match (matches.next(), matches.next()) {
        (None, _) => Ok(None),
        (Some(_), Some(_)) => Err(DenyReason::NoCredential),
        (Some((_, value)), None) => checked_token(value).map(Some),
    }
}

fn checked_token(token: &str) -> Result<BearerToken, DenyReason> {
    if token.is_empty() {
        return Err(DenyReason::NoCredential);
    }
    if !is_b64token(token) {
        return Err(DenyReason::Malformed);
    }
    Ok(BearerToken::new(token))
}

/// `1*( ALPHA / DIGIT / "-" / "." / "_" / "~" / "+" / "/" ) *"="`
fn is_b64token(token: &str) -> bool {
    let body = token.trim_end_matches('=');
    !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'+' | b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_auth(value: &str) -> RequestMetadata {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        RequestMetadata::from_headers(headers)
    }

    #[test]
    fn test_extracts_bearer_header() {
        let token = TokenExtractor::new().extract(&with_auth("Bearer abc.def.ghi")).unwrap();
        assert_eq!(token.as_str(), "abc.def.ghi");
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        for header in ["bearer tok123", "BEARER tok123", "BeArEr   tok123"] {
            let token = TokenExtractor::new().extract(&with_auth(header)).unwrap();
            assert_eq!(token.as_str(), "tok123");
        }
    }

    #[test]
    fn test_missing_header_is_no_credential() {
        let result = TokenExtractor::new().extract(&RequestMetadata::default());
        assert_eq!(result.unwrap_err(), DenyReason::NoCredential);
    }

    #[test]
    fn test_other_scheme_is_no_credential() {
        for header in ["Basic xyz", "Bearer", "Bearer ", "Token abc", "Bearerabc"] {
            let result = TokenExtractor::new().extract(&with_auth(header));
            assert_eq!(result.unwrap_err(), DenyReason::NoCredential, "header: {header}");
        }
    }

    #[test]
    fn test_bad_characters_are_malformed() {
        for header in ["Bearer abc def", "Bearer a\"b", "Bearer ===", "Bearer tok=en"] {
            let result = TokenExtractor::new().extract(&with_auth(header));
            assert_eq!(result.unwrap_err(), DenyReason::Malformed, "header: {header}");
        }
    }

    #[test]
    fn test_trailing_padding_is_allowed() {
        let token = TokenExtractor::new().extract(&with_auth("Bearer abc==")).unwrap();
        assert_eq!(token.as_str(), "abc==");
    }

    #[test]
    fn test_repeated_header_is_no_credential() {
        let mut headers = HeaderMap::new();
        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer one"));
        headers.append(AUTHORIZATION, HeaderValue::from_static("Bearer two"));
        let result = TokenExtractor::new().extract(&RequestMetadata::from_headers(headers));
        assert_eq!(result.unwrap_err(), DenyReason::NoCredential);
    }

    #[test]
    fn test_query_token_requires_opt_in() {
        let request = RequestMetadata::default().with_query("access_token=q-token&x=1");
        assert_eq!(
            TokenExtractor::new().extract(&request).unwrap_err(),
            DenyReason::NoCredential
        );
        let token = TokenExtractor::new().allow_query(true).extract(&request).unwrap();
        assert_eq!(token.as_str(), "q-token");
    }

    #[test]
    fn test_form_token_requires_opt_in() {
        let request = RequestMetadata::default().with_form(b"access_token=f-token");
        assert!(TokenExtractor::new().extract(&request).is_err());
        let token = TokenExtractor::new().allow_form(true).extract(&request).unwrap();
        assert_eq!(token.as_str(), "f-token");
    }

    #[test]
    fn test_header_wins_over_query() {
        let request = with_auth("Bearer from-header").with_query("access_token=from-query");
        let token = TokenExtractor::new().allow_query(true).extract(&request).unwrap();
        assert_eq!(token.as_str(), "from-header");
    }

    #[test]
    fn test_repeated_query_param_is_no_credential() {
        let request = RequestMetadata::default().with_query("access_token=a&access_token=b");
        let result = TokenExtractor::new().allow_query(true).extract(&request);
        assert_eq!(result.unwrap_err(), DenyReason::NoCredential);
    }
}
