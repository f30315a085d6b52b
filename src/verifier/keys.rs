//! Key material for signed token verification.
//!
//! The signed verifier never fetches keys itself; it asks a [`KeyProvider`]
//! for the key matching a token's issuer and `kid`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::errors::GuardError;

const DEFAULT_JWKS_REFRESH: Duration = Duration::from_secs(3600);
const DEFAULT_MIN_REFRESH: Duration = Duration::from_secs(60);
const DEFAULT_JWKS_TIMEOUT: Duration = Duration::from_secs(5);

/// Supplies decoding keys by issuer + key id.
///
/// `None` means "no such key"; the verifier reports that as an invalid
/// signature.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn decoding_key(&self, issuer: Option<&str>, key_id: Option<&str>) -> Option<Arc<DecodingKey>>;
}

// ── Static keys ──────────────────────────────────────────────

type KeySlot = (Option<String>, Option<String>);

/// Keys configured in code.
///
/// A key registered without an issuer (or key id) matches any issuer (or key
/// id). Lookup prefers the most specific registration.
#[derive(Clone, Default)]
pub struct StaticKeyProvider {
    keys: HashMap<KeySlot, Arc<DecodingKey>>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single HMAC secret used for every token.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new().key(None, None, DecodingKey::from_secret(secret))
    }

    /// Single RSA public key (PEM) used for every token.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, GuardError> {
        Ok(Self::new().key(None, None, DecodingKey::from_rsa_pem(pem)?))
    }

    /// Single EC public key (PEM) used for every token.
    pub fn from_ec_pem(pem: &[u8]) -> Result<Self, GuardError> {
        Ok(Self::new().key(None, None, DecodingKey::from_ec_pem(pem)?))
    }

    /// Register a key for an issuer and/or key id.
    pub fn key(mut self, issuer: Option<&str>, key_id: Option<&str>, key: DecodingKey) -> Self {
        self.keys.insert(
            (issuer.map(String::from), key_id.map(String::from)),
            Arc::new(key),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn lookup(&self, issuer: Option<&str>, key_id: Option<&str>) -> Option<Arc<DecodingKey>> {
        let candidates = [
            (issuer, key_id),
            (None, key_id),
            (issuer, None),
            (None, None),
        ];
        candidates.iter().find_map(|(iss, kid)| {
            self.keys
                .get(&(iss.map(String::from), kid.map(String::from)))
                .cloned()
        })
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn decoding_key(&self, issuer: Option<&str>, key_id: Option<&str>) -> Option<Arc<DecodingKey>> {
        self.lookup(issuer, key_id)
    }
}

// ── JWKS ─────────────────────────────────────────────────────

#[derive(Default)]
struct KeySet {
    by_kid: HashMap<String, Arc<DecodingKey>>,
    anonymous: Vec<Arc<DecodingKey>>,
    fetched_at: Option<Instant>,
}

impl KeySet {
    fn len(&self) -> usize {
        self.by_kid.len() + self.anonymous.len()
    }

    fn find(&self, key_id: Option<&str>) -> Option<Arc<DecodingKey>> {
        match key_id {
            Some(kid) => self.by_kid.get(kid).cloned(),
            // Without a kid we can only pick a key if there is exactly one.
            None if self.len() == 1 => self
                .by_kid
                .values()
                .chain(self.anonymous.iter())
                .next()
                .cloned(),
            None => None,
        }
    }
}

struct JwksState {
    keys: RwLock<KeySet>,
    last_attempt: Mutex<Option<Instant>>,
    /// Set while a periodic refresh runs in the background.
    refreshing: AtomicBool,
}

/// Clears `refreshing` when the background refresh ends, however it ends.
struct RefreshFlag(Arc<JwksState>);

impl Drop for RefreshFlag {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

/// Keys downloaded from an authorization server's `jwks_uri`.
///
/// Keys are refreshed every `refresh_interval` in the background while the
/// current keys keep serving, and on demand when a token names an unknown
/// `kid` (key rotation). Refresh attempts are spaced by at least
/// `min_refresh_interval` (never more than `refresh_interval`) so tokens with
/// random key ids cannot trigger a fetch per request. Each download is bounded
/// by `timeout`. A failed refresh keeps the previous keys.
///
/// Cheap to clone; clones share the key set.
#[derive(Clone)]
pub struct JwksKeyProvider {
    client: reqwest::Client,
    jwks_uri: String,
    issuer: Option<String>,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    timeout: Duration,
    state: Arc<JwksState>,
}

impl JwksKeyProvider {
    /// Create a provider without fetching. The first lookup fetches.
    pub fn new(client: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            client,
            jwks_uri: jwks_uri.into(),
            issuer: None,
            refresh_interval: DEFAULT_JWKS_REFRESH,
            min_refresh_interval: DEFAULT_MIN_REFRESH,
            timeout: DEFAULT_JWKS_TIMEOUT,
            state: Arc::new(JwksState {
                keys: RwLock::new(KeySet::default()),
                last_attempt: Mutex::new(None),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Fetch the key set once, failing if the endpoint is unreachable or
    /// returns no usable key. Call after the builder methods so the first
    /// download honours `timeout`.
    pub async fn fetch_now(self) -> Result<Self, GuardError> {
        *self.state.last_attempt.lock().await = Some(Instant::now());
        let count = self.refresh().await?;
        if count == 0 {
            return Err(GuardError::Config(format!(
                "JWKS at {} contains no usable keys",
                self.jwks_uri
            )));
        }
        Ok(self)
    }

    /// Create a provider with default settings and fetch the key set once.
    pub async fn fetch(client: reqwest::Client, jwks_uri: impl Into<String>) -> Result<Self, GuardError> {
        Self::new(client, jwks_uri).fetch_now().await
    }

    /// Only serve keys for tokens whose `iss` equals this issuer.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Bound on each JWKS download.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn refresh_spacing(&self) -> Duration {
        self.min_refresh_interval.min(self.refresh_interval)
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Download the key set and replace the current keys. Returns the number
    /// of usable keys.
    pub async fn refresh(&self) -> Result<usize, GuardError> {
        tracing::info!(jwks_uri = %self.jwks_uri, "Fetching JWKS keys");
        let jwks: JwkSet = self
            .client
            .get(&self.jwks_uri)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut set = KeySet::default();
        for jwk in &jwks.keys {
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => match &jwk.common.key_id {
                    Some(kid) => {
                        set.by_kid.insert(kid.clone(), Arc::new(key));
                    }
                    None => set.anonymous.push(Arc::new(key)),
                },
                Err(err) => {
                    tracing::warn!(kid = ?jwk.common.key_id, error = %err, "skipping unusable JWK");
                }
            }
        }
        set.fetched_at = Some(Instant::now());

        let count = set.len();
        *self.state.keys.write().await = set;
        tracing::debug!(jwks_uri = %self.jwks_uri, keys = count, "JWKS keys loaded");
        Ok(count)
    }

    /// Refresh unless an attempt happened within the refresh spacing.
    /// Returns whether the key set was replaced.
    async fn refresh_spaced(&self) -> bool {
        let mut last_attempt = self.state.last_attempt.lock().await;
        if let Some(at) = *last_attempt {
            if at.elapsed() < self.refresh_spacing() {
                return false;
            }
        }
        *last_attempt = Some(Instant::now());

        match self.refresh().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(jwks_uri = %self.jwks_uri, error = %err, "JWKS refresh failed, keeping previous keys");
                false
            }
        }
    }

    /// Start a periodic refresh on its own task unless one is running.
    fn refresh_in_background(&self) {
        if self.state.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let provider = self.clone();
        tokio::spawn(async move {
            let _flag = RefreshFlag(provider.state.clone());
            provider.refresh_spaced().await;
        });
    }
}

#[async_trait]
impl KeyProvider for JwksKeyProvider {
    async fn decoding_key(&self, issuer: Option<&str>, key_id: Option<&str>) -> Option<Arc<DecodingKey>> {
        if let Some(pinned) = self.issuer.as_deref() {
            if issuer != Some(pinned) {
                tracing::debug!(issuer = ?issuer, "token issuer does not match JWKS issuer");
                return None;
            }
        }

        let (found, fetched_at) = {
            let keys = self.state.keys.read().await;
            (keys.find(key_id), keys.fetched_at)
        };
        match fetched_at {
            // Nothing loaded yet: the lookup has to wait for keys.
            None => {
                self.refresh_spaced().await;
                return self.state.keys.read().await.find(key_id);
            }
            Some(at) if at.elapsed() >= self.refresh_interval => self.refresh_in_background(),
            Some(_) => {}
        }
        if found.is_some() {
            return found;
        }

        // Unknown kid: the issuer may have rotated keys since the last fetch.
        self.refresh_spaced().await;
        self.state.keys.read().await.find(key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_single_secret_matches_everything() {
        let provider = StaticKeyProvider::from_secret(b"secret");
        assert!(provider.decoding_key(None, None).await.is_some());
        assert!(provider.decoding_key(Some("https://any"), Some("kid-1")).await.is_some());
    }

    #[tokio::test]
    async fn test_static_issuer_scoped_keys() {
        let provider = StaticKeyProvider::new()
            .key(Some("https://a"), Some("k1"), DecodingKey::from_secret(b"a-k1"))
            .key(Some("https://b"), None, DecodingKey::from_secret(b"b-any"));

        assert!(provider.decoding_key(Some("https://a"), Some("k1")).await.is_some());
        assert!(provider.decoding_key(Some("https://a"), Some("k2")).await.is_none());
        assert!(provider.decoding_key(Some("https://b"), Some("whatever")).await.is_some());
        assert!(provider.decoding_key(Some("https://c"), Some("k1")).await.is_none());
        assert!(provider.decoding_key(None, None).await.is_none());
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_invalid_pem_is_an_error() {
        assert!(StaticKeyProvider::from_rsa_pem(b"not a pem").is_err());
        assert!(StaticKeyProvider::from_ec_pem(b"not a pem").is_err());
    }

    #[test]
    fn test_keyset_without_kid_needs_single_key() {
        let mut set = KeySet::default();
        assert!(set.find(None).is_none());
        set.anonymous.push(Arc::new(DecodingKey::from_secret(b"one")));
        assert!(set.find(None).is_some());
        set.by_kid.insert("k".into(), Arc::new(DecodingKey::from_secret(b"two")));
        assert!(set.find(None).is_none());
        assert!(set.find(Some("k")).is_some());
    }

    #[test]
    fn test_refresh_spacing_never_exceeds_refresh_interval() {
        let provider = JwksKeyProvider::new(reqwest::Client::new(), "http://127.0.0.1:9/jwks");
        assert_eq!(provider.refresh_spacing(), DEFAULT_MIN_REFRESH);

        let provider = provider.refresh_interval(Duration::from_secs(10));
        assert_eq!(provider.refresh_spacing(), Duration::from_secs(10));

        let provider = provider.min_refresh_interval(Duration::from_secs(2));
        assert_eq!(provider.refresh_spacing(), Duration::from_secs(2));
    }
}
