use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::models::token::{digest, fingerprint};
use crate::models::verdict::VerificationResult;
use crate::verifier::TokenVerifier;

/// TTL and capacity bounds for [`IntrospectionCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Lifetime of a `Valid` entry. Also capped by the token's own expiry.
    pub positive_ttl: Duration,
    /// Lifetime of an `Invalid` entry. Zero disables negative caching.
    pub negative_ttl: Duration,
    pub max_entries: usize,
    /// Serve the last known claims when the upstream is unreachable, as long
    /// as those claims have not themselves expired.
    pub fail_open: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            max_entries: 10_000,
            fail_open: false,
        }
    }
}

/// Entry stored in the DashMap with its insertion time and TTL.
#[derive(Clone)]
struct CacheEntry {
    result: VerificationResult,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
    /// SHA-256 of the bare token, so `invalidate` can find every
    /// issuer/audience variant of one token.
    token_digest: String,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }

    /// A positive entry whose claims are still within their own lifetime.
    fn usable_when_stale(&self) -> bool {
        matches!(&self.result, VerificationResult::Valid(claims) if !claims.is_expired_at(Utc::now()))
    }
}

type InFlight = Shared<BoxFuture<'static, VerificationResult>>;

/// Clears a key's in-flight marker when the verification task ends, including
/// by panic, so later callers start a fresh verification.
struct InFlightMarker {
    inner: Arc<CacheInner>,
    key: String,
}

impl Drop for InFlightMarker {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

struct CacheInner {
    verifier: Arc<dyn TokenVerifier>,
    settings: CacheSettings,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, InFlight>,
    /// Insertion order for capacity eviction. May hold keys that were
    /// replaced or removed since; those are skipped by `seq`.
    order: Mutex<VecDeque<(String, u64)>>,
    next_seq: AtomicU64,
    /// Bumped by `invalidate`; results started under an older epoch are not
    /// stored.
    epoch: AtomicU64,
}

/// Caching, coalescing wrapper around a (remote) token verifier.
///
/// - keyed by a SHA-256 of issuer, audience and token; raw tokens are never
///   kept as keys
/// - at most one verification in flight per key; concurrent callers share it
/// - the in-flight verification runs on its own task, so a cancelled caller
///   does not abort it and its result still lands in the cache
/// - `Valid` entries live for `positive_ttl` (capped at the token's expiry),
///   `Invalid` entries for `negative_ttl`, `TransientError` is never stored
/// - oldest-inserted entries are evicted past `max_entries`
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IntrospectionCache {
    inner: Arc<CacheInner>,
}

impl IntrospectionCache {
    pub fn new(verifier: impl TokenVerifier + 'static, settings: CacheSettings) -> Self {
        Self::from_arc(Arc::new(verifier), settings)
    }

    pub fn from_arc(verifier: Arc<dyn TokenVerifier>, settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                verifier,
                settings,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                order: Mutex::new(VecDeque::new()),
                next_seq: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Return the cached result for `token`, or verify it once and cache it.
    pub async fn get_or_verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult {
        let key = cache_key(token, expected_issuer, expected_audience);

        if let Some(hit) = self.inner.fresh(&key) {
            tracing::debug!(token = %fingerprint(token), "introspection cache hit");
            return hit;
        }

        let flight = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(token = %fingerprint(token), "joining in-flight introspection");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                // Another caller may have stored a result between our first
                // lookup and taking the slot.
                if let Some(hit) = self.inner.fresh(&key) {
                    return hit;
                }
                let flight = self.inner.clone().spawn_verification(
                    key,
                    Zeroizing::new(token.to_owned()),
                    expected_issuer.map(String::from),
                    expected_audience.map(String::from),
                );
                slot.insert(flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Drop every cached result for `token` (all issuer/audience variants).
    /// Verifications already in flight complete but are not stored.
    pub fn invalidate(&self, token: &str) -> usize {
        let token_digest = digest(token);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.token_digest != token_digest);
        let removed = before.saturating_sub(self.inner.entries.len());
        tracing::info!(token = %fingerprint(token), removed, "introspection cache entries invalidated");
        removed
    }

    /// Remove all expired entries. Call this periodically from a background
    /// task to bound memory. Under fail-open, positive entries whose claims
    /// are still unexpired are kept as fallbacks.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let fail_open = self.inner.settings.fail_open;
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.is_fresh(now) || (fail_open && entry.usable_when_stale()));
        before.saturating_sub(self.inner.entries.len())
    }

    /// Current number of entries, fresh or not yet swept.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl CacheInner {
    fn fresh(&self, key: &str) -> Option<VerificationResult> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_fresh(now) {
            return Some(entry.result.clone());
        }
        let keep = self.settings.fail_open && entry.usable_when_stale();
        // release the shard lock before removing
        drop(entry);
        if !keep {
            self.entries.remove_if(key, |_, e| !e.is_fresh(now));
        }
        None
    }

    fn spawn_verification(
        self: Arc<Self>,
        key: String,
        token: Zeroizing<String>,
        issuer: Option<String>,
        audience: Option<String>,
    ) -> InFlight {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let marker = InFlightMarker { inner: self, key };
            let result = marker
                .inner
                .verifier
                .verify(&token, issuer.as_deref(), audience.as_deref())
                .await;
            marker.inner.settle(&marker.key, &token, epoch, result)
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => VerificationResult::TransientError(format!("verification task failed: {}", err)),
            }
        }
        .boxed()
        .shared()
    }

    /// Store a fresh result, or fall back to stale claims under fail-open.
    fn settle(&self, key: &str, token: &str, epoch: u64, result: VerificationResult) -> VerificationResult {
        let ttl = match &result {
            VerificationResult::Valid(claims) => {
                let remaining = (claims.expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.settings.positive_ttl.min(remaining)
            }
            VerificationResult::Invalid(_) => self.settings.negative_ttl,
            VerificationResult::TransientError(reason) => return self.fallback(key, token, reason, result.clone()),
        };

        if ttl.is_zero() {
            return result;
        }
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(token = %fingerprint(token), "cache invalidated during verification, result not stored");
            return result;
        }
        self.store(key, token, result.clone(), ttl);
        result
    }

    fn fallback(&self, key: &str, token: &str, reason: &str, result: VerificationResult) -> VerificationResult {
        if !self.settings.fail_open {
            return result;
        }
        let stale = self
            .entries
            .get(key)
            .filter(|entry| entry.usable_when_stale())
            .map(|entry| entry.result.clone());
        match stale {
            Some(claims) => {
                tracing::warn!(
                    token = %fingerprint(token),
                    reason = %reason,
                    "introspection unavailable, failing open with previously cached claims"
                );
                claims
            }
            None => result,
        }
    }

    fn store(&self, key: &str, token: &str, result: VerificationResult, ttl: Duration) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                ttl,
                seq,
                token_digest: digest(token),
            },
        );

        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.push_back((key.to_string(), seq));

        while self.entries.len() > self.settings.max_entries {
            let Some((oldest, oldest_seq)) = order.pop_front() else {
                break;
            };
            if self.entries.remove_if(&oldest, |_, e| e.seq == oldest_seq).is_some() {
                tracing::debug!("introspection cache full, evicted oldest entry");
            }
        }

        // Replaced and invalidated keys leave stale markers behind.
        if order.len() > self.settings.max_entries.saturating_mul(2).max(64) {
            order.retain(|(k, s)| self.entries.get(k).map_or(false, |e| e.seq == *s));
        }
    }
}

#[async_trait]
impl TokenVerifier for IntrospectionCache {
    async fn verify(
        &self,
        token: &str,
        expected_issuer: Option<&str>,
        expected_audience: Option<&str>,
    ) -> VerificationResult {
        self.get_or_verify(token, expected_issuer, expected_audience).await
    }
}

fn cache_key(token: &str, issuer: Option<&str>, audience: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for part in [issuer.unwrap_or(""), audience.unwrap_or(""), token] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
