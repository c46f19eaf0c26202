// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Time-limited retrieval URLs and the cache in front of their minting.
//!
//! A minted URL is reusable until it expires, so hot objects (thumbnails
//! fetched by many viewers) are signed once per cache TTL. The cache TTL is
//! shorter than the URL TTL and a cached entry is additionally clamped to the
//! URL's own expiry, so the cache never hands out a URL the store rejects.

use std::{fmt, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use snafu::{OptionExt, ResultExt, ensure};

use crate::{
    config::PresignConfig,
    error::{EmptyKeySnafu, ExpiryOutOfRangeSnafu, InvalidSecretSnafu, SignError},
    filename::percent_encode,
    metrics,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PresignedUrl {
    pub url:        String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct CachedUrl {
    url:          PresignedUrl,
    cached_until: DateTime<Utc>,
}

impl CachedUrl {
    fn new(url: PresignedUrl, ttl: Duration, now: DateTime<Utc>) -> Self {
        let cached_until = add(now, ttl).min(url.expires_at);
        Self { url, cached_until }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool { now < self.cached_until }
}

fn add(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Object key to presigned URL, with per-entry expiry.
#[derive(Debug, Default)]
pub struct PresignedUrlCache {
    entries: DashMap<String, CachedUrl>,
}

impl PresignedUrlCache {
    pub fn get(&self, key: &str) -> Option<PresignedUrl> { self.get_at(key, Utc::now()) }

    /// Expired entries are indistinguishable from absent ones, including at
    /// the exact expiry instant.
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<PresignedUrl> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.url.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    pub fn put(&self, key: impl Into<String>, url: PresignedUrl, ttl: Duration) {
        self.put_at(key, url, ttl, Utc::now());
    }

    pub fn put_at(&self, key: impl Into<String>, url: PresignedUrl, ttl: Duration, now: DateTime<Utc>) {
        self.entries.insert(key.into(), CachedUrl::new(url, ttl, now));
    }

    /// Returns the cached URL or stores the one produced by `mint`. Concurrent
    /// callers for one key mint once.
    pub fn get_or_try_insert_at<E>(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
        mint: impl FnOnce() -> Result<PresignedUrl, E>,
    ) -> Result<(PresignedUrl, bool), E> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(occupied) if occupied.get().is_live(now) => {
                Ok((occupied.get().url.clone(), true))
            }
            entry => {
                let url = mint()?;
                entry.insert(CachedUrl::new(url.clone(), ttl, now));
                Ok((url, false))
            }
        }
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            purged += usize::from(!live);
            live
        });
        purged
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

pub trait UrlSigner: Send + Sync + fmt::Debug {
    fn sign(&self, key: &str, expires_at: DateTime<Utc>) -> Result<PresignedUrl, SignError>;

    /// Checks a signature minted by [`UrlSigner::sign`] for `key`, rejecting
    /// it from `expires` on.
    fn verify(&self, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool;
}

/// Signs `GET\n{key}\n{expires}` with HMAC-SHA256.
///
/// URLs look like `{base_url}/{key}?expires={unix}&signature={b64url}`. The
/// server redeems them on its `/objects/{key}` route, so `base_url` should
/// point there.
pub struct HmacUrlSigner {
    base_url: String,
    secret:   Vec<u8>,
}

impl fmt::Debug for HmacUrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacUrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HmacUrlSigner {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret:   secret.into(),
        }
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, SignError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).context(InvalidSecretSnafu)?;
        mac.update(format!("GET\n{key}\n{expires}").as_bytes());
        Ok(mac)
    }
}

impl UrlSigner for HmacUrlSigner {
    fn sign(&self, key: &str, expires_at: DateTime<Utc>) -> Result<PresignedUrl, SignError> {
        let key = key.trim_start_matches('/');
        ensure!(!key.is_empty(), EmptyKeySnafu);
        let expires = expires_at.timestamp();
        let signature = URL_SAFE_NO_PAD.encode(self.mac(key, expires)?.finalize().into_bytes());
        let path = percent_encode(key, |b| b.is_ascii_alphanumeric() || b"-_.~/".contains(&b));
        Ok(PresignedUrl {
            url:        format!("{}/{path}?expires={expires}&signature={signature}", self.base_url),
            // Whole seconds, matching what the signature covers.
            expires_at: DateTime::from_timestamp(expires, 0).unwrap_or(expires_at),
        })
    }

    fn verify(&self, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        self.mac(key.trim_start_matches('/'), expires)
            .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
    }
}

/// Mints presigned URLs through the cache.
#[derive(Debug, Clone)]
pub struct PresignedUrlIssuer {
    signer:    Arc<dyn UrlSigner>,
    cache:     Arc<PresignedUrlCache>,
    url_ttl:   Duration,
    cache_ttl: Duration,
}

impl PresignedUrlIssuer {
    pub fn new(signer: Arc<dyn UrlSigner>, url_ttl: Duration, cache_ttl: Duration) -> Self {
        Self {
            signer,
            cache: Arc::new(PresignedUrlCache::default()),
            url_ttl,
            cache_ttl,
        }
    }

    /// Issuer with an HMAC signer. An empty secret yields a random one, which
    /// invalidates every URL on restart.
    pub fn from_config(config: &PresignConfig) -> Self {
        let secret = if config.secret.is_empty() {
            tracing::warn!("No presign secret configured, using an ephemeral one");
            uuid::Uuid::new_v4().to_string()
        } else {
            config.secret.clone()
        };
        Self::new(
            Arc::new(HmacUrlSigner::new(&config.base_url, secret)),
            config.url_ttl,
            config.cache_ttl,
        )
    }

    pub fn issue(&self, key: &str) -> Result<PresignedUrl, SignError> { self.issue_at(key, Utc::now()) }

    pub fn issue_at(&self, key: &str, now: DateTime<Utc>) -> Result<PresignedUrl, SignError> {
        let (url, hit) = self.cache.get_or_try_insert_at(key, self.cache_ttl, now, || {
            let expires_at = TimeDelta::from_std(self.url_ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .context(ExpiryOutOfRangeSnafu {
                    url_ttl: self.url_ttl,
                })?;
            self.signer.sign(key, expires_at)
        })?;
        let outcome = if hit { "hit" } else { "miss" };
        metrics::PRESIGN_CACHE.with_label_values(&[outcome]).inc();
        Ok(url)
    }

    /// Whether a link presented at `now` was minted by this issuer's signer
    /// and is still valid.
    #[must_use]
    pub fn verify_at(&self, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        self.signer.verify(key, expires, signature, now)
    }

    pub fn cache(&self) -> &PresignedUrlCache { &self.cache }
}
