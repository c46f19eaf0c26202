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

//! Fixed-window request limiting.
//!
//! A window starts on the first request for a key and lasts `rule.window`.
//! Requests inside it are counted; once it has elapsed the next request
//! replaces the bucket with a fresh one. Bursts straddling two windows can
//! therefore see up to twice `max` requests, in exchange for constant memory
//! and work per key.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{
    config::RateLimitRule, counter::CounterStore, error::CounterError, filename::percent_encode,
    service::Route, tenant::TenantId,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub tenant: TenantId,
    /// Client address as seen by the HTTP layer.
    pub client: String,
    pub route:  Route,
}

impl RateLimitKey {
    pub fn new(tenant: TenantId, client: impl Into<String>, route: Route) -> Self {
        Self {
            tenant,
            client: client.into(),
            route,
        }
    }
}

/// Keeps `/` out of key segments so that tenant and client stay separable.
fn escape_segment(segment: &str) -> String { percent_encode(segment, |b| b != b'/' && b != b'%') }

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ratelimit/{}/{}/{}",
            self.route,
            escape_segment(self.tenant.as_str()),
            escape_segment(&self.client)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed:   bool,
    pub limit:     u64,
    pub remaining: u64,
    pub reset_at:  DateTime<Utc>,
}

impl RateLimitDecision {
    /// Time until the window resets, as seen at `now`.
    #[must_use]
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self { Self { store } }

    pub fn check(
        &self,
        key: &RateLimitKey,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision, CounterError> {
        self.check_at(key, rule, Utc::now())
    }

    pub fn check_at(
        &self,
        key: &RateLimitKey,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, CounterError> {
        let window_end = TimeDelta::from_std(rule.window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let bucket = self
            .store
            .increment(&key.to_string(), 1, now, window_end)?;
        Ok(RateLimitDecision {
            allowed:   bucket.value <= rule.max,
            limit:     rule.max,
            remaining: rule.max.saturating_sub(bucket.value),
            reset_at:  bucket.reset_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::counter::MemoryCounterStore;

    fn limiter() -> RateLimiter { RateLimiter::new(Arc::new(MemoryCounterStore::default())) }

    fn ms(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + offset).unwrap()
    }

    fn key(tenant: &str, client: &str) -> RateLimitKey {
        RateLimitKey::new(tenant.into(), client, Route::File)
    }

    #[test]
    fn test_fixed_window_admits_max_then_resets() {
        let limiter = limiter();
        let rule = RateLimitRule::new(Duration::from_millis(1000), 3);
        let key = key("acme", "10.0.0.1");

        let allowed: Vec<bool> = [0, 100, 500, 999]
            .into_iter()
            .map(|offset| limiter.check_at(&key, rule, ms(offset)).unwrap().allowed)
            .collect();
        assert_eq!(allowed, [true, true, true, false]);

        let after_reset = limiter.check_at(&key, rule, ms(1000)).unwrap();
        assert!(after_reset.allowed);
        assert_eq!(after_reset.remaining, 2);
        assert_eq!(after_reset.reset_at, ms(2000));
    }

    #[test]
    fn test_window_is_anchored_at_first_request() {
        let limiter = limiter();
        let rule = RateLimitRule::new(Duration::from_secs(60), 2);
        let key = key("acme", "10.0.0.1");

        let first = limiter.check_at(&key, rule, ms(0)).unwrap();
        let second = limiter.check_at(&key, rule, ms(30_000)).unwrap();
        assert_eq!(first.reset_at, second.reset_at);
        assert_eq!(second.remaining, 0);
        assert!(second.allowed);

        let third = limiter.check_at(&key, rule, ms(59_999)).unwrap();
        assert!(!third.allowed);
        assert_eq!(third.retry_after(ms(59_999)), Duration::from_millis(1));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter();
        let rule = RateLimitRule::new(Duration::from_secs(1), 1);

        assert!(limiter.check_at(&key("acme", "10.0.0.1"), rule, ms(0)).unwrap().allowed);
        assert!(!limiter.check_at(&key("acme", "10.0.0.1"), rule, ms(1)).unwrap().allowed);
        assert!(limiter.check_at(&key("acme", "10.0.0.2"), rule, ms(1)).unwrap().allowed);
        assert!(limiter.check_at(&key("initech", "10.0.0.1"), rule, ms(1)).unwrap().allowed);

        let archive = RateLimitKey::new("acme".into(), "10.0.0.1", Route::Archive);
        assert!(limiter.check_at(&archive, rule, ms(1)).unwrap().allowed);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(key("acme", "10.0.0.1").to_string(), "ratelimit/file/acme/10.0.0.1");
        assert_eq!(key("a/b", "c").to_string(), "ratelimit/file/a%2Fb/c");
        assert_eq!(key("a", "b/c").to_string(), "ratelimit/file/a/b%2Fc");
        assert_eq!(key("a%2Fb", "c").to_string(), "ratelimit/file/a%252Fb/c");
    }

    #[test]
    fn test_slashes_do_not_merge_buckets() {
        let limiter = limiter();
        let rule = RateLimitRule::new(Duration::from_secs(1), 1);
        assert!(limiter.check_at(&key("a/b", "c"), rule, ms(0)).unwrap().allowed);
        assert!(limiter.check_at(&key("a", "b/c"), rule, ms(0)).unwrap().allowed);
        assert!(!limiter.check_at(&key("a/b", "c"), rule, ms(1)).unwrap().allowed);
    }
}
