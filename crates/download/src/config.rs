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

use std::time::Duration;

use dlgate_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    egress::EgressPolicy,
    error::{
        CacheTtlNotShorterSnafu, ConfigError, InvalidEgressPolicySnafu, InvalidRuleSnafu,
        ZeroArchiveBufferSnafu,
    },
    service::Route,
};

/// Default bounded pipe size between the archive writer and the response.
pub const DEFAULT_ARCHIVE_BUFFER_SIZE: ReadableSize = ReadableSize::kb(64);

/// Settings of the metered download subsystem.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(default)]
pub struct DownloadConfig {
    #[builder(default)]
    pub rate_limits: RouteLimits,
    #[builder(default)]
    pub egress:      EgressPolicy,
    #[builder(default)]
    pub archive:     ArchiveConfig,
    #[builder(default)]
    pub presign:     PresignConfig,
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for route in Route::ALL {
            self.rate_limits.rule(route).validate(route)?;
        }
        self.egress.validate()?;
        ensure!(self.archive.buffer_size.as_bytes() > 0, ZeroArchiveBufferSnafu);
        self.presign.validate()
    }
}

/// One fixed-window rule: at most `max` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct RateLimitRule {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max:    u64,
}

impl RateLimitRule {
    #[must_use]
    pub const fn new(window: Duration, max: u64) -> Self { Self { window, max } }

    fn validate(self, route: Route) -> Result<(), ConfigError> {
        ensure!(
            !self.window.is_zero(),
            InvalidRuleSnafu {
                route:  route.as_str(),
                reason: "window must be positive",
            }
        );
        ensure!(
            self.max > 0,
            InvalidRuleSnafu {
                route:  route.as_str(),
                reason: "max must be positive",
            }
        );
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct RouteLimits {
    #[default(_code = "RateLimitRule::new(Duration::from_secs(60), 60)")]
    pub file:    RateLimitRule,
    #[default(_code = "RateLimitRule::new(Duration::from_secs(60), 20)")]
    pub archive: RateLimitRule,
    #[default(_code = "RateLimitRule::new(Duration::from_secs(60), 120)")]
    pub link:    RateLimitRule,
}

impl RouteLimits {
    #[must_use]
    pub const fn rule(&self, route: Route) -> RateLimitRule {
        match route {
            Route::File => self.file,
            Route::Archive => self.archive,
            Route::Link => self.link,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    Stored,
    #[default]
    Deflate,
}

impl From<ArchiveCompression> for async_zip::Compression {
    fn from(compression: ArchiveCompression) -> Self {
        match compression {
            ArchiveCompression::Stored => Self::Stored,
            ArchiveCompression::Deflate => Self::Deflate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Capacity of the pipe the archive writer fills and the response drains.
    #[default(_code = "DEFAULT_ARCHIVE_BUFFER_SIZE")]
    pub buffer_size: ReadableSize,
    pub compression: ArchiveCompression,
}

/// Presigned URL minting and caching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct PresignConfig {
    /// Prefix of every minted URL: the public address of the server's
    /// `/objects` route.
    #[default = "http://127.0.0.1:3000/objects"]
    pub base_url:  String,
    /// HMAC secret. Left empty, a random secret is generated per process.
    #[serde(skip_serializing)]
    pub secret:    String,
    #[default(_code = "Duration::from_secs(15 * 60)")]
    #[serde(with = "humantime_serde")]
    pub url_ttl:   Duration,
    #[default(_code = "Duration::from_secs(10 * 60)")]
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl PresignConfig {
    /// A cached URL must expire in the cache before the store rejects it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.cache_ttl < self.url_ttl,
            CacheTtlNotShorterSnafu {
                cache_ttl: self.cache_ttl,
                url_ttl:   self.url_ttl,
            }
        );
        Ok(())
    }
}
