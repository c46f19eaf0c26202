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

use std::{any::Any, time::Duration};

use chrono::{DateTime, Utc};
use dlgate_error::{ErrorExt, StackError, StatusCode};
use snafu::Snafu;
use strum::EnumProperty;

use crate::tenant::{TenantId, Tier};

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the object store collaborator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    #[snafu(display("Object {key} does not exist"))]
    ObjectNotFound { key: String },

    #[snafu(display("Object store unavailable while accessing {key}"))]
    Unavailable { key: String, source: BoxedError },
}

impl StorageError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool { matches!(self, Self::ObjectNotFound { .. }) }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CounterError {
    #[snafu(display("Counter store failure on {key}"))]
    Sled { key: String, source: sled::Error },

    #[snafu(display("Counter entry {key} is corrupt"))]
    Corrupt { key: String },

    #[snafu(display("Failed to open counter store at {path}"))]
    OpenStore { path: String, source: sled::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EgressError {
    #[snafu(display("Tenant {tenant} has no billing record"))]
    TenantNotFound { tenant: TenantId },

    #[snafu(transparent)]
    Counter { source: CounterError },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ArchiveError {
    #[snafu(display("Failed to open {key} for archiving"))]
    OpenSource { key: String, source: StorageError },

    #[snafu(display("Failed reading {key} mid-archive"))]
    ReadSource { key: String, source: std::io::Error },

    #[snafu(display("Failed to write archive entry {name}"))]
    WriteEntry {
        name:   String,
        source: async_zip::error::ZipError,
    },

    #[snafu(display("Failed to write data of archive entry {name}"))]
    WriteData { name: String, source: std::io::Error },

    #[snafu(display("Failed to finalize archive"))]
    Finalize { source: async_zip::error::ZipError },

    #[snafu(display("Archive pipe failed"))]
    Pipe { source: std::io::Error },

    #[snafu(display("Archive producer stopped unexpectedly"))]
    Producer { source: tokio::task::JoinError },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SignError {
    #[snafu(display("Cannot sign an empty object key"))]
    EmptyKey,

    #[snafu(display("Invalid signing secret"))]
    InvalidSecret { source: hmac::digest::InvalidLength },

    #[snafu(display("Signed URL expiry {url_ttl:?} is out of range"))]
    ExpiryOutOfRange { url_ttl: Duration },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NotifyError {
    #[snafu(display("Webhook request to {url} failed"))]
    Webhook { url: String, source: reqwest::Error },

    #[snafu(display("Webhook {url} answered {status}"))]
    WebhookStatus { url: String, status: u16 },
}

/// Problems detected while validating download settings at startup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display(
        "Presigned URL cache TTL {cache_ttl:?} must be strictly shorter than URL TTL {url_ttl:?}"
    ))]
    CacheTtlNotShorter {
        cache_ttl: Duration,
        url_ttl:   Duration,
    },

    #[snafu(display("Rate limit rule for {route} is invalid: {reason}"))]
    InvalidRule { route: String, reason: String },

    #[snafu(display("Egress policy is invalid: {reason}"))]
    InvalidEgressPolicy { reason: String },

    #[snafu(display("Archive buffer size must be positive"))]
    ZeroArchiveBuffer,

    #[snafu(display("Failed to prepare storage root {path}"))]
    StorageRoot {
        path:   String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to build storage backend"))]
    StorageBackend { source: object_store::Error },

    #[snafu(transparent)]
    Counter { source: CounterError },
}

/// Everything a download request can fail with.
///
/// The `status_code` property decides the HTTP answer. Only the expected
/// outcomes carry client-facing detail; the rest are reported generically.
#[derive(Debug, Snafu, strum_macros::EnumProperty)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("Authentication required"))]
    #[strum(props(status_code = "unauthorized"))]
    Unauthenticated,

    /// Unknown and foreign objects are deliberately indistinguishable.
    #[snafu(display("Not found"))]
    #[strum(props(status_code = "not_found"))]
    NotFound,

    #[snafu(display(
        "Too many {route} requests: at most {limit} per window, try again in {}s",
        retry_after.as_secs().max(1)
    ))]
    #[strum(props(status_code = "too_many_requests"))]
    RateLimited {
        route:       &'static str,
        limit:       u64,
        retry_after: Duration,
    },

    #[snafu(display(
        "Monthly download quota reached: {used_bytes} of {hard_limit_bytes} bytes used this period. Upgrade your plan to keep downloading before {reset_at}"
    ))]
    #[strum(props(status_code = "too_many_requests"))]
    QuotaExceeded {
        used_bytes:       u64,
        requested_bytes:  u64,
        hard_limit_bytes: u64,
        reset_at:         DateTime<Utc>,
    },

    #[snafu(display("Archive downloads are not included in the {tier} plan. Upgrade to download whole versions"))]
    #[strum(props(status_code = "forbidden"))]
    PlanRestricted { tier: Tier },

    /// Expired and forged links are indistinguishable.
    #[snafu(display("This download link is invalid or has expired. Request a new one"))]
    #[strum(props(status_code = "forbidden"))]
    LinkRejected,

    #[snafu(display("Storage unavailable"))]
    #[strum(props(status_code = "service_unavailable"))]
    StorageUnavailable {
        source: StorageError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Archive aborted"))]
    #[strum(props(status_code = "internal"))]
    ArchiveAborted {
        source: ArchiveError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Tenant {tenant} is misconfigured"))]
    #[strum(props(status_code = "internal"))]
    TenantMisconfigured {
        tenant: TenantId,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Counter store failure"))]
    #[strum(props(status_code = "internal"))]
    Counter {
        source: CounterError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Failed to sign URL"))]
    #[strum(props(status_code = "internal"))]
    Signing {
        source: SignError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

impl DownloadError {
    /// Seconds a client should wait before retrying, for 429 outcomes.
    #[must_use]
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::QuotaExceeded { reset_at, .. } => (*reset_at - now).to_std().ok(),
            _ => None,
        }
    }
}

impl From<EgressError> for DownloadError {
    fn from(error: EgressError) -> Self {
        let loc = snafu::location!();
        match error {
            EgressError::TenantNotFound { tenant } => Self::TenantMisconfigured { tenant, loc },
            EgressError::Counter { source } => Self::Counter { source, loc },
        }
    }
}

impl ErrorExt for DownloadError {
    fn status_code(&self) -> StatusCode {
        self.get_str("status_code")
            .and_then(|value| value.parse().ok())
            .unwrap_or(StatusCode::Unknown)
    }

    fn as_any(&self) -> &dyn Any { self as _ }
}

impl StackError for DownloadError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        match self {
            Self::StorageUnavailable { loc, .. }
            | Self::ArchiveAborted { loc, .. }
            | Self::TenantMisconfigured { loc, .. }
            | Self::Counter { loc, .. }
            | Self::Signing { loc, .. } => buf.push(format!("{layer}: {self}, at {loc}")),
            _ => buf.push(format!("{layer}: {self}")),
        }
        let mut source = std::error::Error::source(self);
        let mut depth = layer;
        while let Some(cause) = source {
            depth += 1;
            buf.push(format!("{depth}: {cause}"));
            source = cause.source();
        }
    }

    fn next(&self) -> Option<&dyn StackError> { None }
}
