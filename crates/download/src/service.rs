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

//! Per-request orchestration: authenticate, rate-limit, resolve, account,
//! stream.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use dlgate_error::ErrorExt;
use futures::future::try_join_all;
use serde::Serialize;
use snafu::{IntoError, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::{
    archive::{ArchiveBody, ArchiveStreamer},
    catalog::{Catalog, CatalogEntry},
    config::{DownloadConfig, RouteLimits},
    counter::CounterStore,
    egress::{EgressMeter, TenantEgressCounter, TransferContext},
    error::{
        ArchiveAbortedSnafu, ArchiveError, CounterSnafu, DownloadError, DownloadResult,
        LinkRejectedSnafu, NotFoundSnafu, PlanRestrictedSnafu, SigningSnafu, StorageError, StorageUnavailableSnafu,
        TenantMisconfiguredSnafu, UnauthenticatedSnafu,
    },
    filename::{content_type_for, sanitize_filename},
    metrics,
    notifier::Notifier,
    presign::{PresignedUrl, PresignedUrlIssuer, UrlSigner},
    rate_limiter::{RateLimitDecision, RateLimitKey, RateLimiter},
    storage::{ByteStream, ObjectDescriptor, Storage},
    tenant::{TenantDirectory, TenantId},
};

/// Rate limited download routes.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Route {
    File,
    Archive,
    Link,
}

impl Route {
    pub const ALL: [Self; 3] = [Self::File, Self::Archive, Self::Link];

    #[must_use]
    pub fn as_str(self) -> &'static str { self.into() }
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requester {
    pub tenant: TenantId,
    /// Client address used for rate limiting.
    pub client: String,
}

pub struct FileDownload {
    pub file_name:    String,
    pub content_type: &'static str,
    pub size:         u64,
    /// Absent for presigned link redemptions, which are not rate limited.
    pub rate_limit:   Option<RateLimitDecision>,
    pub body:         ByteStream,
}

impl fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDownload")
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub struct ArchiveDownload {
    pub file_name:   String,
    pub entries:     usize,
    /// Sum of the uncompressed entry sizes, as accounted.
    pub total_bytes: u64,
    pub rate_limit:  RateLimitDecision,
    pub body:        ArchiveBody,
}

impl fmt::Debug for ArchiveDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveDownload")
            .field("file_name", &self.file_name)
            .field("entries", &self.entries)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PresignedLink {
    #[serde(flatten)]
    pub url:        PresignedUrl,
    #[serde(skip)]
    pub rate_limit: Option<RateLimitDecision>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub counters: usize,
    pub links:    usize,
}

/// The application side collaborators a [`DownloadService`] consumes.
#[derive(Clone, Debug, bon::Builder)]
pub struct Collaborators {
    pub tenants:  Arc<dyn TenantDirectory>,
    pub catalog:  Arc<dyn Catalog>,
    pub storage:  Arc<dyn Storage>,
    pub counters: Arc<dyn CounterStore>,
    pub notifier: Arc<dyn Notifier>,
    /// Defaults to an HMAC signer built from the presign settings.
    pub signer:   Option<Arc<dyn UrlSigner>>,
}

#[derive(Debug, Clone)]
pub struct DownloadService {
    tenants:  Arc<dyn TenantDirectory>,
    catalog:  Arc<dyn Catalog>,
    storage:  Arc<dyn Storage>,
    counters: Arc<dyn CounterStore>,
    limiter:  RateLimiter,
    meter:    EgressMeter,
    archives: ArchiveStreamer,
    links:    PresignedUrlIssuer,
    limits:   RouteLimits,
}

impl DownloadService {
    pub fn new(config: DownloadConfig, parts: Collaborators) -> Self {
        let links = match parts.signer {
            Some(signer) => PresignedUrlIssuer::new(
                signer,
                config.presign.url_ttl,
                config.presign.cache_ttl,
            ),
            None => PresignedUrlIssuer::from_config(&config.presign),
        };
        Self {
            limiter: RateLimiter::new(Arc::clone(&parts.counters)),
            meter: EgressMeter::new(
                Arc::clone(&parts.counters),
                Arc::clone(&parts.tenants),
                parts.notifier,
                config.egress,
            ),
            archives: ArchiveStreamer::new(Arc::clone(&parts.storage), config.archive),
            links,
            limits: config.rate_limits,
            tenants: parts.tenants,
            catalog: parts.catalog,
            storage: parts.storage,
            counters: parts.counters,
        }
    }

    /// Resolves the tenant behind a session credential.
    pub fn authenticate(&self, session_token: Option<&str>) -> DownloadResult<TenantId> {
        session_token
            .and_then(|token| self.tenants.resolve_tenant(token))
            .context(UnauthenticatedSnafu)
    }

    pub async fn download_file(
        &self,
        requester: &Requester,
        file_id: &str,
    ) -> DownloadResult<FileDownload> {
        let result = self.file(requester, file_id).await;
        record(Route::File.as_str(), &result);
        result
    }

    async fn file(&self, requester: &Requester, file_id: &str) -> DownloadResult<FileDownload> {
        let rate_limit = self.rate_limit(requester, Route::File)?;
        let entry = self.resolve_file(&requester.tenant, file_id).await?;
        let size = self
            .storage
            .size(&entry.storage_key)
            .await
            .map_err(|error| storage_error(&entry.tenant, error))?;

        let context = TransferContext {
            route:   Route::File,
            objects: 1,
        };
        self.admit(&requester.tenant, size, context)?;

        let body = self
            .storage
            .open_read_stream(&entry.storage_key)
            .await
            .map_err(|error| storage_error(&entry.tenant, error))?;
        let file_name = sanitize_filename(&entry.display_name);
        Ok(FileDownload {
            content_type: content_type_for(&file_name),
            file_name,
            size,
            rate_limit: Some(rate_limit),
            body,
        })
    }

    pub async fn download_archive(
        &self,
        requester: &Requester,
        version_id: &str,
    ) -> DownloadResult<ArchiveDownload> {
        let result = self.archive(requester, version_id).await;
        record(Route::Archive.as_str(), &result);
        result
    }

    async fn archive(&self, requester: &Requester, version_id: &str) -> DownloadResult<ArchiveDownload> {
        let tenant = &requester.tenant;
        let rate_limit = self.rate_limit(requester, Route::Archive)?;
        let tier = self
            .tenants
            .tier_of(tenant)
            .context(TenantMisconfiguredSnafu {
                tenant: tenant.clone(),
            })?;
        if !tier.includes_archives() {
            return PlanRestrictedSnafu { tier }.fail();
        }

        let entries = self.catalog.resolve_version(tenant, version_id).await;
        if entries.is_empty() {
            return NotFoundSnafu.fail();
        }
        let objects = try_join_all(entries.into_iter().map(|entry| async move {
            let size = self.storage.size(&entry.storage_key).await?;
            Ok::<_, StorageError>(ObjectDescriptor {
                storage_key: entry.storage_key,
                display_name: entry.display_name,
                size,
            })
        }))
        .await
        .map_err(|error| storage_error(tenant, error))?;

        let total_bytes: u64 = objects.iter().map(|object| object.size).sum();
        let context = TransferContext {
            route:   Route::Archive,
            objects: objects.len(),
        };
        self.admit(tenant, total_bytes, context)?;

        let entries = objects.len();
        let body = self
            .archives
            .stream(tenant, objects)
            .await
            .map_err(|error| archive_error(tenant, error))?;
        Ok(ArchiveDownload {
            file_name: sanitize_filename(&format!("{version_id}.zip")),
            entries,
            total_bytes,
            rate_limit,
            body,
        })
    }

    /// Mints (or reuses) a presigned URL for a file. Bytes fetched through
    /// it bypass this service and are not accounted here.
    pub async fn presigned_link(
        &self,
        requester: &Requester,
        file_id: &str,
    ) -> DownloadResult<PresignedLink> {
        let result = self.link(requester, file_id).await;
        record(Route::Link.as_str(), &result);
        result
    }

    async fn link(&self, requester: &Requester, file_id: &str) -> DownloadResult<PresignedLink> {
        let rate_limit = self.rate_limit(requester, Route::Link)?;
        let entry = self.resolve_file(&requester.tenant, file_id).await?;
        let url = self.links.issue(&entry.storage_key).context(SigningSnafu)?;
        Ok(PresignedLink {
            url,
            rate_limit: Some(rate_limit),
        })
    }

    /// Streams the object behind a presigned URL minted by
    /// [`DownloadService::presigned_link`]. The signature is the only
    /// credential, so redemptions are neither rate limited nor accounted.
    pub async fn redeem_link(
        &self,
        storage_key: &str,
        expires: i64,
        signature: &str,
    ) -> DownloadResult<FileDownload> {
        let result = self.redeem(storage_key, expires, signature, Utc::now()).await;
        record("redeem", &result);
        result
    }

    async fn redeem(
        &self,
        storage_key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> DownloadResult<FileDownload> {
        let storage_key = storage_key.trim_start_matches('/');
        if !self.links.verify_at(storage_key, expires, signature, now) {
            debug!(storage_key, expires, "Rejected presigned link");
            return LinkRejectedSnafu.fail();
        }
        let size = self
            .storage
            .size(storage_key)
            .await
            .map_err(|error| link_storage_error(storage_key, error))?;
        let body = self
            .storage
            .open_read_stream(storage_key)
            .await
            .map_err(|error| link_storage_error(storage_key, error))?;
        let file_name = sanitize_filename(storage_key.rsplit('/').next().unwrap_or(storage_key));
        Ok(FileDownload {
            content_type: content_type_for(&file_name),
            file_name,
            size,
            rate_limit: None,
            body,
        })
    }

    pub fn usage(&self, tenant: &TenantId) -> DownloadResult<TenantEgressCounter> {
        Ok(self.meter.usage(tenant)?)
    }

    /// Drops expired rate limit windows, egress periods and cached links.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> DownloadResult<PurgeReport> {
        let counters = self.counters.purge_expired(now).context(CounterSnafu)?;
        let links = self.links.cache().purge_expired(now);
        Ok(PurgeReport { counters, links })
    }

    pub fn flush(&self) -> DownloadResult<()> { self.counters.flush().context(CounterSnafu) }

    fn rate_limit(&self, requester: &Requester, route: Route) -> DownloadResult<RateLimitDecision> {
        let rule = self.limits.rule(route);
        let key = RateLimitKey::new(requester.tenant.clone(), requester.client.clone(), route);
        let now = Utc::now();
        let decision = self.limiter.check_at(&key, rule, now).context(CounterSnafu)?;
        if decision.allowed {
            return Ok(decision);
        }
        debug!(
            tenant = %requester.tenant,
            client_ip = %requester.client,
            route = %route,
            limit = rule.max,
            "Rate limited"
        );
        metrics::RATE_LIMITED.with_label_values(&[route.as_str()]).inc();
        Err(DownloadError::RateLimited {
            route:       route.as_str(),
            limit:       rule.max,
            retry_after: decision.retry_after(now),
        })
    }

    fn admit(&self, tenant: &TenantId, bytes: u64, context: TransferContext) -> DownloadResult<()> {
        let decision = self.meter.check_and_track(tenant, bytes, context)?;
        if decision.allowed {
            return Ok(());
        }
        Err(DownloadError::QuotaExceeded {
            used_bytes:       decision.used_bytes,
            requested_bytes:  bytes,
            hard_limit_bytes: decision.hard_limit_bytes,
            reset_at:         decision.period.end,
        })
    }

    async fn resolve_file(&self, tenant: &TenantId, file_id: &str) -> DownloadResult<CatalogEntry> {
        self.catalog
            .resolve_file(tenant, file_id)
            .await
            .context(NotFoundSnafu)
    }
}

fn record<T>(route: &'static str, result: &DownloadResult<T>) {
    let outcome: &'static str = match result {
        Ok(_) => "ok",
        Err(error) => error.status_code().into(),
    };
    metrics::REQUESTS
        .with_label_values(&[route, outcome])
        .inc();
}

/// A catalogued object missing from storage is reported like any unknown id.
fn storage_error(tenant: &TenantId, error: StorageError) -> DownloadError {
    if error.is_not_found() {
        warn!(%tenant, error = %error, "Catalog entry without stored object");
        return NotFoundSnafu.build();
    }
    StorageUnavailableSnafu.into_error(error)
}

fn link_storage_error(storage_key: &str, error: StorageError) -> DownloadError {
    if error.is_not_found() {
        warn!(storage_key, "Presigned link to a missing object");
        return NotFoundSnafu.build();
    }
    StorageUnavailableSnafu.into_error(error)
}

fn archive_error(tenant: &TenantId, error: ArchiveError) -> DownloadError {
    match error {
        ArchiveError::OpenSource { source, .. } => storage_error(tenant, source),
        other => ArchiveAbortedSnafu.into_error(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_names() {
        assert_eq!(Route::ALL.map(Route::as_str), ["file", "archive", "link"]);
        assert_eq!(Route::Archive.to_string(), "archive");
    }

    #[test]
    fn test_storage_errors_map_to_not_found_or_generic() {
        let tenant = TenantId::from("acme");
        let missing = storage_error(&tenant, StorageError::ObjectNotFound { key: "k".into() });
        assert!(matches!(missing, DownloadError::NotFound));

        let offline = storage_error(&tenant, StorageError::Unavailable {
            key:    "k".into(),
            source: Box::new(std::io::Error::other("timeout")),
        });
        assert!(matches!(offline, DownloadError::StorageUnavailable { .. }));

        let aborted = archive_error(&tenant, ArchiveError::ReadSource {
            key:    "k".into(),
            source: std::io::Error::other("reset"),
        });
        assert!(matches!(aborted, DownloadError::ArchiveAborted { .. }));
        let opened = archive_error(&tenant, ArchiveError::OpenSource {
            key:    "k".into(),
            source: StorageError::ObjectNotFound { key: "k".into() },
        });
        assert!(matches!(opened, DownloadError::NotFound));
    }
}
