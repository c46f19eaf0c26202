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

use std::{
    io::{Cursor, Read},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use dlgate_base::readable_size::ReadableSize;
use dlgate_download::{
    ArchiveBody, ByteStream, CatalogEntry, Collaborators, DownloadConfig, DownloadError,
    DownloadService, MemoryCounterStore, Notifier, ObjectStoreStorage, RateLimitRule, Requester,
    RouteLimits, StaticCatalog, StaticTenantDirectory, TenantConfig, Tier, UsageWarning,
    WarningLevel,
};
use futures::TryStreamExt;

#[derive(Debug, Default)]
struct RecordingNotifier(Mutex<Vec<UsageWarning>>);

impl Notifier for RecordingNotifier {
    fn send_usage_warning(&self, warning: UsageWarning) { self.0.lock().unwrap().push(warning); }
}

struct Harness {
    service:  DownloadService,
    notifier: Arc<RecordingNotifier>,
}

fn tenant(id: &str, tier: Tier, baseline: u64) -> TenantConfig {
    TenantConfig {
        id: id.into(),
        tier,
        session_tokens: vec![format!("tok-{id}")],
        storage_baseline: ReadableSize(baseline),
    }
}

fn file(file_id: &str, tenant: &str, version_id: &str, name: &str) -> CatalogEntry {
    CatalogEntry {
        file_id:      file_id.into(),
        tenant:       tenant.into(),
        version_id:   version_id.into(),
        storage_key:  format!("{tenant}/{version_id}/{file_id}"),
        display_name: name.into(),
    }
}

async fn harness(config: DownloadConfig) -> Harness {
    let storage = ObjectStoreStorage::in_memory();
    storage.put("acme/v1/f-a", "0123456789").await.unwrap();
    storage.put("acme/v1/f-b", Bytes::new()).await.unwrap();
    storage.put("free/v3/f-free", "abc").await.unwrap();
    storage.put("basic/v4/f-big", vec![7u8; 30]).await.unwrap();

    let catalog = StaticCatalog::new([
        file("f-a", "acme", "v1", "a.stl"),
        file("f-b", "acme", "v1", "b.3mf"),
        file("f-ghost", "acme", "v2", "ghost.stl"),
        file("f-free", "free", "v3", "../../etc/passwd"),
        file("f-big", "basic", "v4", "evil\"; .stl"),
    ]);
    let tenants = StaticTenantDirectory::from_config(&[
        tenant("acme", Tier::Pro, 100),
        tenant("free", Tier::Free, 1000),
        tenant("basic", Tier::Basic, 10),
    ]);
    let notifier = Arc::new(RecordingNotifier::default());
    let collaborators = Collaborators::builder()
        .tenants(Arc::new(tenants))
        .catalog(Arc::new(catalog))
        .storage(Arc::new(storage))
        .counters(Arc::new(MemoryCounterStore::default()))
        .notifier(notifier.clone())
        .build();
    Harness {
        service: DownloadService::new(config, collaborators),
        notifier,
    }
}

fn requester(tenant: &str) -> Requester {
    Requester {
        tenant: tenant.into(),
        client: "203.0.113.7".into(),
    }
}

async fn read_body(body: ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
    chunks.concat()
}

async fn read_archive(body: ArchiveBody) -> Vec<(String, Vec<u8>)> {
    let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(chunks.concat())).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}

#[tokio::test]
async fn test_file_download_streams_and_accounts() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    let tenant = service.authenticate(Some("tok-acme")).unwrap();
    assert_eq!(tenant.as_str(), "acme");

    let download = service.download_file(&requester("acme"), "f-a").await.unwrap();
    assert_eq!(download.file_name, "a.stl");
    assert_eq!(download.content_type, "model/stl");
    assert_eq!(download.size, 10);
    assert_eq!(download.rate_limit.map(|decision| decision.remaining), Some(59));
    assert_eq!(read_body(download.body).await, b"0123456789");

    let usage = service.usage(&tenant).unwrap();
    assert_eq!(usage.bytes_this_period, 10);
    assert_eq!(usage.downloads_this_period, 1);
}

#[tokio::test]
async fn test_unauthenticated_and_unknown() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    assert!(matches!(service.authenticate(None), Err(DownloadError::Unauthenticated)));
    assert!(matches!(
        service.authenticate(Some("tok-nobody")),
        Err(DownloadError::Unauthenticated)
    ));

    // foreign and unknown ids are indistinguishable
    let foreign = service.download_file(&requester("acme"), "f-free").await.unwrap_err();
    let unknown = service.download_file(&requester("acme"), "f-nope").await.unwrap_err();
    assert_eq!(foreign.to_string(), unknown.to_string());
    assert!(matches!(foreign, DownloadError::NotFound));

    // catalogued but missing from storage
    let ghost = service.download_file(&requester("acme"), "f-ghost").await.unwrap_err();
    assert!(matches!(ghost, DownloadError::NotFound));
    assert_eq!(service.usage(&"acme".into()).unwrap().bytes_this_period, 0);
}

#[tokio::test]
async fn test_sanitized_names_reach_the_response() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    let download = service.download_file(&requester("free"), "f-free").await.unwrap();
    assert_eq!(download.file_name, "_.._etc_passwd");

    let download = service.download_file(&requester("basic"), "f-big").await.unwrap();
    assert!(!download.file_name.contains(['"', '\\', '/']));
}

#[tokio::test]
async fn test_rate_limit_per_client_and_route() {
    let config = DownloadConfig::builder()
        .rate_limits(RouteLimits {
            file: RateLimitRule::new(Duration::from_secs(60), 2),
            ..RouteLimits::default()
        })
        .build();
    let Harness { service, .. } = harness(config).await;
    let me = requester("acme");

    service.download_file(&me, "f-a").await.unwrap();
    service.download_file(&me, "f-a").await.unwrap();
    let limited = service.download_file(&me, "f-a").await.unwrap_err();
    match limited {
        DownloadError::RateLimited {
            route,
            limit,
            retry_after,
        } => {
            assert_eq!(route, "file");
            assert_eq!(limit, 2);
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    // rejected requests are not accounted
    assert_eq!(service.usage(&me.tenant).unwrap().bytes_this_period, 20);

    let neighbour = Requester {
        client: "198.51.100.1".into(),
        ..me.clone()
    };
    assert!(service.download_file(&neighbour, "f-a").await.is_ok());
    assert!(service.presigned_link(&me, "f-a").await.is_ok());
}

#[tokio::test]
async fn test_hard_limit_rejects_enforced_tiers() {
    // baseline 10: hard limit 50
    let Harness { service, notifier } = harness(DownloadConfig::default()).await;
    let basic = requester("basic");

    service.download_file(&basic, "f-big").await.unwrap();
    let rejected = service.download_file(&basic, "f-big").await.unwrap_err();
    match rejected {
        DownloadError::QuotaExceeded {
            used_bytes,
            requested_bytes,
            hard_limit_bytes,
            reset_at,
        } => {
            assert_eq!(used_bytes, 30);
            assert_eq!(requested_bytes, 30);
            assert_eq!(hard_limit_bytes, 50);
            assert!(reset_at > Utc::now());
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }
    assert_eq!(service.usage(&basic.tenant).unwrap().bytes_this_period, 30);

    // 30 of a 30 byte soft limit: both warnings, once
    let levels: Vec<_> = notifier.0.lock().unwrap().iter().map(|w| w.level).collect();
    assert_eq!(levels, [WarningLevel::Soft, WarningLevel::Hard]);
}

#[tokio::test]
async fn test_version_archive() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    let download = service.download_archive(&requester("acme"), "v1").await.unwrap();
    assert_eq!(download.file_name, "v1.zip");
    assert_eq!(download.entries, 2);
    assert_eq!(download.total_bytes, 10);

    let entries = read_archive(download.body).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("a.stl".to_string(), b"0123456789".to_vec()));
    assert_eq!(entries[1], ("b.3mf".to_string(), Vec::new()));

    let usage = service.usage(&"acme".into()).unwrap();
    assert_eq!(usage.bytes_this_period, 10);
    assert_eq!(usage.downloads_this_period, 1);
}

#[tokio::test]
async fn test_archive_errors() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    assert!(matches!(
        service.download_archive(&requester("free"), "v3").await.unwrap_err(),
        DownloadError::PlanRestricted { tier: Tier::Free }
    ));
    assert!(matches!(
        service.download_archive(&requester("acme"), "v9").await.unwrap_err(),
        DownloadError::NotFound
    ));
    assert!(matches!(
        service.download_archive(&requester("acme"), "v2").await.unwrap_err(),
        DownloadError::NotFound
    ));
    assert!(matches!(
        service.download_archive(&requester("acme"), "v3").await.unwrap_err(),
        DownloadError::NotFound
    ));
}

#[tokio::test]
async fn test_presigned_links_are_cached() {
    let mut config = DownloadConfig::default();
    config.presign.base_url = "https://cdn.example/objects".into();
    config.presign.secret = "integration".into();
    let Harness { service, .. } = harness(config).await;
    let me = requester("acme");

    let first = service.presigned_link(&me, "f-a").await.unwrap();
    let second = service.presigned_link(&me, "f-a").await.unwrap();
    assert_eq!(first.url, second.url);
    assert!(first.url.url.starts_with("https://cdn.example/objects/acme/v1/f-a?expires="));
    assert!(first.url.expires_at > Utc::now() + chrono::Duration::minutes(14));

    assert!(matches!(
        service.presigned_link(&me, "f-free").await.unwrap_err(),
        DownloadError::NotFound
    ));
    // links are not egress
    assert_eq!(service.usage(&me.tenant).unwrap().bytes_this_period, 0);
}

/// Splits `{base}/{key}?expires={e}&signature={s}` back into its parts.
fn link_parts<'a>(url: &'a str, base: &str) -> (&'a str, i64, &'a str) {
    let (path, query) = url.split_once('?').unwrap();
    let key = path.strip_prefix(base).unwrap().trim_start_matches('/');
    let mut expires = 0;
    let mut signature = "";
    for pair in query.split('&') {
        match pair.split_once('=').unwrap() {
            ("expires", value) => expires = value.parse().unwrap(),
            ("signature", value) => signature = value,
            _ => {}
        }
    }
    (key, expires, signature)
}

#[tokio::test]
async fn test_presigned_links_redeem() {
    let mut config = DownloadConfig::default();
    config.presign.base_url = "https://cdn.example/objects".into();
    config.presign.secret = "integration".into();
    let Harness { service, .. } = harness(config).await;
    let me = requester("acme");

    let link = service.presigned_link(&me, "f-a").await.unwrap();
    let (key, expires, signature) = link_parts(&link.url.url, "https://cdn.example/objects");
    assert_eq!(key, "acme/v1/f-a");

    let download = service.redeem_link(key, expires, signature).await.unwrap();
    assert_eq!(download.file_name, "f-a");
    assert_eq!(download.size, 10);
    assert!(download.rate_limit.is_none());
    assert_eq!(read_body(download.body).await, b"0123456789");
    // redemptions are not egress either
    assert_eq!(service.usage(&me.tenant).unwrap().bytes_this_period, 0);

    for (key, expires, signature) in [
        ("acme/v1/f-b", expires, signature),
        (key, expires + 60, signature),
        (key, expires, "AAAA"),
        (key, Utc::now().timestamp() - 1, signature),
    ] {
        assert!(matches!(
            service.redeem_link(key, expires, signature).await.unwrap_err(),
            DownloadError::LinkRejected
        ));
    }
}

#[tokio::test]
async fn test_purge_expired() {
    let Harness { service, .. } = harness(DownloadConfig::default()).await;
    service.download_file(&requester("acme"), "f-a").await.unwrap();
    service.presigned_link(&requester("acme"), "f-a").await.unwrap();

    let nothing = service.purge_expired(Utc::now()).unwrap();
    assert_eq!(nothing.counters, 0);
    assert_eq!(nothing.links, 0);

    let later = service.purge_expired(Utc::now() + chrono::Duration::days(40)).unwrap();
    // file window, link window, bytes, downloads
    assert_eq!(later.counters, 4);
    assert_eq!(later.links, 1);
    service.flush().unwrap();
}
