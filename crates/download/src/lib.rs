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

//! Metered download and archive streaming.
//!
//! Request flow, leaf components first:
//!
//! ```text
//! request -> RateLimiter -> Catalog + Storage::size -> EgressMeter -> body
//!                                                                   |-- Storage::open_read_stream
//!                                                                   `-- ArchiveStreamer (zip)
//! ```
//!
//! [`DownloadService`] wires the pieces together; every collaborator that
//! belongs to the surrounding application (tenants, catalog, object store,
//! notification delivery) sits behind a trait.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod counter;
pub mod egress;
pub mod error;
pub mod filename;
pub mod metrics;
pub mod notifier;
pub mod presign;
pub mod rate_limiter;
pub mod service;
pub mod storage;
pub mod tenant;

pub use archive::{ArchiveBody, ArchiveStreamer};
pub use catalog::{Catalog, CatalogEntry, StaticCatalog};
pub use config::{ArchiveConfig, DownloadConfig, PresignConfig, RateLimitRule, RouteLimits};
pub use counter::{CounterBackend, CounterEntry, CounterStore, MemoryCounterStore, SledCounterStore};
pub use egress::{EgressDecision, EgressMeter, EgressPolicy, TenantEgressCounter, TransferContext};
pub use error::{DownloadError, DownloadResult};
pub use notifier::{Notifier, NotifierConfig, QueuedNotifier, UsageWarning, WarningLevel};
pub use presign::{HmacUrlSigner, PresignedUrl, PresignedUrlCache, PresignedUrlIssuer, UrlSigner};
pub use rate_limiter::{RateLimitDecision, RateLimitKey, RateLimiter};
pub use service::{
    ArchiveDownload, Collaborators, DownloadService, FileDownload, PresignedLink, PurgeReport,
    Requester, Route,
};
pub use storage::{ByteStream, ObjectDescriptor, ObjectStoreStorage, Storage, StorageConfig};
pub use tenant::{StaticTenantDirectory, TenantConfig, TenantDirectory, TenantId, TenantRecord, Tier};
