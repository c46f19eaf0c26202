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

//! Tenants as seen by the download path: identity, plan tier and the stored
//! byte baseline that quota thresholds derive from.

use std::{collections::HashMap, fmt};

use dashmap::DashMap;
use dlgate_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};

#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self { Self(id.to_string()) }
}

/// Subscription tier of a tenant.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str { self.into() }

    /// Tiers that reject downloads past the hard egress limit. The others
    /// only account and warn.
    #[must_use]
    pub const fn enforces_hard_limit(self) -> bool { matches!(self, Self::Free | Self::Basic) }

    /// Whether whole-version archive downloads are part of the plan.
    #[must_use]
    pub const fn includes_archives(self) -> bool { !matches!(self, Self::Free) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantRecord {
    pub id:                     TenantId,
    pub tier:                   Tier,
    pub storage_baseline_bytes: u64,
}

/// Tenant lookups owned by the session and billing side of the application.
pub trait TenantDirectory: Send + Sync + fmt::Debug {
    /// Map a session credential to the tenant it belongs to.
    fn resolve_tenant(&self, session_token: &str) -> Option<TenantId>;

    fn record(&self, tenant: &TenantId) -> Option<TenantRecord>;

    fn tier_of(&self, tenant: &TenantId) -> Option<Tier> { self.record(tenant).map(|r| r.tier) }
}

/// One tenant entry of the static configuration table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id:               TenantId,
    pub tier:             Tier,
    /// Session tokens accepted for this tenant.
    #[serde(default, skip_serializing)]
    pub session_tokens:   Vec<String>,
    #[serde(default)]
    pub storage_baseline: ReadableSize,
}

/// Directory backed by the configuration file.
///
/// Baselines can be refreshed at runtime, e.g. after an upload changes the
/// tenant's stored total.
#[derive(Debug, Default)]
pub struct StaticTenantDirectory {
    sessions: HashMap<String, TenantId>,
    records:  DashMap<TenantId, TenantRecord>,
}

impl StaticTenantDirectory {
    #[must_use]
    pub fn from_config(tenants: &[TenantConfig]) -> Self {
        let mut sessions = HashMap::new();
        let records = DashMap::with_capacity(tenants.len());
        for tenant in tenants {
            for token in &tenant.session_tokens {
                sessions.insert(token.clone(), tenant.id.clone());
            }
            records.insert(tenant.id.clone(), TenantRecord {
                id:                     tenant.id.clone(),
                tier:                   tenant.tier,
                storage_baseline_bytes: tenant.storage_baseline.as_bytes(),
            });
        }
        Self { sessions, records }
    }

    /// Returns `false` when the tenant is unknown.
    pub fn set_storage_baseline(&self, tenant: &TenantId, bytes: u64) -> bool {
        self.records
            .get_mut(tenant)
            .map(|mut record| record.storage_baseline_bytes = bytes)
            .is_some()
    }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }
}

impl TenantDirectory for StaticTenantDirectory {
    fn resolve_tenant(&self, session_token: &str) -> Option<TenantId> {
        self.sessions.get(session_token).cloned()
    }

    fn record(&self, tenant: &TenantId) -> Option<TenantRecord> {
        self.records.get(tenant).map(|record| record.clone())
    }
}
