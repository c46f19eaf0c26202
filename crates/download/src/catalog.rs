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

//! Resolution of client-visible file and version ids to stored objects.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub file_id:      String,
    pub tenant:       TenantId,
    pub version_id:   String,
    pub storage_key:  String,
    pub display_name: String,
}

/// File metadata owned by the asset management side of the application.
///
/// Lookups are scoped to a tenant: an id belonging to another tenant
/// resolves exactly like an unknown id.
#[async_trait]
pub trait Catalog: Send + Sync + fmt::Debug {
    async fn resolve_file(&self, tenant: &TenantId, file_id: &str) -> Option<CatalogEntry>;

    /// Files of a version in catalog order. Empty when the version is unknown
    /// or foreign.
    async fn resolve_version(&self, tenant: &TenantId, version_id: &str) -> Vec<CatalogEntry>;
}

/// Catalog loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    files:    HashMap<String, CatalogEntry>,
    versions: HashMap<String, Vec<String>>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut catalog = Self::default();
        for entry in entries {
            catalog
                .versions
                .entry(entry.version_id.clone())
                .or_default()
                .push(entry.file_id.clone());
            catalog.files.insert(entry.file_id.clone(), entry);
        }
        catalog
    }

    pub fn len(&self) -> usize { self.files.len() }

    pub fn is_empty(&self) -> bool { self.files.is_empty() }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn resolve_file(&self, tenant: &TenantId, file_id: &str) -> Option<CatalogEntry> {
        self.files
            .get(file_id)
            .filter(|entry| &entry.tenant == tenant)
            .cloned()
    }

    async fn resolve_version(&self, tenant: &TenantId, version_id: &str) -> Vec<CatalogEntry> {
        self.versions
            .get(version_id)
            .into_iter()
            .flatten()
            .filter_map(|file_id| self.files.get(file_id))
            .filter(|entry| &entry.tenant == tenant)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: &str, tenant: &str, version_id: &str) -> CatalogEntry {
        CatalogEntry {
            file_id:      file_id.into(),
            tenant:       tenant.into(),
            version_id:   version_id.into(),
            storage_key:  format!("{tenant}/{version_id}/{file_id}"),
            display_name: format!("{file_id}.stl"),
        }
    }

    #[tokio::test]
    async fn test_lookups_are_tenant_scoped() {
        let catalog = StaticCatalog::new([
            entry("f1", "acme", "v1"),
            entry("f2", "acme", "v1"),
            entry("f3", "initech", "v2"),
        ]);
        let acme = TenantId::from("acme");

        assert_eq!(catalog.resolve_file(&acme, "f1").await.unwrap().storage_key, "acme/v1/f1");
        assert_eq!(catalog.resolve_file(&acme, "f3").await, None);
        assert_eq!(catalog.resolve_file(&acme, "f9").await, None);

        let version = catalog.resolve_version(&acme, "v1").await;
        assert_eq!(
            version.iter().map(|e| e.file_id.as_str()).collect::<Vec<_>>(),
            ["f1", "f2"]
        );
        assert!(catalog.resolve_version(&acme, "v2").await.is_empty());
        assert!(catalog.resolve_version(&acme, "v9").await.is_empty());
    }
}
