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

use std::{path::Path, time::Duration};

use config::{Config, Environment, File, FileFormat};
use dlgate_common_telemetry::LoggingOptions;
use dlgate_download::{
    CatalogEntry, CounterBackend, DownloadConfig, NotifierConfig, StorageConfig, TenantConfig,
};
use dlgate_server::http::RestServerConfig;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever, ensure_whatever};

/// Prefix of environment overrides, e.g. `DLGATE__HTTP__BIND_ADDRESS`.
pub const ENV_PREFIX: &str = "DLGATE";

/// Everything the `server` command needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct AppConfig {
    #[builder(default)]
    pub http:                     RestServerConfig,
    #[builder(default)]
    pub logging:                  LoggingOptions,
    #[builder(default)]
    pub download:                 DownloadConfig,
    #[builder(default)]
    pub counters:                 CounterBackend,
    #[builder(default)]
    pub storage:                  StorageConfig,
    #[builder(default)]
    pub notifications:            NotifierConfig,
    /// How often expired counters and cached links are dropped.
    #[serde(with = "humantime_serde")]
    #[default(_code = "Duration::from_secs(60)")]
    #[builder(default = Duration::from_secs(60))]
    pub housekeeping_interval:    Duration,
    /// Wait for SIGINT/SIGTERM instead of only an explicit shutdown.
    #[default = true]
    #[builder(default = true)]
    pub enable_graceful_shutdown: bool,
    #[builder(default)]
    pub tenants:                  Vec<TenantConfig>,
    #[builder(default)]
    pub catalog:                  Vec<CatalogEntry>,
}

impl AppConfig {
    /// Layers defaults, the optional TOML file and `DLGATE__*` variables,
    /// in that order.
    pub fn load(path: Option<&Path>) -> Result<Self, Whatever> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            let name = path.to_string_lossy();
            builder = builder.add_source(File::new(&name, FileFormat::Toml).required(true));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .whatever_context("Failed to read configuration")?
            .try_deserialize()
            .whatever_context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Whatever> {
        self.download
            .validate()
            .whatever_context("Invalid download settings")?;
        ensure_whatever!(
            !self.housekeeping_interval.is_zero(),
            "housekeeping_interval must be positive"
        );
        ensure_whatever!(
            self.notifications.queue_capacity > 0,
            "notifications.queue_capacity must be positive"
        );
        for tenant in &self.tenants {
            ensure_whatever!(
                !tenant.id.as_str().is_empty(),
                "tenant ids must not be empty"
            );
        }
        for entry in &self.catalog {
            ensure_whatever!(
                self.tenants.iter().any(|tenant| tenant.id == entry.tenant),
                "catalog file {} belongs to unknown tenant {}",
                entry.file_id,
                entry.tenant
            );
        }
        Ok(())
    }
}
