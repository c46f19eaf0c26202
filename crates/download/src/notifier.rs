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

//! Usage warning delivery.
//!
//! The egress path only enqueues. A background task drains the queue into a
//! [`NotificationSink`]; delivery failures end up in the log and nowhere else.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, ensure};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{NotifyError, WebhookSnafu, WebhookStatusSnafu},
    tenant::TenantId,
};

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
pub enum WarningLevel {
    /// Usage approaches the soft limit.
    Soft,
    /// Usage reached the soft limit.
    Hard,
}

impl WarningLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str { self.into() }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageWarning {
    pub tenant:           TenantId,
    pub level:            WarningLevel,
    /// Period usage relative to the soft limit.
    pub percent:          f64,
    pub used_bytes:       u64,
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
}

/// Fire-and-forget warning channel used by the egress meter. Implementations
/// must neither block nor fail.
pub trait Notifier: Send + Sync + fmt::Debug {
    fn send_usage_warning(&self, warning: UsageWarning);
}

#[async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    async fn deliver(&self, warning: &UsageWarning) -> Result<(), NotifyError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    #[default]
    Log,
    Webhook {
        url:     String,
        #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

const fn default_webhook_timeout() -> Duration { Duration::from_secs(5) }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct NotifierConfig {
    pub sink:           SinkConfig,
    /// Warnings beyond this many undelivered ones are dropped.
    #[default = 1024]
    pub queue_capacity: usize,
}

impl NotifierConfig {
    pub fn build_sink(&self) -> Result<Arc<dyn NotificationSink>, NotifyError> {
        Ok(match &self.sink {
            SinkConfig::Log => Arc::new(LogSink),
            SinkConfig::Webhook { url, timeout } => Arc::new(WebhookSink::new(url, *timeout)?),
        })
    }
}

/// Bounded queue in front of a sink.
#[derive(Debug, Clone)]
pub struct QueuedNotifier {
    tx: mpsc::Sender<UsageWarning>,
}

impl QueuedNotifier {
    /// Starts the delivery task. It stops once `cancel` fires and the queued
    /// warnings were delivered, or once every notifier handle is dropped.
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageWarning>(capacity.max(1));
        let handle = tokio::spawn(async move {
            loop {
                let warning = tokio::select! {
                    () = cancel.cancelled() => break,
                    warning = rx.recv() => match warning {
                        Some(warning) => warning,
                        None => return,
                    },
                };
                deliver(sink.as_ref(), &warning).await;
            }
            rx.close();
            while let Some(warning) = rx.recv().await {
                deliver(sink.as_ref(), &warning).await;
            }
        });
        (Self { tx }, handle)
    }
}

async fn deliver(sink: &dyn NotificationSink, warning: &UsageWarning) {
    if let Err(error) = sink.deliver(warning).await {
        warn!(
            tenant = %warning.tenant,
            level = %warning.level,
            error = %error,
            "Failed to deliver usage warning"
        );
    }
}

impl Notifier for QueuedNotifier {
    fn send_usage_warning(&self, warning: UsageWarning) {
        match self.tx.try_send(warning) {
            Ok(()) => {}
            Err(TrySendError::Full(warning)) => {
                warn!(tenant = %warning.tenant, level = %warning.level, "Notification queue full, dropping usage warning");
            }
            Err(TrySendError::Closed(warning)) => {
                warn!(tenant = %warning.tenant, level = %warning.level, "Notification queue closed, dropping usage warning");
            }
        }
    }
}

/// Writes warnings to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, warning: &UsageWarning) -> Result<(), NotifyError> {
        info!(
            tenant = %warning.tenant,
            level = %warning.level,
            percent = warning.percent,
            used = warning.used_bytes,
            soft_limit = warning.soft_limit_bytes,
            hard_limit = warning.hard_limit_bytes,
            "Usage warning"
        );
        Ok(())
    }
}

/// POSTs each warning as JSON, e.g. to the mail gateway.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url:    String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(WebhookSnafu { url: url.clone() })?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, warning: &UsageWarning) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(warning)
            .send()
            .await
            .context(WebhookSnafu { url: &self.url })?;
        let status = response.status();
        ensure!(
            status.is_success(),
            WebhookStatusSnafu {
                url:    &self.url,
                status: status.as_u16(),
            }
        );
        Ok(())
    }
}
