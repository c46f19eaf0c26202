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

//! Builds a [`DownloadService`] from an [`AppConfig`] and runs it behind the
//! REST server until a shutdown signal arrives.

pub mod config;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use dlgate_common_telemetry as telemetry;
use dlgate_download::{
    Collaborators, DownloadService, QueuedNotifier, StaticCatalog, StaticTenantDirectory,
};
use dlgate_server::{
    ServiceHandler,
    download::download_routes,
    http::{RouteHandler, health_routes, metrics_routes, start_rest_server},
};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::config::AppConfig;

/// Represents the main application with lifecycle management
#[derive(SmartDefault)]
pub struct App {
    /// Application configuration
    pub config:             AppConfig,
    /// Controls if the application should continue running
    #[default(_code = "Arc::new(AtomicBool::new(false))")]
    pub running:            Arc<AtomicBool>,
    /// Cancellation token for graceful shutdown
    #[default(_code = "CancellationToken::new()")]
    pub cancellation_token: CancellationToken,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config: self,
            ..Default::default()
        }
    }
}

/// Handle for controlling a running application
pub struct AppHandle {
    /// Sender for triggering shutdown
    shutdown_tx:        Option<oneshot::Sender<()>>,
    /// Application running flag
    running:            Arc<AtomicBool>,
    /// Fires once every component has stopped
    stopped:            CancellationToken,
    /// Address the REST server listens on
    local_addr:         std::net::SocketAddr,
}

impl AppHandle {
    /// Gracefully shutdown the application
    pub fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the application is still running
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    #[must_use]
    pub const fn local_addr(&self) -> std::net::SocketAddr { self.local_addr }

    /// Wait until the servers stopped and the counters were flushed.
    pub async fn wait_for_shutdown(&self) { self.stopped.cancelled().await; }
}

/// The download service and the background task delivering its warnings.
struct Wiring {
    service:  Arc<DownloadService>,
    notifier: JoinHandle<()>,
}

/// Opens the configured backends and assembles the download service.
fn wire(config: &AppConfig, cancel: CancellationToken) -> Result<Wiring, Whatever> {
    let counters = config
        .counters
        .open()
        .whatever_context("Failed to open counter store")?;
    let storage = config
        .storage
        .build()
        .whatever_context("Failed to open object storage")?;
    let sink = config
        .notifications
        .build_sink()
        .whatever_context("Failed to build notification sink")?;
    let (notifier, notifier_task) =
        QueuedNotifier::spawn(sink, config.notifications.queue_capacity, cancel);

    let tenants = StaticTenantDirectory::from_config(&config.tenants);
    let catalog = StaticCatalog::new(config.catalog.iter().cloned());
    info!(
        tenants = tenants.len(),
        files = catalog.len(),
        counters = ?config.counters,
        "Wiring download service"
    );

    let collaborators = Collaborators::builder()
        .tenants(Arc::new(tenants))
        .catalog(Arc::new(catalog))
        .storage(Arc::new(storage))
        .counters(counters)
        .notifier(Arc::new(notifier))
        .build();
    Ok(Wiring {
        service:  Arc::new(DownloadService::new(config.download.clone(), collaborators)),
        notifier: notifier_task,
    })
}

/// Periodically drops expired counters and cached links.
fn spawn_housekeeping(
    service: Arc<DownloadService>,
    period: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match service.purge_expired(Utc::now()) {
                Ok(report) => debug!(
                    counters = report.counters,
                    links = report.links,
                    "Purged expired entries"
                ),
                Err(error) => warn!(%error, "Housekeeping failed"),
            }
        }
    })
}

impl App {
    /// Start the application and return a handle for controlling it
    pub async fn start(&self) -> Result<AppHandle, Whatever> {
        self.config.validate()?;
        info!("Starting dlgate");

        let background = CancellationToken::new();
        let wiring = wire(&self.config, background.clone())?;
        let housekeeping = spawn_housekeeping(
            Arc::clone(&wiring.service),
            self.config.housekeeping_interval,
            background.clone(),
        );

        let handlers: Vec<RouteHandler> = vec![
            Box::new(health_routes),
            Box::new(metrics_routes),
            download_routes(
                Arc::clone(&wiring.service),
                self.config.http.trust_forwarded_for,
            ),
        ];
        let mut http_handle = match start_rest_server(self.config.http.clone(), handlers).await {
            Ok(handle) => handle,
            Err(error) => {
                background.cancel();
                return Err(error).whatever_context("Failed to start REST server");
            }
        };
        http_handle
            .wait_for_start()
            .await
            .whatever_context("REST server did not start")?;
        let local_addr = http_handle.local_addr();

        self.running.store(true, Ordering::SeqCst);
        info!(%local_addr, "dlgate started");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stopped = CancellationToken::new();
        let app_handle = AppHandle {
            shutdown_tx: Some(shutdown_tx),
            running: Arc::clone(&self.running),
            stopped: stopped.clone(),
            local_addr,
        };

        let running = Arc::clone(&self.running);
        let cancellation_token = self.cancellation_token.clone();
        let enable_graceful_shutdown = self.config.enable_graceful_shutdown;
        tokio::spawn(async move {
            if enable_graceful_shutdown {
                shutdown_signal(shutdown_rx, cancellation_token).await;
            } else {
                tokio::select! {
                    _ = shutdown_rx => {}
                    () = cancellation_token.cancelled() => {}
                }
            }

            info!("Shutting down servers");
            shutdown_components(http_handle, background, housekeeping, wiring).await;
            running.store(false, Ordering::SeqCst);
            stopped.cancel();
            info!("Application shutdown complete");
        });

        Ok(app_handle)
    }

    /// Run the application blocking until it's shut down
    pub async fn run(self) -> Result<(), Whatever> {
        let _guards = telemetry::init_global_logging("dlgate", &self.config.logging, None);
        telemetry::set_panic_hook();
        let handle = self.start().await?;
        handle.wait_for_shutdown().await;
        Ok(())
    }
}

/// Stops accepting requests, drains queued warnings and flushes counters.
async fn shutdown_components(
    http_handle: ServiceHandler,
    background: CancellationToken,
    housekeeping: JoinHandle<()>,
    wiring: Wiring,
) {
    http_handle.shutdown();
    if let Err(error) = http_handle.wait_for_stop().await {
        warn!(%error, "REST server did not stop cleanly");
    }

    background.cancel();
    if let Err(error) = housekeeping.await {
        warn!(%error, "Housekeeping task failed");
    }
    if let Err(error) = wiring.notifier.await {
        warn!(%error, "Notification task failed");
    }
    if let Err(error) = wiring.service.flush() {
        warn!(%error, "Failed to flush counters");
    }
}

async fn shutdown_signal(shutdown_rx: oneshot::Receiver<()>, cancellation_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        _ = shutdown_rx => { info!("Received shutdown signal"); },
        () = cancellation_token.cancelled() => { info!("Application cancelled"); },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dlgate_base::readable_size::ReadableSize;
    use dlgate_download::{CatalogEntry, StorageConfig, TenantConfig, Tier};
    use dlgate_server::http::RestServerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn test_config(root: &std::path::Path) -> AppConfig {
        AppConfig::builder()
            .http(RestServerConfig::builder().bind_address("127.0.0.1:0".to_string()).build())
            .storage(StorageConfig::Local {
                root: root.to_path_buf(),
            })
            .enable_graceful_shutdown(false)
            .housekeeping_interval(Duration::from_millis(50))
            .tenants(vec![TenantConfig {
                id:               "acme".into(),
                tier:             Tier::Pro,
                session_tokens:   vec!["tok-acme".to_string()],
                storage_baseline: ReadableSize::mb(1),
            }])
            .catalog(vec![CatalogEntry {
                file_id:      "f-1".into(),
                tenant:       "acme".into(),
                version_id:   "v1".into(),
                storage_key:  "acme/bracket.stl".into(),
                display_name: "bracket.stl".into(),
            }])
            .build()
    }

    #[tokio::test]
    async fn test_app_creation() {
        let app = AppConfig::default().open();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_app_serves_and_shuts_down() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("acme")).unwrap();
        std::fs::write(root.path().join("acme/bracket.stl"), b"solid").unwrap();

        let app = test_config(root.path()).open();
        let mut handle = app.start().await.unwrap();
        assert!(handle.is_running());

        let addr = handle.local_addr();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /download/file/f-1 HTTP/1.1\r\nHost: test\r\nAuthorization: Bearer tok-acme\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("solid"));

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_shutdown())
            .await
            .unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_does_not_start() {
        let config = AppConfig::builder()
            .housekeeping_interval(Duration::ZERO)
            .build();
        assert!(config.open().start().await.is_err());
    }
}
