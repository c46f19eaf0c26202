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

pub mod download;
pub mod error;
pub mod http;

use std::net::SocketAddr;

use dlgate_error::{Result, ServerStoppedSnafu};
use snafu::OptionExt;
use tokio::{sync::oneshot::Receiver, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle for managing a running HTTP service.
///
/// This handle provides control over a running service, allowing you to:
/// - Wait for the service to start accepting connections
/// - Signal graceful shutdown
/// - Wait for the service to fully stop
/// - Check if the service task has completed
///
/// The handle uses a cancellation token for graceful shutdown and provides
/// async methods for coordinating server lifecycle events.
pub struct ServiceHandler {
    /// Join handle for the server task
    join_handle:        JoinHandle<()>,
    /// Token for signalling shutdown
    cancellation_token: CancellationToken,
    /// Receiver for server start notification
    started_rx:         Option<Receiver<()>>,
    /// Address the listener is bound to
    local_addr:         SocketAddr,
}

impl ServiceHandler {
    /// Waits for the server to start accepting connections.
    ///
    /// Returns immediately when the start signal was already consumed.
    pub async fn wait_for_start(&mut self) -> Result<()> {
        let Some(started_rx) = self.started_rx.take() else {
            return Ok(());
        };
        started_rx.await.ok().context(ServerStoppedSnafu {
            addr: self.local_addr.to_string(),
        })?;
        Ok(())
    }

    /// Waits for the server to completely stop.
    ///
    /// This method consumes the handle and blocks until the server task
    /// has finished executing. Use this after calling `shutdown()` to
    /// ensure clean termination.
    pub async fn wait_for_stop(self) -> Result<()> {
        if let Err(error) = self.join_handle.await {
            warn!(addr = %self.local_addr, %error, "Server task ended abnormally");
        }
        Ok(())
    }

    /// Signals the server to begin graceful shutdown.
    pub fn shutdown(&self) { self.cancellation_token.cancel(); }

    /// Checks if the server task has completed.
    pub fn is_finished(&self) -> bool { self.join_handle.is_finished() }

    /// The bound address, with the real port when port 0 was requested.
    pub const fn local_addr(&self) -> SocketAddr { self.local_addr }
}
