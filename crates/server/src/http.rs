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

use std::net::SocketAddr;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use axum_tracing_opentelemetry::middleware::{OtelAxumLayer, OtelInResponseLayer};
use dlgate_base::readable_size::ReadableSize;
use dlgate_error::{BindSnafu, ParseAddressSnafu, Result};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ResultExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::ServiceHandler;

/// Default maximum HTTP request body size. Download requests carry no body.
pub const DEFAULT_MAX_HTTP_BODY_SIZE: ReadableSize = ReadableSize::kb(64);

/// A function that registers routes on the shared router.
pub type RouteHandler = Box<dyn Fn(Router) -> Router + Send + Sync>;

/// Configuration options for a REST server
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct RestServerConfig {
    /// The address to bind the REST server
    #[default = "127.0.0.1:3000"]
    #[builder(default = "127.0.0.1:3000".to_string())]
    pub bind_address:        String,
    /// Maximum HTTP request body size
    #[default(_code = "DEFAULT_MAX_HTTP_BODY_SIZE")]
    #[builder(default = DEFAULT_MAX_HTTP_BODY_SIZE)]
    pub max_body_size:       ReadableSize,
    /// Whether to enable CORS
    #[default = true]
    #[builder(default = true)]
    pub enable_cors:         bool,
    /// Take the client address from the first `X-Forwarded-For` hop. Only
    /// safe behind a proxy that overwrites the header.
    #[builder(default)]
    pub trust_forwarded_for: bool,
}

/// Starts the REST server and returns a handle for managing its lifecycle.
///
/// The listener is bound before this returns, so address problems surface
/// here rather than inside the server task. The route handlers are applied
/// in order, then tracing, body limit and CORS layers wrap every route.
///
/// # Example
///
/// ```rust,ignore
/// use axum::{Router, routing::get};
/// use dlgate_server::http::{RestServerConfig, start_rest_server};
///
/// fn my_routes(router: Router) -> Router {
///     router.route("/api/v1/hello", get(|| async { "Hello, World!" }))
/// }
///
/// let handle = start_rest_server(RestServerConfig::default(), vec![my_routes]).await?;
/// ```
pub async fn start_rest_server<F>(
    config: RestServerConfig,
    route_handlers: Vec<F>,
) -> Result<ServiceHandler>
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    let bind_addr = config
        .bind_address
        .parse::<SocketAddr>()
        .context(ParseAddressSnafu {
            addr: config.bind_address.clone(),
        })?;

    let mut router = Router::new().route("/health", get(health_check));
    for handler in &route_handlers {
        router = handler(router);
    }
    info!(handlers = route_handlers.len(), "Registered REST route handlers");

    let mut router = router
        .layer(OtelInResponseLayer)
        .layer(OtelAxumLayer::default())
        .layer(DefaultBodyLimit::max(config.max_body_size.as_usize()));
    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([header::CONTENT_DISPOSITION, header::RETRY_AFTER]);
        router = router.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context(BindSnafu {
            addr: config.bind_address.clone(),
        })?;
    let local_addr = listener.local_addr().context(BindSnafu {
        addr: config.bind_address.clone(),
    })?;

    let cancellation_token = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let shutdown = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            info!("REST server (on {}) started", local_addr);
            let _ = started_tx.send(());
            shutdown.cancelled().await;
            info!("REST server (on {}) received shutdown signal", local_addr);
        })
        .await;

        match result {
            Ok(()) => info!("REST server (on {}) stopped", local_addr),
            Err(error) => warn!("REST server (on {}) failed: {}", local_addr, error),
        }
    });

    Ok(ServiceHandler {
        join_handle,
        cancellation_token,
        started_rx: Some(started_rx),
        local_addr,
    })
}

/// Health check endpoint for the REST server
async fn health_check() -> impl IntoResponse { (StatusCode::OK, "OK") }

/// Health check handler that returns detailed health information
async fn api_health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "dlgate",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Add health routes to the router
pub fn health_routes(router: Router) -> Router {
    router
        .route("/api/v1/health", get(api_health_handler))
        .route("/api/health", get(api_health_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(%error, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// Expose the default prometheus registry at `/metrics`
pub fn metrics_routes(router: Router) -> Router { router.route("/metrics", get(metrics_handler)) }

#[cfg(test)]
mod tests {
    use axum::{Json, routing::get};

    use super::*;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn local_config() -> RestServerConfig {
        RestServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..RestServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rest_server_lifecycle() {
        init_test_logging();

        let handlers: Vec<fn(Router) -> Router> = vec![health_routes, metrics_routes];
        let mut handler = start_rest_server(local_config(), handlers).await.unwrap();
        handler.wait_for_start().await.unwrap();
        let base = format!("http://{}", handler.local_addr());

        let client = reqwest::Client::new();
        let response = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let response = client.get(format!("{base}/api/v1/health")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let response = client.get(format!("{base}/metrics")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        handler.shutdown();
        handler.wait_for_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rest_server_without_cors() {
        init_test_logging();

        let config = RestServerConfig {
            enable_cors: false,
            ..local_config()
        };
        let mut handler = start_rest_server(config, vec![health_routes]).await.unwrap();
        handler.wait_for_start().await.unwrap();

        let response = reqwest::get(format!("http://{}/health", handler.local_addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        handler.shutdown();
        handler.wait_for_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_boxed_route_handlers() {
        init_test_logging();

        async fn goodbye_handler() -> Json<&'static str> { Json("Goodbye, World!") }

        let greeting = "Goodbye, World!";
        let handlers: Vec<RouteHandler> = vec![
            Box::new(health_routes),
            Box::new(|router: Router| router.route("/api/v1/goodbye", get(goodbye_handler))),
        ];
        let mut handler = start_rest_server(local_config(), handlers).await.unwrap();
        handler.wait_for_start().await.unwrap();

        let response = reqwest::get(format!("http://{}/api/v1/goodbye", handler.local_addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.json::<String>().await.unwrap(), greeting);

        handler.shutdown();
        handler.wait_for_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_errors_surface_immediately() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RestServerConfig {
            bind_address: taken.local_addr().unwrap().to_string(),
            ..RestServerConfig::default()
        };
        assert!(start_rest_server(config, vec![health_routes]).await.is_err());

        let config = RestServerConfig {
            bind_address: "not-an-address".to_string(),
            ..RestServerConfig::default()
        };
        assert!(start_rest_server(config, vec![health_routes]).await.is_err());
    }
}
