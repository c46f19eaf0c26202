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

//! Download routes.
//!
//! | Method | Path                                    | Answer                  |
//! |--------|-----------------------------------------|-------------------------|
//! | GET    | `/download/file/{file_id}`              | object bytes            |
//! | GET    | `/download/file/{file_id}/link`         | presigned URL as JSON   |
//! | GET    | `/download/version/{version_id}/archive`| streamed zip            |
//! | GET    | `/download/usage`                       | egress counters as JSON |
//! | GET    | `/objects/{key}?expires=&signature=`    | object bytes            |

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderName, header, request::Parts},
    response::{AppendHeaders, IntoResponse, Response},
    routing::get,
};
use dlgate_download::{
    DownloadService, FileDownload, PresignedLink, RateLimitDecision, Requester,
    TenantEgressCounter, filename::content_disposition,
};
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    http::RouteHandler,
};

const SESSION_COOKIE: &str = "session";
const UNKNOWN_CLIENT: &str = "unknown";
const NO_STORE: &str = "private, no-store";

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Clone, Debug)]
pub struct DownloadState {
    pub service:             Arc<DownloadService>,
    pub trust_forwarded_for: bool,
}

/// Registers the download routes on a router.
pub fn download_routes(service: Arc<DownloadService>, trust_forwarded_for: bool) -> RouteHandler {
    let state = DownloadState {
        service,
        trust_forwarded_for,
    };
    Box::new(move |router: Router| router.merge(router_for(state.clone())))
}

fn router_for(state: DownloadState) -> Router {
    Router::new()
        .route("/download/file/{file_id}", get(download_file))
        .route("/download/file/{file_id}/link", get(presigned_link))
        .route("/download/version/{version_id}/archive", get(download_archive))
        .route("/download/usage", get(usage))
        .route("/objects/{*key}", get(redeem_link))
        .with_state(state)
}

/// The authenticated tenant and the client address it is rate limited by.
#[derive(Debug)]
pub struct Caller(pub Requester);

impl FromRequestParts<DownloadState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &DownloadState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers);
        let tenant = state.service.authenticate(token.as_deref())?;
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let forwarded = if state.trust_forwarded_for {
            forwarded_client(&parts.headers)
        } else {
            None
        };
        let client = forwarded
            .or(peer)
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
        Ok(Self(Requester { tenant, client }))
    }
}

/// `Authorization: Bearer` wins over the session cookie.
fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(ToString::to_string)
}

fn rate_limit_headers(decision: &RateLimitDecision) -> [(HeaderName, String); 3] {
    [
        (X_RATELIMIT_LIMIT.clone(), decision.limit.to_string()),
        (X_RATELIMIT_REMAINING.clone(), decision.remaining.to_string()),
        (X_RATELIMIT_RESET.clone(), decision.reset_at.timestamp().to_string()),
    ]
}

async fn download_file(
    State(state): State<DownloadState>,
    Caller(requester): Caller,
    Path(file_id): Path<String>,
) -> ApiResult<Response> {
    let download = state
        .service
        .download_file(&requester, &file_id)
        .await
        .map_err(|source| ApiError::TenantDownload {
            tenant: requester.tenant.clone(),
            source,
        })?;
    Ok(file_response(download))
}

fn file_response(download: FileDownload) -> Response {
    let headers = [
        (header::CONTENT_TYPE, download.content_type.to_string()),
        (header::CONTENT_LENGTH, download.size.to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&download.file_name)),
        (header::CACHE_CONTROL, NO_STORE.to_string()),
    ];
    (
        headers,
        AppendHeaders(download.rate_limit.iter().flat_map(rate_limit_headers)),
        Body::from_stream(download.body),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct LinkQuery {
    expires:   i64,
    signature: String,
}

/// Redeems a presigned URL. The signature stands in for the session.
async fn redeem_link(
    State(state): State<DownloadState>,
    Path(key): Path<String>,
    Query(query): Query<LinkQuery>,
) -> ApiResult<Response> {
    let download = state
        .service
        .redeem_link(&key, query.expires, &query.signature)
        .await?;
    Ok(file_response(download))
}

async fn download_archive(
    State(state): State<DownloadState>,
    Caller(requester): Caller,
    Path(version_id): Path<String>,
) -> ApiResult<Response> {
    let archive = state
        .service
        .download_archive(&requester, &version_id)
        .await
        .map_err(|source| ApiError::TenantDownload {
            tenant: requester.tenant.clone(),
            source,
        })?;
    // The zip length is unknown until the producer finishes.
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&archive.file_name)),
        (header::CACHE_CONTROL, NO_STORE.to_string()),
    ];
    Ok((
        headers,
        rate_limit_headers(&archive.rate_limit),
        Body::from_stream(archive.body),
    )
        .into_response())
}

async fn presigned_link(
    State(state): State<DownloadState>,
    Caller(requester): Caller,
    Path(file_id): Path<String>,
) -> ApiResult<Response> {
    let link: PresignedLink = state
        .service
        .presigned_link(&requester, &file_id)
        .await
        .map_err(|source| ApiError::TenantDownload {
            tenant: requester.tenant.clone(),
            source,
        })?;
    Ok((
        [(header::CACHE_CONTROL, NO_STORE)],
        AppendHeaders(link.rate_limit.iter().flat_map(rate_limit_headers)),
        Json(&link),
    )
        .into_response())
}

async fn usage(
    State(state): State<DownloadState>,
    Caller(requester): Caller,
) -> ApiResult<Json<TenantEgressCounter>> {
    let counter = state
        .service
        .usage(&requester.tenant)
        .map_err(|source| ApiError::TenantDownload {
            tenant: requester.tenant.clone(),
            source,
        })?;
    Ok(Json(counter))
}
