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

use std::any::Any;

use axum::{
    Json,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use dlgate_download::{DownloadError, TenantId};
use dlgate_error::{ErrorExt, StackError, StatusCode};
use serde::Serialize;
use snafu::Snafu;
use tracing::{debug, error};
use uuid::Uuid;

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code:           StatusCode,
    pub message:        String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(transparent)]
    Download { source: DownloadError },

    /// A download that failed while serving a known tenant.
    #[snafu(display("Download failed for tenant {tenant}"))]
    TenantDownload {
        tenant: TenantId,
        source: DownloadError,
    },
}

impl ApiError {
    fn download_error(&self) -> &DownloadError {
        match self {
            Self::Download { source } | Self::TenantDownload { source, .. } => source,
        }
    }

    fn tenant(&self) -> Option<&TenantId> {
        match self {
            Self::Download { .. } => None,
            Self::TenantDownload { tenant, .. } => Some(tenant),
        }
    }

    /// Formats the error chain, one layer per line.
    #[must_use]
    pub fn stack(&self) -> String {
        let mut buf = Vec::new();
        self.debug_fmt(0, &mut buf);
        buf.join("\n")
    }
}

impl ErrorExt for ApiError {
    fn status_code(&self) -> StatusCode { self.download_error().status_code() }

    fn as_any(&self) -> &dyn Any { self as _ }
}

impl StackError for ApiError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        match self {
            Self::Download { source } => source.debug_fmt(layer, buf),
            Self::TenantDownload { source, .. } => {
                buf.push(format!("{layer}: {self}"));
                source.debug_fmt(layer + 1, buf);
            }
        }
    }

    fn next(&self) -> Option<&dyn StackError> { Some(self.download_error()) }

    fn transparent(&self) -> bool { matches!(self, Self::Download { .. }) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let status = code.http_status();
        let tenant = self.tenant().map(ToString::to_string);

        let correlation_id = if code.is_server_error() {
            let id = Uuid::new_v4().to_string();
            error!(
                correlation_id = %id,
                tenant = tenant.as_deref().unwrap_or("-"),
                "Request failed:\n{}",
                self.stack()
            );
            Some(id)
        } else {
            debug!(
                tenant = tenant.as_deref().unwrap_or("-"),
                status = status.as_u16(),
                "Request rejected: {}",
                self.download_error()
            );
            None
        };

        let retry_after = self.download_error().retry_after(Utc::now());
        let body = Json(ErrorBody {
            code,
            message: self.download_error().output_msg(),
            correlation_id,
        });
        let mut response = (status, body).into_response();
        if let Some(wait) = retry_after {
            let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
