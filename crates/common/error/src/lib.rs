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

use std::{any::Any, error::Error as StdError, sync::Arc};

use http::StatusCode as HttpStatusCode;
use serde::Serialize;
use snafu::Snafu;
use strum::EnumProperty;

/// Client-facing error classification shared by every dlgate crate.
///
/// The `http_status` property decides what the REST layer answers with.
/// `ServiceUnavailable` is deliberately surfaced as a plain 500 so that
/// object-store trouble never leaks to clients.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    strum_macros::EnumProperty,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    #[strum(props(http_status = "400"))]
    InvalidArgument,
    #[strum(props(http_status = "404"))]
    NotFound,
    #[strum(props(http_status = "401"))]
    Unauthorized,
    #[strum(props(http_status = "403"))]
    Forbidden,
    #[strum(props(http_status = "429"))]
    TooManyRequests,
    #[strum(props(http_status = "500"))]
    ServiceUnavailable,
    #[strum(props(http_status = "500"))]
    Internal,
    #[strum(props(http_status = "500"))]
    Unknown,
}

impl StatusCode {
    pub fn http_status(self) -> HttpStatusCode {
        self.get_str("http_status")
            .and_then(|value| value.parse::<u16>().ok())
            .and_then(|value| HttpStatusCode::from_u16(value).ok())
            .unwrap_or(HttpStatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Whether errors with this code hide their details from clients.
    #[must_use]
    pub const fn is_server_error(self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::Internal | Self::Unknown)
    }
}

pub trait StackError: StdError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>);

    fn next(&self) -> Option<&dyn StackError>;

    fn last(&self) -> &dyn StackError
    where
        Self: Sized,
    {
        let Some(mut result) = self.next() else {
            return self;
        };
        while let Some(err) = result.next() {
            result = err;
        }
        result
    }

    fn transparent(&self) -> bool { false }
}

pub trait ErrorExt: StackError {
    fn status_code(&self) -> StatusCode { StatusCode::Unknown }

    fn as_any(&self) -> &dyn Any;

    fn output_msg(&self) -> String
    where
        Self: Sized,
    {
        let code = self.status_code();
        if code.is_server_error() {
            return "Internal error".to_string();
        }
        let error = self.last();
        if let Some(external_error) = error.source() {
            let mut root = external_error;
            while let Some(source) = root.source() {
                root = source;
            }
            if error.transparent() {
                format!("{root}")
            } else {
                format!("{error}: {root}")
            }
        } else {
            format!("{error}")
        }
    }

    fn root_cause(&self) -> Option<&dyn StdError>
    where
        Self: Sized,
    {
        let error = self.last();
        let mut source = error.source()?;
        while let Some(next) = source.source() {
            source = next;
        }
        Some(source)
    }
}

impl<T: ?Sized + StackError> StackError for Arc<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

impl<T: StackError> StackError for Box<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(transparent)]
    Network {
        source: NetworkError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum NetworkError {
    #[snafu(display("Failed to bind {addr}"))]
    BindError {
        addr:   String,
        #[snafu(source)]
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Server on {addr} stopped before accepting connections"))]
    ServerStopped {
        addr: String,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    #[snafu(display("Failed to parse address {addr}"))]
    ParseAddressError {
        addr:   String,
        #[snafu(source)]
        source: std::net::AddrParseError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Snafu)]
    enum Leaf {
        #[snafu(display("quota exhausted"))]
        Quota,
        #[snafu(display("bucket offline"))]
        Offline { source: std::io::Error },
    }

    impl StackError for Leaf {
        fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
            buf.push(format!("{layer}: {self}"));
        }

        fn next(&self) -> Option<&dyn StackError> { None }
    }

    impl ErrorExt for Leaf {
        fn status_code(&self) -> StatusCode {
            match self {
                Self::Quota => StatusCode::TooManyRequests,
                Self::Offline { .. } => StatusCode::ServiceUnavailable,
            }
        }

        fn as_any(&self) -> &dyn Any { self }
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(StatusCode::NotFound.http_status(), HttpStatusCode::NOT_FOUND);
        assert_eq!(
            StatusCode::TooManyRequests.http_status(),
            HttpStatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StatusCode::ServiceUnavailable.http_status(),
            HttpStatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!("too_many_requests".parse::<StatusCode>().unwrap(), StatusCode::TooManyRequests);
    }

    #[test]
    fn test_output_msg_hides_server_errors() {
        let offline = Leaf::Offline {
            source: std::io::Error::other("s3 timed out"),
        };
        assert_eq!(offline.output_msg(), "Internal error");
        assert_eq!(offline.root_cause().unwrap().to_string(), "s3 timed out");
        assert_eq!(Leaf::Quota.output_msg(), "quota exhausted");
    }
}
