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

//! Prometheus metrics of the download path, registered in the default
//! registry on first use.

use std::sync::LazyLock;

use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

pub static REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_download_requests_total",
        "Download requests by route and outcome",
        &["route", "outcome"]
    )
    .unwrap()
});

pub static RATE_LIMITED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_rate_limited_total",
        "Requests rejected by the fixed-window rate limiter",
        &["route"]
    )
    .unwrap()
});

pub static QUOTA_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_quota_rejections_total",
        "Requests rejected because the hard egress limit was reached",
        &["tier"]
    )
    .unwrap()
});

pub static EGRESS_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_egress_bytes_total",
        "Bytes committed to egress counters",
        &["tier"]
    )
    .unwrap()
});

pub static USAGE_WARNINGS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_usage_warnings_total",
        "Usage warnings enqueued",
        &["level"]
    )
    .unwrap()
});

pub static ARCHIVES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_archives_total",
        "Archive streams by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static ARCHIVE_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("dlgate_archive_bytes_total", "Archive bytes handed to clients").unwrap()
});

pub static ACTIVE_ARCHIVES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("dlgate_active_archives", "Archive streams in progress").unwrap()
});

pub static PRESIGN_CACHE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dlgate_presign_cache_total",
        "Presigned URL lookups by cache outcome",
        &["outcome"]
    )
    .unwrap()
});
