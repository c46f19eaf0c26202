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

//! Monthly egress accounting per tenant.
//!
//! Every tenant owns four counters that expire at the end of the current UTC
//! calendar month: bytes, downloads and the two one-shot warning flags.
//! Rollover falls out of the counter store's replace-on-expiry rule, so it
//! happens lazily on first access in a new month and at most once.
//!
//! The check and the commit are two separate store operations. Concurrent
//! requests of one tenant may both pass the hard limit check before either
//! commits and overshoot the limit slightly. Egress limits are business
//! guards, not security boundaries, so this is accepted.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{OptionExt, ensure};
use tracing::{debug, info};

use crate::{
    counter::CounterStore,
    error::{ConfigError, EgressError, InvalidEgressPolicySnafu, TenantNotFoundSnafu},
    metrics,
    notifier::{Notifier, UsageWarning, WarningLevel},
    service::Route,
    tenant::{TenantDirectory, TenantId, TenantRecord, Tier},
};

/// Quota thresholds, as multiples of a tenant's stored bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct EgressPolicy {
    #[default = 3]
    pub soft_multiplier:    u64,
    #[default = 5]
    pub hard_multiplier:    u64,
    /// Fraction of the soft limit at which the first warning goes out.
    #[default = 0.8]
    pub soft_warning_ratio: f64,
    #[default = 1.0]
    pub hard_warning_ratio: f64,
}

impl EgressPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.soft_multiplier > 0 && self.soft_multiplier <= self.hard_multiplier,
            InvalidEgressPolicySnafu {
                reason: "multipliers must satisfy 0 < soft <= hard",
            }
        );
        ensure!(
            self.soft_warning_ratio > 0.0 && self.soft_warning_ratio <= self.hard_warning_ratio,
            InvalidEgressPolicySnafu {
                reason: "warning ratios must satisfy 0 < soft <= hard",
            }
        );
        Ok(())
    }

    /// Soft and hard limits for a tenant. A tenant without stored bytes is
    /// measured against the transfer itself, so a first download always fits.
    #[must_use]
    pub const fn limits(&self, baseline_bytes: u64, requested_bytes: u64) -> (u64, u64) {
        let base = if baseline_bytes == 0 {
            requested_bytes
        } else {
            baseline_bytes
        };
        (
            base.saturating_mul(self.soft_multiplier),
            base.saturating_mul(self.hard_multiplier),
        )
    }
}

/// The UTC calendar month an instant falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

impl BillingPeriod {
    #[must_use]
    pub fn containing(now: DateTime<Utc>) -> Self {
        let first = now.date_naive().with_day(1).unwrap_or_else(|| now.date_naive());
        let end = first
            .checked_add_months(Months::new(1))
            .map_or(DateTime::<Utc>::MAX_UTC, |next| next.and_time(NaiveTime::MIN).and_utc());
        Self {
            start: first.and_time(NaiveTime::MIN).and_utc(),
            end,
        }
    }
}

/// What a transfer is for, carried into logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferContext {
    pub route:   Route,
    pub objects: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EgressDecision {
    pub allowed:          bool,
    /// Bytes of the period after this request was accounted, or the unchanged
    /// total when it was rejected.
    pub used_bytes:       u64,
    pub soft_limit_bytes: u64,
    pub hard_limit_bytes: u64,
    pub period:           BillingPeriod,
}

/// Snapshot of a tenant's counters for the current period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantEgressCounter {
    pub tenant:                 TenantId,
    pub tier:                   Tier,
    pub period_start:           DateTime<Utc>,
    pub period_end:             DateTime<Utc>,
    pub bytes_this_period:      u64,
    pub downloads_this_period:  u64,
    pub soft_warning_sent_at:   Option<DateTime<Utc>>,
    pub hard_warning_sent_at:   Option<DateTime<Utc>>,
    pub storage_baseline_bytes: u64,
    pub soft_limit_bytes:       u64,
    pub hard_limit_bytes:       u64,
}

struct CounterKeys {
    bytes:        String,
    downloads:    String,
    soft_warning: String,
    hard_warning: String,
}

impl CounterKeys {
    fn new(tenant: &TenantId) -> Self {
        Self {
            bytes:        format!("egress/{tenant}/bytes"),
            downloads:    format!("egress/{tenant}/downloads"),
            soft_warning: format!("egress/{tenant}/soft-warning"),
            hard_warning: format!("egress/{tenant}/hard-warning"),
        }
    }

    fn warning(&self, level: WarningLevel) -> &str {
        match level {
            WarningLevel::Soft => &self.soft_warning,
            WarningLevel::Hard => &self.hard_warning,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EgressMeter {
    store:    Arc<dyn CounterStore>,
    tenants:  Arc<dyn TenantDirectory>,
    notifier: Arc<dyn Notifier>,
    policy:   EgressPolicy,
}

impl EgressMeter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        tenants: Arc<dyn TenantDirectory>,
        notifier: Arc<dyn Notifier>,
        policy: EgressPolicy,
    ) -> Self {
        Self {
            store,
            tenants,
            notifier,
            policy,
        }
    }

    pub fn check_and_track(
        &self,
        tenant: &TenantId,
        bytes: u64,
        context: TransferContext,
    ) -> Result<EgressDecision, EgressError> {
        self.check_and_track_at(tenant, bytes, context, Utc::now())
    }

    /// Admits or rejects a transfer of `bytes` and, when admitted, commits it
    /// to the tenant's period counters before any byte is sent.
    pub fn check_and_track_at(
        &self,
        tenant: &TenantId,
        bytes: u64,
        context: TransferContext,
        now: DateTime<Utc>,
    ) -> Result<EgressDecision, EgressError> {
        let record = self.record(tenant)?;
        let period = BillingPeriod::containing(now);
        let keys = CounterKeys::new(tenant);
        let (soft_limit, hard_limit) = self.policy.limits(record.storage_baseline_bytes, bytes);

        let used = self
            .store
            .get(&keys.bytes, now)?
            .map_or(0, |entry| entry.value);
        if record.tier.enforces_hard_limit() && used.saturating_add(bytes) > hard_limit {
            debug!(
                %tenant,
                route = %context.route,
                used,
                bytes,
                hard_limit,
                "Egress quota exhausted"
            );
            metrics::QUOTA_REJECTIONS
                .with_label_values(&[record.tier.as_str()])
                .inc();
            return Ok(EgressDecision {
                allowed: false,
                used_bytes: used,
                soft_limit_bytes: soft_limit,
                hard_limit_bytes: hard_limit,
                period,
            });
        }

        // Anchoring at the period start rolls over stale counters and records
        // the period start as the counter's start.
        let committed = self
            .store
            .increment(&keys.bytes, bytes, period.start, period.end)?;
        self.store
            .increment(&keys.downloads, 1, period.start, period.end)?;
        metrics::EGRESS_BYTES
            .with_label_values(&[record.tier.as_str()])
            .inc_by(bytes);
        debug!(
            %tenant,
            route = %context.route,
            objects = context.objects,
            bytes,
            used = committed.value,
            "Egress committed"
        );

        #[allow(clippy::cast_precision_loss)]
        let percent = if soft_limit == 0 {
            0.0
        } else {
            committed.value as f64 / soft_limit as f64
        };
        for (level, threshold) in [
            (WarningLevel::Soft, self.policy.soft_warning_ratio),
            (WarningLevel::Hard, self.policy.hard_warning_ratio),
        ] {
            if percent >= threshold {
                self.warn_once(&record, &keys, &period, level, now, UsageWarning {
                    tenant: tenant.clone(),
                    level,
                    percent,
                    used_bytes: committed.value,
                    soft_limit_bytes: soft_limit,
                    hard_limit_bytes: hard_limit,
                })?;
            }
        }

        Ok(EgressDecision {
            allowed: true,
            used_bytes: committed.value,
            soft_limit_bytes: soft_limit,
            hard_limit_bytes: hard_limit,
            period,
        })
    }

    fn warn_once(
        &self,
        record: &TenantRecord,
        keys: &CounterKeys,
        period: &BillingPeriod,
        level: WarningLevel,
        now: DateTime<Utc>,
        warning: UsageWarning,
    ) -> Result<(), EgressError> {
        let flag = keys.warning(level);
        if self.store.get(flag, now)?.is_some() {
            return Ok(());
        }
        // Only the request that raises the flag from zero sends the warning.
        if self.store.increment(flag, 1, now, period.end)?.value != 1 {
            return Ok(());
        }
        info!(
            tenant = %record.id,
            tier = %record.tier,
            level = %level,
            used = warning.used_bytes,
            soft_limit = warning.soft_limit_bytes,
            "Egress usage warning"
        );
        metrics::USAGE_WARNINGS
            .with_label_values(&[level.as_str()])
            .inc();
        self.notifier.send_usage_warning(warning);
        Ok(())
    }

    pub fn usage(&self, tenant: &TenantId) -> Result<TenantEgressCounter, EgressError> {
        self.usage_at(tenant, Utc::now())
    }

    pub fn usage_at(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<TenantEgressCounter, EgressError> {
        let record = self.record(tenant)?;
        let period = BillingPeriod::containing(now);
        let keys = CounterKeys::new(tenant);
        let (soft_limit, hard_limit) = self.policy.limits(record.storage_baseline_bytes, 0);
        let value = |key: &str| -> Result<u64, EgressError> {
            Ok(self.store.get(key, now)?.map_or(0, |entry| entry.value))
        };
        let sent_at = |key: &str| -> Result<Option<DateTime<Utc>>, EgressError> {
            Ok(self.store.get(key, now)?.map(|entry| entry.started_at))
        };
        Ok(TenantEgressCounter {
            tenant:                 record.id,
            tier:                   record.tier,
            period_start:           period.start,
            period_end:             period.end,
            bytes_this_period:      value(&keys.bytes)?,
            downloads_this_period:  value(&keys.downloads)?,
            soft_warning_sent_at:   sent_at(&keys.soft_warning)?,
            hard_warning_sent_at:   sent_at(&keys.hard_warning)?,
            storage_baseline_bytes: record.storage_baseline_bytes,
            soft_limit_bytes:       soft_limit,
            hard_limit_bytes:       hard_limit,
        })
    }

    fn record(&self, tenant: &TenantId) -> Result<TenantRecord, EgressError> {
        self.tenants
            .record(tenant)
            .context(TenantNotFoundSnafu {
                tenant: tenant.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, thread};

    use chrono::TimeZone;
    use dlgate_base::readable_size::ReadableSize;

    use super::*;
    use crate::{
        counter::MemoryCounterStore,
        tenant::{StaticTenantDirectory, TenantConfig},
    };

    #[derive(Debug, Default)]
    struct RecordingNotifier(Mutex<Vec<UsageWarning>>);

    impl RecordingNotifier {
        fn levels(&self) -> Vec<WarningLevel> {
            self.0.lock().unwrap().iter().map(|w| w.level).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send_usage_warning(&self, warning: UsageWarning) { self.0.lock().unwrap().push(warning); }
    }

    const CTX: TransferContext = TransferContext {
        route:   Route::File,
        objects: 1,
    };

    struct Fixture {
        meter:    EgressMeter,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(tier: Tier, baseline: u64) -> Fixture {
        let tenants = StaticTenantDirectory::from_config(&[TenantConfig {
            id: "acme".into(),
            tier,
            session_tokens: vec![],
            storage_baseline: ReadableSize(baseline),
        }]);
        let notifier = Arc::new(RecordingNotifier::default());
        let meter = EgressMeter::new(
            Arc::new(MemoryCounterStore::default()),
            Arc::new(tenants),
            notifier.clone(),
            EgressPolicy::default(),
        );
        Fixture { meter, notifier }
    }

    fn acme() -> TenantId { "acme".into() }

    fn march(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_billing_period() {
        let period = BillingPeriod::containing(Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap());
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());

        let december = BillingPeriod::containing(Utc.with_ymd_and_hms(2025, 12, 31, 12, 0, 0).unwrap());
        assert_eq!(december.end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_bytes_equal_sum_of_accepted_transfers() {
        let Fixture { meter, .. } = fixture(Tier::Basic, 100);
        let mut accepted = 0;
        for (i, bytes) in [120, 90, 200, 40, 60, 10, 3].into_iter().enumerate() {
            let decision = meter
                .check_and_track_at(&acme(), bytes, CTX, march(2, u32::try_from(i).unwrap()))
                .unwrap();
            if decision.allowed {
                accepted += bytes;
            }
            assert_eq!(decision.used_bytes, accepted);
        }
        let usage = meter.usage_at(&acme(), march(3, 0)).unwrap();
        assert_eq!(usage.bytes_this_period, accepted);
        assert_eq!(usage.bytes_this_period, 120 + 90 + 200 + 40 + 10 + 3);
        assert_eq!(usage.downloads_this_period, 6);
    }

    #[test]
    fn test_rollover_is_idempotent_within_month() {
        let Fixture { meter, .. } = fixture(Tier::Pro, 1000);
        meter.check_and_track_at(&acme(), 10, CTX, march(1, 0)).unwrap();
        meter.check_and_track_at(&acme(), 20, CTX, march(15, 0)).unwrap();
        meter.check_and_track_at(&acme(), 30, CTX, march(31, 23)).unwrap();

        let usage = meter.usage_at(&acme(), march(31, 23)).unwrap();
        assert_eq!(usage.bytes_this_period, 60);
        assert_eq!(usage.period_start, march(1, 0));

        let april = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let rolled = meter.usage_at(&acme(), april).unwrap();
        assert_eq!(rolled.bytes_this_period, 0);
        assert_eq!(rolled.downloads_this_period, 0);

        meter.check_and_track_at(&acme(), 5, CTX, april).unwrap();
        meter.check_and_track_at(&acme(), 5, CTX, april).unwrap();
        let usage = meter.usage_at(&acme(), april).unwrap();
        assert_eq!(usage.bytes_this_period, 10);
        assert_eq!(usage.downloads_this_period, 2);
        assert_eq!(usage.period_start, april);
    }

    #[test]
    fn test_hard_limit_boundary() {
        // baseline 100: soft 300, hard 500
        let Fixture { meter, .. } = fixture(Tier::Free, 100);
        assert!(meter.check_and_track_at(&acme(), 400, CTX, march(1, 1)).unwrap().allowed);

        let over = meter.check_and_track_at(&acme(), 101, CTX, march(1, 2)).unwrap();
        assert!(!over.allowed);
        assert_eq!(over.used_bytes, 400);
        assert_eq!(over.hard_limit_bytes, 500);

        let exact = meter.check_and_track_at(&acme(), 100, CTX, march(1, 3)).unwrap();
        assert!(exact.allowed);
        assert_eq!(exact.used_bytes, 500);

        assert!(!meter.check_and_track_at(&acme(), 1, CTX, march(1, 4)).unwrap().allowed);
        assert_eq!(meter.usage_at(&acme(), march(1, 5)).unwrap().bytes_this_period, 500);
    }

    #[test]
    fn test_unenforced_tiers_always_allow() {
        let Fixture { meter, notifier } = fixture(Tier::Enterprise, 10);
        let decision = meter.check_and_track_at(&acme(), 1_000, CTX, march(1, 0)).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.used_bytes, 1_000);
        assert_eq!(notifier.levels(), [WarningLevel::Soft, WarningLevel::Hard]);
    }

    #[test]
    fn test_zero_baseline_never_blocks_first_download() {
        let Fixture { meter, .. } = fixture(Tier::Free, 0);
        let decision = meter.check_and_track_at(&acme(), 1 << 30, CTX, march(1, 0)).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.hard_limit_bytes, 5 << 30);
    }

    #[test]
    fn test_warnings_fire_once_per_period() {
        // soft limit 300: soft warning from 240, hard warning from 300
        let Fixture { meter, notifier } = fixture(Tier::Pro, 100);
        meter.check_and_track_at(&acme(), 200, CTX, march(1, 0)).unwrap();
        assert!(notifier.levels().is_empty());

        meter.check_and_track_at(&acme(), 50, CTX, march(2, 0)).unwrap();
        meter.check_and_track_at(&acme(), 10, CTX, march(3, 0)).unwrap();
        assert_eq!(notifier.levels(), [WarningLevel::Soft]);

        for day in 4..10 {
            meter.check_and_track_at(&acme(), 100, CTX, march(day, 0)).unwrap();
        }
        assert_eq!(notifier.levels(), [WarningLevel::Soft, WarningLevel::Hard]);

        let usage = meter.usage_at(&acme(), march(20, 0)).unwrap();
        assert_eq!(usage.soft_warning_sent_at, Some(march(2, 0)));
        assert_eq!(usage.hard_warning_sent_at, Some(march(4, 0)));

        let april = Utc.with_ymd_and_hms(2025, 4, 2, 0, 0, 0).unwrap();
        let rolled = meter.usage_at(&acme(), april).unwrap();
        assert_eq!(rolled.soft_warning_sent_at, None);
        assert_eq!(rolled.hard_warning_sent_at, None);

        meter.check_and_track_at(&acme(), 300, CTX, april).unwrap();
        assert_eq!(notifier.levels(), [
            WarningLevel::Soft,
            WarningLevel::Hard,
            WarningLevel::Soft,
            WarningLevel::Hard
        ]);
        let warning = notifier.0.lock().unwrap().last().cloned().unwrap();
        assert!((warning.percent - 1.0).abs() < f64::EPSILON);
        assert_eq!(warning.soft_limit_bytes, 300);
    }

    #[test]
    fn test_missing_tenant_is_a_configuration_error() {
        let Fixture { meter, .. } = fixture(Tier::Pro, 100);
        let error = meter
            .check_and_track_at(&"ghost".into(), 1, CTX, march(1, 0))
            .unwrap_err();
        assert!(matches!(error, EgressError::TenantNotFound { .. }));
    }

    #[test]
    fn test_concurrent_tracking_never_loses_bytes() {
        let Fixture { meter, .. } = fixture(Tier::Pro, 1 << 20);
        let meter = Arc::new(meter);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let meter = Arc::clone(&meter);
                thread::spawn(move || {
                    for _ in 0..250 {
                        meter.check_and_track_at(&acme(), 3, CTX, march(5, 0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let usage = meter.usage_at(&acme(), march(5, 1)).unwrap();
        assert_eq!(usage.bytes_this_period, 3000);
        assert_eq!(usage.downloads_this_period, 1000);
    }

    #[test]
    fn test_policy_validation() {
        assert!(EgressPolicy::default().validate().is_ok());
        let inverted = EgressPolicy {
            soft_multiplier: 6,
            ..EgressPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }
}
