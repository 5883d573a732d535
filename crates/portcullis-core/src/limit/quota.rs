//! Daily and monthly request quotas.
//!
//! One counter per key per UTC calendar period, TTL'd to the period's end so
//! reset needs no scheduler. Counters are incremented first and compared
//! after, so a denied request is never double-counted; the cost is that a
//! quota may over-serve by one.

use crate::kv::{KvError, KvStore};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Which quota denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Daily,
    Monthly,
}

impl QuotaScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

/// Quota verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny { scope: QuotaScope, retry_after_seconds: u64 },
}

impl QuotaDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Calendar-period quota counters over the KV store.
pub struct QuotaCounter {
    kv: Arc<dyn KvStore>,
}

impl QuotaCounter {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Counts this request against both periods and checks the configured
    /// quotas (`0` means unlimited). Fails open on KV trouble.
    pub async fn check_and_increment(
        &self,
        api_key_id: &str,
        quota_daily: i64,
        quota_monthly: i64,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        match self.try_check(api_key_id, quota_daily, quota_monthly, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(api_key_id, error = %e, "quota counter degraded, admitting");
                QuotaDecision::Allow
            }
        }
    }

    async fn try_check(
        &self,
        api_key_id: &str,
        quota_daily: i64,
        quota_monthly: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, KvError> {
        let day_key = format!("quota:day:{api_key_id}:{}", now.format("%Y%m%d"));
        let month_key = format!("quota:mon:{api_key_id}:{}", now.format("%Y%m"));

        let day_count = self.kv.incr(&day_key, 1).await?;
        if day_count == 1 {
            self.kv.expire(&day_key, until_next_day(now)).await?;
        }

        let month_count = self.kv.incr(&month_key, 1).await?;
        if month_count == 1 {
            self.kv.expire(&month_key, until_next_month(now)).await?;
        }

        if quota_daily > 0 && day_count > quota_daily {
            return Ok(QuotaDecision::Deny {
                scope: QuotaScope::Daily,
                retry_after_seconds: until_next_day(now).as_secs().max(1),
            });
        }

        if quota_monthly > 0 && month_count > quota_monthly {
            return Ok(QuotaDecision::Deny {
                scope: QuotaScope::Monthly,
                retry_after_seconds: until_next_month(now).as_secs().max(1),
            });
        }

        Ok(QuotaDecision::Allow)
    }

    /// Current usage, for diagnostics.
    pub async fn usage(&self, api_key_id: &str, now: DateTime<Utc>) -> Result<(i64, i64), KvError> {
        let day_key = format!("quota:day:{api_key_id}:{}", now.format("%Y%m%d"));
        let month_key = format!("quota:mon:{api_key_id}:{}", now.format("%Y%m"));

        let parse = |raw: Option<bytes::Bytes>| {
            raw.and_then(|b| std::str::from_utf8(&b).ok().and_then(|s| s.parse::<i64>().ok()))
                .unwrap_or(0)
        };
        let day = parse(self.kv.get(&day_key).await?);
        let month = parse(self.kv.get(&month_key).await?);
        Ok((day, month))
    }
}

/// Seconds until the next UTC midnight.
fn until_next_day(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt));
    match next {
        Some(next) => Duration::from_secs((next - now).num_seconds().max(1) as u64),
        None => Duration::from_secs(86_400),
    }
}

/// Seconds until the first instant of the next UTC month.
fn until_next_month(now: DateTime<Utc>) -> Duration {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt));
    match next {
        Some(next) => Duration::from_secs((next - now).num_seconds().max(1) as u64),
        None => Duration::from_secs(31 * 86_400),
    }
}
