//! Process-local counters exposed as JSON at `/metrics`.
//!
//! The hot path only touches relaxed atomics; the snapshot read by the
//! metrics endpoint may lag a write by an instruction or two, which is fine
//! for counters.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Gateway-wide counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    requests_total: AtomicU64,
    auth_failures: AtomicU64,
    no_route: AtomicU64,
    rate_limited: AtomicU64,
    quota_exceeded: AtomicU64,
    abuse_blocked: AtomicU64,
    cache_hits: AtomicU64,
    cache_stale: AtomicU64,
    cache_misses: AtomicU64,
    cache_bypass: AtomicU64,
    negative_hits: AtomicU64,
    coalesced_waits: AtomicU64,
    revalidations: AtomicU64,
    upstream_errors: AtomicU64,
    upstream_timeouts: AtomicU64,
    internal_errors: AtomicU64,
    kv_degraded: AtomicBool,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub auth_failures: u64,
    pub no_route: u64,
    pub rate_limited: u64,
    pub quota_exceeded: u64,
    pub abuse_blocked: u64,
    pub cache_hits: u64,
    pub cache_stale: u64,
    pub cache_misses: u64,
    pub cache_bypass: u64,
    pub negative_hits: u64,
    pub coalesced_waits: u64,
    pub revalidations: u64,
    pub upstream_errors: u64,
    pub upstream_timeouts: u64,
    pub internal_errors: u64,
    pub cache_hit_rate: f64,
    pub log_records_dropped: u64,
    pub kv_degraded: bool,
}

macro_rules! counter_methods {
    ($($increment:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $increment(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter_methods! {
        record_request => requests_total,
        record_auth_failure => auth_failures,
        record_no_route => no_route,
        record_rate_limited => rate_limited,
        record_quota_exceeded => quota_exceeded,
        record_abuse_blocked => abuse_blocked,
        record_cache_hit => cache_hits,
        record_cache_stale => cache_stale,
        record_cache_miss => cache_misses,
        record_cache_bypass => cache_bypass,
        record_negative_hit => negative_hits,
        record_coalesced_wait => coalesced_waits,
        record_revalidation => revalidations,
        record_upstream_error => upstream_errors,
        record_upstream_timeout => upstream_timeouts,
        record_internal_error => internal_errors,
    }

    pub fn set_kv_degraded(&self, degraded: bool) {
        self.kv_degraded.store(degraded, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_kv_degraded(&self) -> bool {
        self.kv_degraded.load(Ordering::Relaxed)
    }

    /// `log_records_dropped` comes from the log queue, which owns that count.
    #[must_use]
    pub fn snapshot(&self, log_records_dropped: u64) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let stale = self.cache_stale.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let decided = hits + stale + misses;
        let cache_hit_rate =
            if decided == 0 { 0.0 } else { (hits + stale) as f64 / decided as f64 };

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            quota_exceeded: self.quota_exceeded.load(Ordering::Relaxed),
            abuse_blocked: self.abuse_blocked.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_stale: stale,
            cache_misses: misses,
            cache_bypass: self.cache_bypass.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            upstream_timeouts: self.upstream_timeouts.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            cache_hit_rate,
            log_records_dropped,
            kv_degraded: self.is_kv_degraded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_rate_limited();

        let snap = metrics.snapshot(3);
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.log_records_dropped, 3);
        assert!((snap.cache_hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_with_no_traffic() {
        let snap = MetricsCollector::new().snapshot(0);
        assert_eq!(snap.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_degraded_flag() {
        let metrics = MetricsCollector::new();
        assert!(!metrics.snapshot(0).kv_degraded);
        metrics.set_kv_degraded(true);
        assert!(metrics.snapshot(0).kv_degraded);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot(0)).unwrap();
        assert!(json.get("requests_total").is_some());
        assert!(json.get("kv_degraded").is_some());
    }
}
