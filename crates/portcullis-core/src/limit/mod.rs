//! Per-key, per-route rate limiting over the KV store.
//!
//! Two algorithms, selectable per API key. The default token bucket keeps a
//! small JSON record per `(key, route)` and refills it on read; writes are
//! plain read-modify-write, not CAS, so an occasional lost update under
//! contention is accepted. The sliding window counts requests in fixed
//! windows via atomic increments.
//!
//! KV trouble fails open: a gateway that cannot reach its counters admits
//! traffic rather than refusing it.

pub mod quota;

pub use quota::{QuotaCounter, QuotaDecision, QuotaScope};

use crate::kv::{KvError, KvStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

/// Sliding-window length. The window limit is `rps * WINDOW_SECONDS`.
const WINDOW_SECONDS: u64 = 10;

/// Rate limiting algorithm, selectable per API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

impl RateLimitAlgorithm {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "token_bucket" => Some(Self::TokenBucket),
            "sliding_window" => Some(Self::SlidingWindow),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

/// Limiter verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    Deny { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Token bucket state stored per `(api_key, route)`.
#[derive(Debug, Serialize, Deserialize)]
struct BucketRecord {
    tokens: f64,
    last_refill_ts: f64,
}

/// KV-coordinated rate limiter.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Checks one request against the key's effective limits.
    ///
    /// `rps` must be positive; `burst` of zero admits nothing (token bucket)
    /// or falls back to the window product (sliding window).
    pub async fn check(
        &self,
        api_key_id: &str,
        route_id: &str,
        rps: f64,
        burst: u32,
        algorithm: RateLimitAlgorithm,
    ) -> RateLimitDecision {
        let result = match algorithm {
            RateLimitAlgorithm::TokenBucket => {
                self.check_token_bucket(api_key_id, route_id, rps, burst).await
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.check_sliding_window(api_key_id, route_id, rps).await
            }
        };

        match result {
            Ok(decision) => decision,
            Err(e) => {
                warn!(api_key_id, route_id, error = %e, "rate limiter degraded, admitting");
                RateLimitDecision::Allow
            }
        }
    }

    async fn check_token_bucket(
        &self,
        api_key_id: &str,
        route_id: &str,
        rps: f64,
        burst: u32,
    ) -> Result<RateLimitDecision, KvError> {
        if rps <= 0.0 {
            return Ok(RateLimitDecision::Deny { retry_after_seconds: WINDOW_SECONDS });
        }

        let key = format!("ratelimit:tb:{api_key_id}:{route_id}");
        let now = unix_seconds_f64();
        let capacity = f64::from(burst);

        let mut record = match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_slice::<BucketRecord>(&raw)
                .unwrap_or(BucketRecord { tokens: capacity, last_refill_ts: now }),
            None => BucketRecord { tokens: capacity, last_refill_ts: now },
        };

        let elapsed = (now - record.last_refill_ts).max(0.0);
        record.tokens = (record.tokens + elapsed * rps).min(capacity);
        record.last_refill_ts = now;

        let decision = if record.tokens >= 1.0 {
            record.tokens -= 1.0;
            RateLimitDecision::Allow
        } else {
            let wait = (1.0 - record.tokens) / rps;
            RateLimitDecision::Deny { retry_after_seconds: wait.ceil().max(1.0) as u64 }
        };

        let ttl = Duration::from_secs_f64((capacity / rps).max(1.0) + 60.0);
        let raw = serde_json::to_vec(&record)
            .map_err(|e| KvError::Value(format!("bucket encode: {e}")))?;
        self.kv.set(&key, Bytes::from(raw), Some(ttl)).await?;

        Ok(decision)
    }

    async fn check_sliding_window(
        &self,
        api_key_id: &str,
        route_id: &str,
        rps: f64,
    ) -> Result<RateLimitDecision, KvError> {
        if rps <= 0.0 {
            return Ok(RateLimitDecision::Deny { retry_after_seconds: WINDOW_SECONDS });
        }

        let now = unix_seconds();
        let window_start = now - (now % WINDOW_SECONDS);
        let window_end = window_start + WINDOW_SECONDS;
        let key = format!("ratelimit:sw:{api_key_id}:{route_id}:{window_start}");
        let limit = (rps * WINDOW_SECONDS as f64).floor().max(1.0) as i64;

        let count = self.kv.incr(&key, 1).await?;
        if count == 1 {
            self.kv.expire(&key, Duration::from_secs(WINDOW_SECONDS)).await?;
        }

        if count > limit {
            Ok(RateLimitDecision::Deny {
                retry_after_seconds: window_end.saturating_sub(now).max(1),
            })
        } else {
            Ok(RateLimitDecision::Allow)
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn unix_seconds_f64() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
