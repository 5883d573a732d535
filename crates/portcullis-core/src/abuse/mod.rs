//! Traffic anomaly detection with EWMA smoothing and z-score flagging.
//!
//! Each admitted request updates a per-key estimate of the instantaneous
//! request rate (`r = 1/Δt`) and its variance. A sample far enough outside
//! the learned distribution installs a *soft block*: a TTL'd
//! `abuse:block:<key>` entry in the KV store that the pipeline checks before
//! doing any other work, plus a persisted [`BlockedKeyRecord`] for the admin
//! surface. Blocks expire on their own; operators can clear them early.
//!
//! The z-score is taken against the deviation learned *before* the sample:
//! folding the sample into the variance first would let a single large spike
//! inflate the denominator enough to hide itself (bounded by
//! `(1-α)/sqrt(α)`, well under any useful threshold). A short warmup keeps
//! the first noisy estimates from blocking legitimate traffic.
//!
//! A separate windowed error-rate EWMA flags keys whose requests mostly
//! fail, which catches scraping-for-404s behavior that a pure rate signal
//! misses.

use crate::{
    auth::{BlockReason, BlockedKeyRecord, ConfigRepository},
    kv::KvStore,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Ticks observed before the rate detector may block.
const WARMUP_TICKS: u32 = 10;

/// Error-rate observation window.
const ERROR_WINDOW_MS: i64 = 60_000;

/// Minimum requests in a window before the error detector judges it.
const ERROR_WINDOW_MIN_REQUESTS: u32 = 10;

/// Error ratio that must be exceeded before the error detector fires.
const ERROR_RATIO_FLOOR: f64 = 0.5;

/// Spread assumed for the error-ratio z-score.
const ERROR_RATIO_SCALE: f64 = 0.1;

/// Idle TTL on persisted detector state.
const STATE_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// EWMA smoothing factor in (0, 1].
    pub alpha: f64,
    /// Absolute z-score that triggers a soft block.
    pub z_threshold: f64,
    pub block_duration: Duration,
    /// Floor for the deviation estimate, so a flat history cannot divide by
    /// zero.
    pub epsilon: f64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            z_threshold: 3.0,
            block_duration: Duration::from_secs(300),
            epsilon: 1e-3,
        }
    }
}

/// Detector state persisted per key under `abuse:state:<key>`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AbuseState {
    ewma_rate: f64,
    ewma_var: f64,
    last_tick_ms: i64,
    ticks: u32,
    error_ewma: f64,
    window_start_ms: i64,
    window_requests: u32,
    window_errors: u32,
}

/// An active soft block, stored TTL'd under `abuse:block:<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveBlock {
    pub reason: BlockReason,
    pub anomaly_score: f64,
    pub blocked_until_ms: i64,
}

impl ActiveBlock {
    #[must_use]
    pub fn retry_after_seconds(&self, now_ms: i64) -> u64 {
        ((self.blocked_until_ms - now_ms).max(0) as u64).div_ceil(1000).max(1)
    }
}

/// Per-key abuse detector.
pub struct AbuseDetector {
    kv: Arc<dyn KvStore>,
    repo: Arc<dyn ConfigRepository>,
    config: AbuseConfig,
}

impl AbuseDetector {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        repo: Arc<dyn ConfigRepository>,
        config: AbuseConfig,
    ) -> Self {
        Self { kv, repo, config }
    }

    fn block_key(api_key_id: &str) -> String {
        format!("abuse:block:{api_key_id}")
    }

    fn state_key(api_key_id: &str) -> String {
        format!("abuse:state:{api_key_id}")
    }

    /// Pipeline precheck: is this key currently soft-blocked?
    /// KV trouble reads as "not blocked".
    pub async fn check_blocked(&self, api_key_id: &str, now_ms: i64) -> Option<ActiveBlock> {
        let raw = match self.kv.get(&Self::block_key(api_key_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(api_key_id, error = %e, "abuse block check degraded");
                return None;
            }
        };
        let block: ActiveBlock = serde_json::from_slice(&raw).ok()?;
        (block.blocked_until_ms > now_ms).then_some(block)
    }

    /// Folds one admitted request into the detector and applies a soft block
    /// when the sample is anomalous. Called post-response with the outcome
    /// signal; all failures degrade to a no-op.
    pub async fn record_request(&self, api_key_id: &str, is_error: bool, now_ms: i64) {
        let state_key = Self::state_key(api_key_id);
        let mut state = match self.kv.get(&state_key).await {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_default(),
            Ok(None) => AbuseState::default(),
            Err(e) => {
                warn!(api_key_id, error = %e, "abuse state read degraded");
                return;
            }
        };

        if let Some(trigger) = self.update_rate(&mut state, now_ms) {
            self.apply_block(api_key_id, BlockReason::RateSpike, trigger, now_ms).await;
        } else if let Some(trigger) = Self::update_error_window(&mut state, is_error, now_ms, &self.config)
        {
            self.apply_block(api_key_id, BlockReason::ErrorRateSpike, trigger, now_ms).await;
        }

        match serde_json::to_vec(&state) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(&state_key, Bytes::from(raw), Some(STATE_TTL)).await {
                    warn!(api_key_id, error = %e, "abuse state write failed");
                }
            }
            Err(e) => warn!(api_key_id, error = %e, "abuse state encode failed"),
        }
    }

    /// EWMA/z-score update on the instantaneous rate. Returns the anomaly
    /// score when the sample crosses the threshold.
    fn update_rate(&self, state: &mut AbuseState, now_ms: i64) -> Option<f64> {
        let alpha = self.config.alpha;
        let last = state.last_tick_ms;
        state.last_tick_ms = now_ms;

        if last == 0 || now_ms <= last {
            // First tick, or clock went backwards: nothing to learn from.
            return None;
        }

        let dt = (now_ms - last) as f64 / 1000.0;
        let r = 1.0 / dt;

        let sigma_prev = state.ewma_var.max(0.0).sqrt();
        let mu = state.ewma_rate;
        let mu_next = alpha * r + (1.0 - alpha) * mu;
        let z = (r - mu_next) / sigma_prev.max(self.config.epsilon);

        state.ewma_rate = mu_next;
        state.ewma_var = alpha * (r - mu).powi(2) + (1.0 - alpha) * state.ewma_var;
        state.ticks = state.ticks.saturating_add(1);

        (state.ticks > WARMUP_TICKS && z.abs() > self.config.z_threshold).then_some(z)
    }

    /// Windowed error-ratio update. Returns the anomaly score when a closed
    /// window shows a sustained error spike.
    fn update_error_window(
        state: &mut AbuseState,
        is_error: bool,
        now_ms: i64,
        config: &AbuseConfig,
    ) -> Option<f64> {
        let mut trigger = None;

        if state.window_start_ms == 0 {
            state.window_start_ms = now_ms;
        } else if now_ms - state.window_start_ms > ERROR_WINDOW_MS {
            if state.window_requests >= ERROR_WINDOW_MIN_REQUESTS {
                let ratio = f64::from(state.window_errors) / f64::from(state.window_requests);
                let z = (ratio - state.error_ewma) / ERROR_RATIO_SCALE;
                state.error_ewma = config.alpha * ratio + (1.0 - config.alpha) * state.error_ewma;
                if ratio > ERROR_RATIO_FLOOR && z > config.z_threshold {
                    trigger = Some(z);
                }
            }
            state.window_start_ms = now_ms;
            state.window_requests = 0;
            state.window_errors = 0;
        }

        state.window_requests += 1;
        if is_error {
            state.window_errors += 1;
        }

        trigger
    }

    async fn apply_block(
        &self,
        api_key_id: &str,
        reason: BlockReason,
        anomaly_score: f64,
        now_ms: i64,
    ) {
        let blocked_until_ms = now_ms + self.config.block_duration.as_millis() as i64;
        let block = ActiveBlock { reason, anomaly_score, blocked_until_ms };

        info!(
            api_key_id,
            reason = %reason,
            anomaly_score,
            "installing soft block"
        );

        match serde_json::to_vec(&block) {
            Ok(raw) => {
                if let Err(e) = self
                    .kv
                    .set(
                        &Self::block_key(api_key_id),
                        Bytes::from(raw),
                        Some(self.config.block_duration),
                    )
                    .await
                {
                    warn!(api_key_id, error = %e, "failed to install soft block");
                }
            }
            Err(e) => warn!(api_key_id, error = %e, "block encode failed"),
        }

        let record = BlockedKeyRecord {
            api_key_id: api_key_id.to_string(),
            reason,
            anomaly_score,
            blocked_at: ms_to_datetime(now_ms),
            blocked_until: Some(ms_to_datetime(blocked_until_ms)),
            is_active: true,
        };
        if let Err(e) = self.repo.insert_block_record(&record).await {
            warn!(api_key_id, error = %e, "failed to persist block record");
        }
    }

    /// Clears an active block early (manual unblock).
    pub async fn unblock(&self, api_key_id: &str) {
        if let Err(e) = self.kv.del(&Self::block_key(api_key_id)).await {
            warn!(api_key_id, error = %e, "failed to clear block key");
        }
        if let Err(e) = self.repo.deactivate_block_records(api_key_id).await {
            warn!(api_key_id, error = %e, "failed to deactivate block records");
        }
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::SqliteRepository, kv::MemoryStore};

    async fn detector() -> AbuseDetector {
        let repo = Arc::new(SqliteRepository::in_memory().await.expect("in-memory db"));
        AbuseDetector::new(Arc::new(MemoryStore::new()), repo, AbuseConfig::default())
    }

    #[tokio::test]
    async fn test_steady_rate_never_blocks() {
        let detector = detector().await;
        let mut now = 1_700_000_000_000_i64;

        // Two minutes of steady 5 rps.
        for _ in 0..600 {
            detector.record_request("k1", false, now).await;
            now += 200;
        }

        assert!(
            detector.check_blocked("k1", now).await.is_none(),
            "constant-rate traffic must not trip the detector"
        );
    }

    #[tokio::test]
    async fn test_rate_spike_blocks_quickly() {
        let detector = detector().await;
        let mut now = 1_700_000_000_000_i64;

        for _ in 0..600 {
            detector.record_request("k2", false, now).await;
            now += 200;
        }

        // 500 rps burst: blocked well within five seconds of it starting.
        let burst_start = now;
        while detector.check_blocked("k2", now).await.is_none() {
            detector.record_request("k2", false, now).await;
            now += 2;
            assert!(now - burst_start < 5_000, "burst should be blocked within 5s");
        }

        let block = detector.check_blocked("k2", now).await.expect("block should be active");
        assert_eq!(block.reason, BlockReason::RateSpike);
        assert!(block.anomaly_score.abs() >= 3.0);
        assert!(block.retry_after_seconds(now) > 0);
    }

    #[tokio::test]
    async fn test_block_expires_with_time() {
        let detector = detector().await;
        let now = 1_700_000_000_000_i64;
        detector.apply_block("k3", BlockReason::Manual, 5.0, now).await;

        assert!(detector.check_blocked("k3", now + 1_000).await.is_some());
        assert!(
            detector.check_blocked("k3", now + 301_000).await.is_none(),
            "block should read as inactive past blocked_until"
        );
    }

    #[tokio::test]
    async fn test_unblock_clears_kv_state() {
        let detector = detector().await;
        let now = 1_700_000_000_000_i64;
        detector.apply_block("k4", BlockReason::Manual, 5.0, now).await;
        assert!(detector.check_blocked("k4", now).await.is_some());

        detector.unblock("k4").await;
        assert!(detector.check_blocked("k4", now).await.is_none());
    }

    #[tokio::test]
    async fn test_warmup_suppresses_early_spikes() {
        let detector = detector().await;
        let mut now = 1_700_000_000_000_i64;

        // Fewer ticks than the warmup, wildly varying gaps.
        for gap in [500_i64, 2, 800, 3, 1000] {
            detector.record_request("k5", false, now).await;
            now += gap;
        }

        assert!(
            detector.check_blocked("k5", now).await.is_none(),
            "the detector must not block before warmup completes"
        );
    }

    #[tokio::test]
    async fn test_error_rate_spike_blocks() {
        let detector = detector().await;
        let mut now = 1_700_000_000_000_i64;

        // A healthy first window teaches a near-zero error EWMA.
        for _ in 0..70 {
            detector.record_request("k6", false, now).await;
            now += 1_000;
        }

        // Then sustained 90% errors at the same steady cadence, so the rate
        // detector stays quiet while a full error window closes.
        for i in 0..130 {
            detector.record_request("k6", i % 10 != 0, now).await;
            now += 1_000;
        }

        let block = detector.check_blocked("k6", now).await.expect("error spike should block");
        assert_eq!(block.reason, BlockReason::ErrorRateSpike);
    }
}
