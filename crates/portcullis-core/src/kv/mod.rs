//! Key/value store abstraction shared by the cache, limiter, quota, abuse
//! and bloom subsystems.
//!
//! Two implementations exist: [`RedisStore`] talks to the shared Redis
//! deployment so that counters, leases and cache entries coordinate across
//! gateway instances, and [`MemoryStore`] is the in-process fallback used
//! when the shared backend is unreachable or `DEPLOYMENT_MODE=demo`.
//!
//! Every operation is bounded by a short timeout. Timeouts are **not**
//! retried here; callers treat them as soft failures and degrade (a limiter
//! admits, a cache lookup misses).

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors surfaced by KV operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The operation exceeded its deadline. Never retried by the adapter.
    #[error("kv operation timed out")]
    Timeout,

    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv command error: {0}")]
    Command(String),

    /// A stored value could not be interpreted (e.g. a non-integer counter).
    #[error("kv value error: {0}")]
    Value(String),
}

/// A pub/sub subscription handle.
///
/// Messages are forwarded from the backend into a bounded channel by a
/// per-subscription task; dropping the handle tears the forwarder down.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Receives the next message, or `None` once the backend side closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Abstract binary key→value store with TTL, atomic increments, leases,
/// pub/sub, and bitmap operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Deletes a key; returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Deletes all keys matching a glob pattern (`*` wildcard); returns the
    /// number removed. Used by administrative cache purges.
    async fn del_pattern(&self, pattern: &str) -> Result<u64, KvError>;

    /// Atomically adds `delta` to an integer value, creating it at zero.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Sets a TTL on an existing key; returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Lease acquire: stores `value` only if `key` is absent. Expiry is
    /// enforced by the store, not by holder clocks.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration)
        -> Result<bool, KvError>;

    /// Lease release: deletes `key` only if it still holds `value`, so an
    /// expired holder cannot drop a successor's lease.
    async fn del_if_equal(&self, key: &str, value: Bytes) -> Result<bool, KvError>;

    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), KvError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, KvError>;

    /// Sets the given bit positions to 1.
    async fn bits_set(&self, key: &str, positions: &[u64]) -> Result<(), KvError>;

    /// Returns true iff every given bit position is set.
    async fn bits_get(&self, key: &str, positions: &[u64]) -> Result<bool, KvError>;

    /// Liveness probe used at startup and by the health endpoint.
    async fn ping(&self) -> Result<(), KvError>;
}

/// Matches a key against a glob pattern where `*` matches any run of
/// characters. This is the only wildcard purge patterns use.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..])),
            (Some(pc), Some(kc)) if pc == kc => inner(&p[1..], &k[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}
