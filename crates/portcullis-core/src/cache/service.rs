//! TTL + stale-while-revalidate response cache with single-flight
//! coalescing.
//!
//! Mutual exclusion uses KV leases (`set_if_absent` with TTL, released via
//! compare-and-delete) plus a pub/sub completion signal, so coalescing holds
//! across gateway instances whenever the shared backend is reachable. Under
//! the in-process fallback the same protocol degrades to at-most-one fetch
//! per process.
//!
//! The single-flight leader runs its upstream fetch on a detached task: a
//! client disconnect must not cancel a fetch other waiters are subscribed
//! to. Uncoalesced direct fetches stay on the request task and are cancelled
//! with their client.

use crate::{
    cache::{entry::Freshness, key::CacheKeyBuilder, CacheEntry},
    kv::{KvError, KvStore},
    upstream::UpstreamError,
};
use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Current wall clock in unix milliseconds.
#[must_use]
pub fn unix_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tuning knobs for the cache service.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Single-flight and revalidation lease TTL.
    pub lock_ttl: Duration,
    /// Extra wait beyond the lease TTL before a waiter gives up on the
    /// completion signal.
    pub wait_slack: Duration,
    /// Lease re-acquire attempts before the degraded uncoalesced fetch.
    pub max_acquire_attempts: u32,
    /// Extra KV record lifetime beyond `ttl + stale`.
    pub safety_margin: Duration,
    /// Size of the background revalidation pool.
    pub revalidation_workers: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            wait_slack: Duration::from_millis(500),
            max_acquire_attempts: 2,
            safety_margin: Duration::from_secs(60),
            revalidation_workers: 4,
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

/// What an upstream fetch produced: the entry to return to clients, and
/// whether it is eligible for storage under the route's policy.
#[derive(Debug)]
pub struct FetchPayload {
    pub entry: CacheEntry,
    pub store: bool,
}

/// How a coalesced miss was resolved.
#[derive(Debug)]
pub enum CoalescedFetch {
    /// This caller held the lease and fetched from the origin.
    Leader(CacheEntry),
    /// Another holder fetched; the entry came from the cache re-read.
    FromPeer(CacheEntry),
    /// Lease never became available; fetched directly without storing.
    Uncoalesced(CacheEntry),
}

impl CoalescedFetch {
    #[must_use]
    pub fn into_entry(self) -> CacheEntry {
        match self {
            Self::Leader(entry) | Self::FromPeer(entry) | Self::Uncoalesced(entry) => entry,
        }
    }
}

/// Shared response cache.
pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    settings: CacheSettings,
    /// Per-process half of lease tokens; each acquisition appends a UUID.
    holder_prefix: String,
    revalidation_permits: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        settings: CacheSettings,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let workers = settings.revalidation_workers.max(1);
        Self {
            kv,
            settings,
            holder_prefix: Uuid::new_v4().to_string(),
            revalidation_permits: Arc::new(Semaphore::new(workers)),
            shutdown,
        }
    }

    fn lease_token(&self) -> Bytes {
        Bytes::from(format!("{}:{}", self.holder_prefix, Uuid::new_v4()))
    }

    /// Reads and classifies an entry. KV trouble degrades to a miss;
    /// entries past their stale window are evicted eagerly.
    pub async fn lookup(&self, cache_key: &str, now_ms: i64) -> CacheLookup {
        let raw = match self.kv.get(cache_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                warn!(key = cache_key, error = %e, "cache read failed, degrading to miss");
                return CacheLookup::Miss;
            }
        };

        let entry = match CacheEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = cache_key, error = %e, "evicting undecodable cache entry");
                let _ = self.kv.del(cache_key).await;
                return CacheLookup::Miss;
            }
        };

        match entry.freshness(now_ms) {
            Freshness::Fresh => CacheLookup::Hit(entry),
            Freshness::Stale => CacheLookup::Stale(entry),
            Freshness::Expired => {
                let _ = self.kv.del(cache_key).await;
                CacheLookup::Miss
            }
        }
    }

    /// Writes an entry with record TTL `ttl + stale + safety_margin`.
    /// Returns whether the write landed; failures only cost cacheability.
    pub async fn store(&self, cache_key: &str, entry: &CacheEntry) -> bool {
        let ttl = Duration::from_secs(entry.lifetime_seconds()) + self.settings.safety_margin;
        match self.kv.set(cache_key, entry.encode(), Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = cache_key, error = %e, "cache store failed");
                false
            }
        }
    }

    /// Stores a negative (404/410) entry under `neg:<cache_key>`.
    pub async fn store_negative(&self, cache_key: &str, entry: &CacheEntry, ttl: Duration) -> bool {
        let key = CacheKeyBuilder::negative_key(cache_key);
        match self.kv.set(&key, entry.encode(), Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "negative cache store failed");
                false
            }
        }
    }

    /// Reads a stored negative entry, if any. Expiry is governed by the KV
    /// record TTL, not the entry's own freshness windows.
    pub async fn lookup_negative(&self, cache_key: &str) -> Option<CacheEntry> {
        let key = CacheKeyBuilder::negative_key(cache_key);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => CacheEntry::decode(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "negative cache read failed");
                None
            }
        }
    }

    /// Removes an entry and its negative shadow. Used by purges and tests.
    pub async fn evict(&self, cache_key: &str) -> Result<(), KvError> {
        self.kv.del(cache_key).await?;
        self.kv.del(&CacheKeyBuilder::negative_key(cache_key)).await?;
        Ok(())
    }

    /// Resolves a cache miss with single-flight coalescing.
    ///
    /// Acquire the lease and fetch; or wait (bounded) for the holder's
    /// completion signal and re-read; after `max_acquire_attempts` failed
    /// rounds, fetch directly without storing.
    ///
    /// # Errors
    /// Returns the fetch's [`UpstreamError`] when this caller performed the
    /// fetch itself (leader or uncoalesced).
    pub async fn fetch_coalesced<F, Fut>(
        &self,
        cache_key: &str,
        fetch: F,
    ) -> Result<CoalescedFetch, UpstreamError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<FetchPayload, UpstreamError>> + Send + 'static,
    {
        let lock_key = CacheKeyBuilder::lock_key(cache_key);
        let mut attempts: u32 = 0;

        loop {
            let token = self.lease_token();
            match self.kv.set_if_absent(&lock_key, token.clone(), self.settings.lock_ttl).await {
                Ok(true) => {
                    // Double-check before fetching: a previous holder may
                    // have stored between our lookup and this acquire.
                    if let CacheLookup::Hit(entry) | CacheLookup::Stale(entry) =
                        self.lookup(cache_key, unix_ms_now()).await
                    {
                        let _ = self.kv.del_if_equal(&lock_key, token).await;
                        return Ok(CoalescedFetch::FromPeer(entry));
                    }
                    let entry = self.lead_fetch(cache_key, token, &fetch).await?;
                    return Ok(CoalescedFetch::Leader(entry));
                }
                Ok(false) => {
                    self.await_completion(cache_key).await;
                    match self.lookup(cache_key, unix_ms_now()).await {
                        CacheLookup::Hit(entry) | CacheLookup::Stale(entry) => {
                            return Ok(CoalescedFetch::FromPeer(entry));
                        }
                        CacheLookup::Miss => {
                            attempts += 1;
                            if attempts > self.settings.max_acquire_attempts {
                                debug!(
                                    key = cache_key,
                                    attempts, "single-flight exhausted, fetching uncoalesced"
                                );
                                let payload = fetch().await?;
                                return Ok(CoalescedFetch::Uncoalesced(payload.entry));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(key = cache_key, error = %e, "lease unavailable, fetching uncoalesced");
                    let payload = fetch().await?;
                    return Ok(CoalescedFetch::Uncoalesced(payload.entry));
                }
            }
        }
    }

    /// Waits for the holder's `cache:done` signal, bounded by
    /// `lock_ttl + wait_slack` (the lease cannot outlive that).
    async fn await_completion(&self, cache_key: &str) {
        let deadline = self.settings.lock_ttl + self.settings.wait_slack;
        match self.kv.subscribe(&CacheKeyBuilder::done_topic(cache_key)).await {
            Ok(mut sub) => {
                let _ = tokio::time::timeout(deadline, sub.recv()).await;
            }
            Err(e) => {
                debug!(key = cache_key, error = %e, "completion subscription failed, backing off");
                tokio::time::sleep(self.settings.wait_slack).await;
            }
        }
    }

    /// Leader side of the flight: fetch on a detached task, store when
    /// eligible, announce completion, release the lease.
    async fn lead_fetch<F, Fut>(
        &self,
        cache_key: &str,
        token: Bytes,
        fetch: &F,
    ) -> Result<CacheEntry, UpstreamError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<FetchPayload, UpstreamError>> + Send + 'static,
    {
        // Detached so waiters still get a result if this client disconnects.
        let result = match tokio::spawn(fetch()).await {
            Ok(result) => result,
            Err(e) => Err(UpstreamError::Protocol(format!("fetch task failed: {e}"))),
        };

        if let Ok(payload) = &result {
            if payload.store {
                self.store(cache_key, &payload.entry).await;
            }
        }

        if let Err(e) =
            self.kv.publish(&CacheKeyBuilder::done_topic(cache_key), Bytes::new()).await
        {
            debug!(key = cache_key, error = %e, "completion publish failed");
        }
        if let Err(e) =
            self.kv.del_if_equal(&CacheKeyBuilder::lock_key(cache_key), token).await
        {
            debug!(key = cache_key, error = %e, "lease release failed, ttl will reap it");
        }

        result.map(|payload| payload.entry)
    }

    /// Schedules a background revalidation for a stale entry.
    ///
    /// Runs on the bounded worker pool; a `revalidate:<key>` lease suppresses
    /// duplicate work across instances. Fetch errors are swallowed, the stale
    /// entry stays valid until its own `stale_until`. Cooperative: the task
    /// checks the shutdown signal before committing to the fetch.
    pub fn spawn_revalidation<F, Fut>(&self, cache_key: &str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<FetchPayload, UpstreamError>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.revalidation_permits).try_acquire_owned() else {
            debug!(key = cache_key, "revalidation pool saturated, skipping");
            return;
        };

        let kv = Arc::clone(&self.kv);
        let cache_key = cache_key.to_string();
        let reval_key = CacheKeyBuilder::revalidate_key(&cache_key);
        let token = self.lease_token();
        let lock_ttl = self.settings.lock_ttl;
        let safety_margin = self.settings.safety_margin;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _permit = permit;

            let lease_result = kv.set_if_absent(&reval_key, token.clone(), lock_ttl).await;
            eprintln!("DEBUG lease_result={lease_result:?} key={reval_key}");
            match lease_result {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %cache_key, "revalidation already in flight");
                    return;
                }
                Err(e) => {
                    debug!(key = %cache_key, error = %e, "revalidation lease unavailable");
                    return;
                }
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    eprintln!("DEBUG shutdown branch taken");
                    debug!(key = %cache_key, "revalidation cancelled by shutdown");
                }

                result = fetch() => match result {
                    Ok(payload) if payload.store => {
                        let ttl = Duration::from_secs(payload.entry.lifetime_seconds())
                            + safety_margin;
                        if let Err(e) =
                            kv.set(&cache_key, payload.entry.encode(), Some(ttl)).await
                        {
                            warn!(key = %cache_key, error = %e, "revalidated store failed");
                        } else {
                            debug!(key = %cache_key, "background revalidation stored");
                        }
                    }
                    Ok(_) => {
                        debug!(key = %cache_key, "revalidated response not storable");
                    }
                    Err(e) => {
                        debug!(key = %cache_key, error = %e, "revalidation failed, stale entry retained");
                    }
                },
            }

            if let Err(e) = kv.del_if_equal(&reval_key, token).await {
                debug!(key = %cache_key, error = %e, "revalidation lease release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_settings() -> CacheSettings {
        CacheSettings {
            lock_ttl: Duration::from_secs(1),
            wait_slack: Duration::from_millis(200),
            max_acquire_attempts: 2,
            safety_margin: Duration::from_secs(60),
            revalidation_workers: 2,
        }
    }

    fn cache_with_store() -> (Arc<ResponseCache>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let cache = Arc::new(ResponseCache::new(store.clone(), test_settings(), shutdown_tx));
        (cache, store)
    }

    fn entry_at(now_ms: i64, ttl_secs: i64, stale_secs: i64, body: &'static [u8]) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from_static(body),
            stored_at: now_ms,
            fresh_until: now_ms + ttl_secs * 1000,
            stale_until: now_ms + (ttl_secs + stale_secs) * 1000,
            origin: "up:8001".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_then_lookup_hit() {
        let (cache, _) = cache_with_store();
        let now = unix_ms_now();
        let entry = entry_at(now, 60, 60, br#"[{"id":1}]"#);

        assert!(cache.store("cache:k1", &entry).await);
        match cache.lookup("cache:k1", now + 1000).await {
            CacheLookup::Hit(found) => {
                assert_eq!(found.body, entry.body, "stored entry must read back byte-equal");
                assert_eq!(found.status, 200);
                assert_eq!(found.headers, entry.headers);
            }
            other => panic!("expected HIT, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_stale_window() {
        let (cache, _) = cache_with_store();
        let now = unix_ms_now();
        let entry = entry_at(now, 60, 60, b"stale-ok");
        cache.store("cache:k2", &entry).await;

        // Past TTL, inside the stale window.
        match cache.lookup("cache:k2", now + 61_000).await {
            CacheLookup::Stale(found) => assert_eq!(found.body, entry.body),
            other => panic!("expected STALE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_past_stale_is_miss_and_evicts() {
        let (cache, store) = cache_with_store();
        let now = unix_ms_now();
        let entry = entry_at(now, 60, 60, b"old");
        cache.store("cache:k3", &entry).await;

        assert!(matches!(cache.lookup("cache:k3", now + 121_000).await, CacheLookup::Miss));
        assert!(
            store.get("cache:k3").await.unwrap().is_none(),
            "entry past stale_until should be evicted"
        );
    }

    #[tokio::test]
    async fn test_lookup_undecodable_entry_is_evicted() {
        let (cache, store) = cache_with_store();
        store.set("cache:junk", Bytes::from_static(b"\xff\x00garbage"), None).await.unwrap();

        assert!(matches!(cache.lookup("cache:junk", unix_ms_now()).await, CacheLookup::Miss));
        assert!(store.get("cache:junk").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_coalescing_single_upstream_call() {
        let (cache, _) = cache_with_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .fetch_coalesced("cache:hot", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            let now = unix_ms_now();
                            Ok(FetchPayload {
                                entry: entry_at(now, 60, 60, b"shared-body"),
                                store: true,
                            })
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.expect("task should not panic").expect("fetch should succeed");
            assert_eq!(outcome.into_entry().body, Bytes::from_static(b"shared-body"));
        }

        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "ten concurrent misses must produce exactly one origin call"
        );
    }

    #[tokio::test]
    async fn test_leader_stores_and_releases_lease() {
        let (cache, store) = cache_with_store();

        let outcome = cache
            .fetch_coalesced("cache:solo", || async {
                let now = unix_ms_now();
                Ok(FetchPayload { entry: entry_at(now, 60, 0, b"solo"), store: true })
            })
            .await
            .expect("fetch should succeed");
        assert!(matches!(outcome, CoalescedFetch::Leader(_)));

        assert!(store.get("cache:solo").await.unwrap().is_some(), "leader should store");
        assert!(
            store.get("lock:cache:solo").await.unwrap().is_none(),
            "lease should be released after the flight"
        );
    }

    #[tokio::test]
    async fn test_non_storable_payload_not_cached() {
        let (cache, store) = cache_with_store();

        cache
            .fetch_coalesced("cache:err", || async {
                let now = unix_ms_now();
                let mut entry = entry_at(now, 60, 0, b"oops");
                entry.status = 500;
                Ok(FetchPayload { entry, store: false })
            })
            .await
            .expect("fetch should succeed");

        assert!(store.get("cache:err").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_uncoalesced_fallback_when_lease_stuck() {
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let settings = CacheSettings {
            lock_ttl: Duration::from_millis(100),
            wait_slack: Duration::from_millis(50),
            max_acquire_attempts: 0,
            ..test_settings()
        };
        let cache = ResponseCache::new(store.clone(), settings, shutdown_tx);

        // A crashed holder: lease present, nobody will ever publish or store.
        // Seed it before racing, then keep re-asserting so the waiter cannot
        // acquire it either.
        store
            .set("lock:cache:stuck", Bytes::from_static(b"ghost"), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        let blocker = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..40 {
                    let _ = store
                        .set(
                            "lock:cache:stuck",
                            Bytes::from_static(b"ghost"),
                            Some(Duration::from_millis(100)),
                        )
                        .await;
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            })
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let outcome = cache
            .fetch_coalesced("cache:stuck", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = unix_ms_now();
                    Ok(FetchPayload { entry: entry_at(now, 60, 0, b"direct"), store: true })
                }
            })
            .await
            .expect("fallback fetch should succeed");

        assert!(matches!(outcome, CoalescedFetch::Uncoalesced(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(
            store.get("cache:stuck").await.unwrap().is_none(),
            "uncoalesced path must not store"
        );
        blocker.abort();
    }

    #[tokio::test]
    async fn test_revalidation_runs_once_and_updates() {
        let (cache, store) = cache_with_store();
        let now = unix_ms_now();
        cache.store("cache:swr", &entry_at(now - 90_000, 60, 120, b"old-body")).await;

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            cache.spawn_revalidation("cache:swr", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = unix_ms_now();
                Ok(FetchPayload { entry: entry_at(now, 60, 60, b"new-body"), store: true })
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "revalidation lease must suppress duplicates");

        match cache.lookup("cache:swr", unix_ms_now()).await {
            CacheLookup::Hit(entry) => assert_eq!(entry.body, Bytes::from_static(b"new-body")),
            other => panic!("expected refreshed HIT, got {other:?}"),
        }
        assert!(
            store.get("revalidate:cache:swr").await.unwrap().is_none(),
            "revalidation lease should be released"
        );
    }

    #[tokio::test]
    async fn test_revalidation_failure_keeps_stale_entry() {
        let (cache, _) = cache_with_store();
        let now = unix_ms_now();
        cache.store("cache:keep", &entry_at(now - 90_000, 60, 120, b"still-good")).await;

        cache.spawn_revalidation("cache:keep", || async {
            Err(UpstreamError::Timeout)
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        match cache.lookup("cache:keep", unix_ms_now()).await {
            CacheLookup::Stale(entry) => assert_eq!(entry.body, Bytes::from_static(b"still-good")),
            other => panic!("stale entry should be retained, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negative_entry_roundtrip() {
        let (cache, _) = cache_with_store();
        let now = unix_ms_now();
        let mut entry = entry_at(now, 60, 0, br#"{"error":"not found"}"#);
        entry.status = 404;

        cache.store_negative("cache:missing", &entry, Duration::from_secs(60)).await;
        let found = cache.lookup_negative("cache:missing").await.expect("negative entry stored");
        assert_eq!(found.status, 404);
        assert_eq!(found.body, entry.body);

        cache.evict("cache:missing").await.unwrap();
        assert!(cache.lookup_negative("cache:missing").await.is_none());
    }
}
