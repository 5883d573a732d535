//! In-process fallback KV store.
//!
//! Used when the shared Redis backend is unreachable or in demo mode. The
//! interface is identical to the shared store but coordination is lost
//! across instances: leases, counters and pub/sub only cover this process.
//!
//! Expiry is enforced lazily on access and by a janitor task that sweeps the
//! map periodically.

use super::{glob_match, KvError, KvStore, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

#[derive(Clone)]
enum Value {
    Raw(Bytes),
    Bits(Vec<u8>),
}

#[derive(Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory KV store with TTL enforcement.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    janitor_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            topics: DashMap::new(),
            janitor_interval: Duration::from_secs(5),
        }
    }

    /// Spawns the expiry janitor. Runs until the shutdown signal fires.
    pub fn start_janitor(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.janitor_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("memory store janitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = Instant::now();
                        store.entries.retain(|_, entry| !entry.is_expired(now));
                    }
                }
            }
        });
    }

    fn live_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Expired entries are removed on the next sweep or overwritten here.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_counter(value: &Value) -> Result<i64, KvError> {
    match value {
        Value::Raw(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| KvError::Value("counter is not an integer".to_string())),
        Value::Bits(_) => Err(KvError::Value("counter key holds a bitmap".to_string())),
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        match self.live_value(key) {
            Some(Value::Raw(bytes)) => Ok(Some(bytes)),
            Some(Value::Bits(_)) => Err(KvError::Value("key holds a bitmap".to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry { value: Value::Raw(value), expires_at: ttl.map(|t| Instant::now() + t) },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, KvError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - self.entries.len()) as u64)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Raw(Bytes::from_static(b"0")),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry { value: Value::Raw(Bytes::from_static(b"0")), expires_at: None };
        }
        let next = parse_counter(&entry.value)? + delta;
        entry.value = Value::Raw(Bytes::from(next.to_string()));
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        eprintln!("DEBUG set_if_absent self_ptr={:p} key={key}", self);
        let now = Instant::now();
        let result = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                eprintln!("DEBUG branch=occupied-expired existing_expires_at={:?} now={:?}", occupied.get().expires_at, now);
                occupied
                    .insert(Entry { value: Value::Raw(value), expires_at: Some(now + ttl) });
                Ok(true)
            }
            MapEntry::Occupied(o) => {
                eprintln!("DEBUG branch=occupied-live existing_expires_at={:?} now={:?}", o.get().expires_at, now);
                Ok(false)
            }
            MapEntry::Vacant(vacant) => {
                eprintln!("DEBUG branch=vacant");
                vacant.insert(Entry { value: Value::Raw(value), expires_at: Some(now + ttl) });
                Ok(true)
            }
        };
        eprintln!("DEBUG set_if_absent result={result:?} len={}", self.entries.len());
        result
    }

    async fn del_if_equal(&self, key: &str, value: Bytes) -> Result<bool, KvError> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, entry| {
            !entry.is_expired(now) && matches!(&entry.value, Value::Raw(held) if *held == value)
        });
        Ok(removed.is_some())
    }

    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), KvError> {
        if let Some(sender) = self.topics.get(topic) {
            // No subscribers is not an error.
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, KvError> {
        let mut broadcast_rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn bits_set(&self, key: &str, positions: &[u64]) -> Result<(), KvError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Bits(Vec::new()), expires_at: None });
        if entry.is_expired(now) {
            *entry = Entry { value: Value::Bits(Vec::new()), expires_at: None };
        }
        let bitmap = match &mut entry.value {
            Value::Bits(bitmap) => bitmap,
            Value::Raw(_) => return Err(KvError::Value("key does not hold a bitmap".to_string())),
        };
        for &position in positions {
            let byte = (position / 8) as usize;
            if bitmap.len() <= byte {
                bitmap.resize(byte + 1, 0);
            }
            bitmap[byte] |= 1 << (position % 8);
        }
        Ok(())
    }

    async fn bits_get(&self, key: &str, positions: &[u64]) -> Result<bool, KvError> {
        match self.live_value(key) {
            Some(Value::Bits(bitmap)) => Ok(positions.iter().all(|&position| {
                let byte = (position / 8) as usize;
                bitmap.get(byte).is_some_and(|b| b & (1 << (position % 8)) != 0)
            })),
            Some(Value::Raw(_)) => Err(KvError::Value("key does not hold a bitmap".to_string())),
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
