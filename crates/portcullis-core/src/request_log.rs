//! Best-effort request logging.
//!
//! Handlers push log records into a bounded in-memory queue and move on; a
//! single writer task drains the queue into the persistence store. Overflow
//! drops the oldest records and counts the drops. There is deliberately no
//! ordering guarantee between a response and its log row.

use crate::auth::ConfigRepository;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

/// Cache decision recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
    Bypass,
    /// No cache decision was reached (e.g. the request was denied first).
    #[default]
    #[serde(rename = "-")]
    None,
}

impl CacheStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
            Self::None => "-",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One request's outcome, emitted post-response.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub route_id: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub cache_status: CacheStatus,
    pub error_type: Option<String>,
    pub at: DateTime<Utc>,
}

struct LogQueue {
    entries: Mutex<VecDeque<RequestLog>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Cheap handle handed to request handlers.
#[derive(Clone)]
pub struct RequestLogHandle {
    queue: Arc<LogQueue>,
}

impl RequestLogHandle {
    /// Enqueues without blocking. A full queue evicts its oldest record.
    pub fn emit(&self, log: RequestLog) {
        {
            let mut entries = self.queue.entries.lock();
            if entries.len() >= self.queue.capacity {
                entries.pop_front();
                self.queue.dropped.fetch_add(1, Ordering::Relaxed);
            }
            entries.push_back(log);
        }
        self.queue.notify.notify_one();
    }

    /// Records dropped to overflow since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.entries.lock().len()
    }
}

/// Spawns the single writer task; returns the emit handle.
///
/// The writer drains in batches and keeps going on per-row failures (logs
/// are best-effort). On shutdown it flushes whatever is still queued.
pub fn spawn_writer(
    repo: Arc<dyn ConfigRepository>,
    capacity: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> (RequestLogHandle, tokio::task::JoinHandle<()>) {
    let queue = Arc::new(LogQueue {
        entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
    });
    let handle = RequestLogHandle { queue: Arc::clone(&queue) };

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    drain(&repo, &queue).await;
                    debug!("request log writer shutdown complete");
                    break;
                }

                () = queue.notify.notified() => {
                    drain(&repo, &queue).await;
                }
            }
        }
    });

    (handle, writer)
}

async fn drain(repo: &Arc<dyn ConfigRepository>, queue: &Arc<LogQueue>) {
    loop {
        let batch: Vec<RequestLog> = {
            let mut entries = queue.entries.lock();
            if entries.is_empty() {
                return;
            }
            entries.drain(..).collect()
        };

        for log in batch {
            if let Err(e) = repo.insert_request_log(&log).await {
                warn!(request_id = %log.request_id, error = %e, "request log dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SqliteRepository;
    use std::time::Duration;

    fn sample(request_id: &str) -> RequestLog {
        RequestLog {
            request_id: request_id.to_string(),
            api_key_id: Some("k1".to_string()),
            route_id: Some("r1".to_string()),
            method: "GET".to_string(),
            path: "/g/demo/items".to_string(),
            status: 200,
            latency_ms: 5,
            cache_status: CacheStatus::Miss,
            error_type: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_cache_status_strings() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Stale.as_str(), "STALE");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
        assert_eq!(CacheStatus::Bypass.as_str(), "BYPASS");
        assert_eq!(CacheStatus::None.as_str(), "-");
    }

    #[tokio::test]
    async fn test_writer_persists_logs() {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, _writer) =
            spawn_writer(repo.clone() as Arc<dyn ConfigRepository>, 100, shutdown_tx.subscribe());

        for i in 0..5 {
            handle.emit(sample(&format!("req-{i}")));
        }

        // The writer is asynchronous; give it a moment.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.pending(), 0, "queue should be drained");
        assert_eq!(handle.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let (shutdown_tx, _) = broadcast::channel(1);
        // Writer subscribed but we flood synchronously before it can drain.
        let (handle, writer) =
            spawn_writer(repo as Arc<dyn ConfigRepository>, 3, shutdown_tx.subscribe());
        writer.abort(); // freeze draining so overflow is deterministic

        for i in 0..10 {
            handle.emit(sample(&format!("req-{i}")));
        }

        assert_eq!(handle.pending(), 3, "queue is bounded");
        assert_eq!(handle.dropped(), 7, "overflow drops are counted");

        let remaining: Vec<String> = {
            let entries = handle.queue.entries.lock();
            entries.iter().map(|l| l.request_id.clone()).collect()
        };
        assert_eq!(remaining, vec!["req-7", "req-8", "req-9"], "oldest records are dropped");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, writer) =
            spawn_writer(repo as Arc<dyn ConfigRepository>, 100, shutdown_tx.subscribe());

        for i in 0..4 {
            handle.emit(sample(&format!("req-{i}")));
        }
        shutdown_tx.send(()).expect("writer is subscribed");

        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should exit after shutdown")
            .expect("writer should not panic");
        assert_eq!(handle.pending(), 0, "pending records flushed on shutdown");
    }
}
