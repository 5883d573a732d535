//! Shared KV store backed by Redis.
//!
//! All commands run through a [`ConnectionManager`] (which reconnects
//! internally) and are bounded by the configured operation timeout. Lease
//! release uses a Lua script so compare-and-delete is atomic on the server;
//! a holder whose lease expired cannot delete a successor's lock.

use super::{KvError, KvStore, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::{aio::ConnectionManager, Client, Script};
use std::{future::Future, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEL_IF_EQUAL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed implementation of [`KvStore`].
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    op_timeout: Duration,
    del_if_equal: Script,
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Connection`] if the URL is invalid or the initial
    /// probe fails within the operation timeout.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, KvError> {
        let client = Client::open(url)
            .map_err(|e| KvError::Connection(format!("invalid redis url: {e}")))?;

        let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|e| KvError::Connection(e.to_string()))?;

        let store = Self {
            client,
            manager,
            op_timeout,
            del_if_equal: Script::new(DEL_IF_EQUAL_SCRIPT),
        };
        store.ping().await?;
        debug!("connected to shared kv backend");
        Ok(store)
    }

    /// Runs a Redis future under the operation timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(&e)),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

fn classify(error: &redis::RedisError) -> KvError {
    if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error() {
        KvError::Connection(error.to_string())
    } else {
        KvError::Command(error.to_string())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = self
            .bounded(async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        self.bounded(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(&value[..]);
            if let Some(ttl) = ttl {
                cmd.arg("EX").arg(ttl.as_secs().max(1));
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .bounded(async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn del_pattern(&self, pattern: &str) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        let pattern = pattern.to_string();
        // SCAN keeps the purge incremental; a KEYS sweep would block the
        // server on large keyspaces.
        self.bounded(async move {
            let mut cursor: u64 = 0;
            let mut deleted: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(200)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    let removed: i64 =
                        redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                    deleted += removed.max(0) as u64;
                }
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            Ok(deleted)
        })
        .await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        self.bounded(async move {
            redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let set: i64 = self
            .bounded(async move {
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(set > 0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = self
            .bounded(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(&value[..])
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_equal(&self, key: &str, value: Bytes) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let script = self.del_if_equal.clone();
        let removed: i64 = self
            .bounded(async move {
                script.key(key).arg(&value[..]).invoke_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _receivers: i64 = self
            .bounded(async move {
                redis::cmd("PUBLISH").arg(topic).arg(&message[..]).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, KvError> {
        // Pub/sub needs its own connection; the manager multiplexes commands.
        let mut pubsub = tokio::time::timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|e| classify(&e))?;

        tokio::time::timeout(self.op_timeout, pubsub.subscribe(topic))
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|e| classify(&e))?;

        let topic = topic.to_string();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "dropping undecodable pubsub message");
                        continue;
                    }
                };
                if tx.send(Bytes::from(payload)).await.is_err() {
                    break;
                }
            }
            debug!(topic = %topic, "pubsub forwarder exited");
        });

        Ok(Subscription::new(rx))
    }

    async fn bits_set(&self, key: &str, positions: &[u64]) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let positions = positions.to_vec();
        self.bounded(async move {
            let mut pipe = redis::pipe();
            for position in positions {
                pipe.cmd("SETBIT").arg(key).arg(position).arg(1).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn bits_get(&self, key: &str, positions: &[u64]) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let positions = positions.to_vec();
        let bits: Vec<i64> = self
            .bounded(async move {
                let mut pipe = redis::pipe();
                for position in positions {
                    pipe.cmd("GETBIT").arg(key).arg(position);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;
        Ok(bits.iter().all(|&bit| bit == 1))
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
