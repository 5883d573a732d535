use super::api_key::{ApiKey, BlockReason, BlockedKeyRecord, KeyStatus, Tenant};
use crate::{
    catalog::{CachePolicy, Route},
    limit::RateLimitAlgorithm,
    request_log::RequestLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use thiserror::Error;

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Everything the config catalog needs in one read.
#[derive(Debug, Default, Clone)]
pub struct CatalogData {
    pub tenants: Vec<Tenant>,
    pub api_keys: Vec<ApiKey>,
    pub routes: Vec<Route>,
    pub policies: Vec<CachePolicy>,
}

/// Repository trait over the configuration store.
///
/// The gateway only reads configuration and appends operational records
/// (blocked keys, request logs); all other mutations belong to the external
/// admin surface.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Reads tenants, keys, routes and policies for a catalog snapshot.
    async fn load_catalog(&self) -> Result<CatalogData, RepositoryError>;

    async fn insert_block_record(&self, record: &BlockedKeyRecord)
        -> Result<(), RepositoryError>;

    /// Marks all active block records for a key inactive (manual unblock).
    async fn deactivate_block_records(&self, api_key_id: &str) -> Result<(), RepositoryError>;

    async fn insert_request_log(&self, log: &RequestLog) -> Result<(), RepositoryError>;

    async fn touch_key_last_used(
        &self,
        api_key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// SQLite-backed repository.
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    /// # Errors
    /// Returns [`RepositoryError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database, used by tests and demo mode.
    ///
    /// # Errors
    /// Returns [`RepositoryError::Database`] if the connection fails.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let pool =
            SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    /// Direct pool access for test seeding.
    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Creates missing tables. Schema evolution proper is owned by the admin
    /// surface's migration tooling; this only bootstraps an empty database.
    ///
    /// # Errors
    /// Returns [`RepositoryError::Database`] on DDL failure.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                hashed_secret TEXT NOT NULL UNIQUE,
                prefix TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                rate_limit_rps REAL,
                rate_limit_burst INTEGER,
                rate_limit_algorithm TEXT NOT NULL DEFAULT 'token_bucket',
                quota_daily INTEGER NOT NULL DEFAULT 0,
                quota_monthly INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS cache_policies (
                id TEXT PRIMARY KEY,
                ttl_seconds INTEGER NOT NULL DEFAULT 300,
                stale_seconds INTEGER NOT NULL DEFAULT 60,
                vary_headers TEXT NOT NULL DEFAULT '[]',
                cacheable_statuses TEXT NOT NULL DEFAULT '[200]',
                cacheable_methods TEXT NOT NULL DEFAULT '[\"GET\",\"HEAD\"]',
                max_body_bytes INTEGER NOT NULL DEFAULT 10485760,
                cache_no_store INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path_pattern TEXT NOT NULL DEFAULT '/*',
                methods TEXT NOT NULL DEFAULT '[\"GET\",\"POST\",\"PUT\",\"PATCH\",\"DELETE\"]',
                upstream_base_url TEXT NOT NULL,
                timeout_ms INTEGER NOT NULL DEFAULT 30000,
                policy_id TEXT REFERENCES cache_policies(id) ON DELETE SET NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS blocked_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                anomaly_score REAL NOT NULL DEFAULT 0,
                blocked_at TEXT NOT NULL,
                blocked_until TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                api_key_id TEXT,
                route_id TEXT,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                cache_status TEXT NOT NULL,
                error_type TEXT,
                at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_at ON request_logs(at)",
            "CREATE INDEX IF NOT EXISTS idx_blocked_keys_key ON blocked_keys(api_key_id)",
        ];

        for statement in ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn parse_json_list<T: serde::de::DeserializeOwned>(
        raw: &str,
        column: &str,
    ) -> Result<T, RepositoryError> {
        serde_json::from_str(raw)
            .map_err(|e| RepositoryError::CorruptRow(format!("column '{column}': {e}")))
    }

    fn row_to_tenant(row: &sqlx::sqlite::SqliteRow) -> Result<Tenant, RepositoryError> {
        Ok(Tenant {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
        })
    }

    fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, RepositoryError> {
        let status_raw: String = row.try_get("status")?;
        let status = KeyStatus::from_str(&status_raw)
            .ok_or_else(|| RepositoryError::CorruptRow(format!("key status '{status_raw}'")))?;
        let algorithm_raw: String = row.try_get("rate_limit_algorithm")?;
        let rate_limit_algorithm = RateLimitAlgorithm::from_str(&algorithm_raw).ok_or_else(
            || RepositoryError::CorruptRow(format!("rate limit algorithm '{algorithm_raw}'")),
        )?;
        let burst: Option<i64> = row.try_get("rate_limit_burst")?;

        Ok(ApiKey {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            hashed_secret: row.try_get("hashed_secret")?,
            prefix: row.try_get("prefix")?,
            status,
            rate_limit_rps: row.try_get("rate_limit_rps")?,
            rate_limit_burst: burst
                .map(|b| {
                    u32::try_from(b).map_err(|_| {
                        RepositoryError::CorruptRow(format!("burst {b} out of range"))
                    })
                })
                .transpose()?,
            rate_limit_algorithm,
            quota_daily: row.try_get("quota_daily")?,
            quota_monthly: row.try_get("quota_monthly")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }

    fn row_to_route(row: &sqlx::sqlite::SqliteRow) -> Result<Route, RepositoryError> {
        let methods_raw: String = row.try_get("methods")?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;

        Ok(Route {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            path_pattern: row.try_get("path_pattern")?,
            methods: Self::parse_json_list(&methods_raw, "methods")?,
            upstream_base_url: row.try_get("upstream_base_url")?,
            timeout_ms: timeout_ms.max(0) as u64,
            policy_id: row.try_get("policy_id")?,
            priority: row.try_get("priority")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<CachePolicy, RepositoryError> {
        let ttl_seconds: i64 = row.try_get("ttl_seconds")?;
        let stale_seconds: i64 = row.try_get("stale_seconds")?;
        let max_body_bytes: i64 = row.try_get("max_body_bytes")?;
        let vary_raw: String = row.try_get("vary_headers")?;
        let statuses_raw: String = row.try_get("cacheable_statuses")?;
        let methods_raw: String = row.try_get("cacheable_methods")?;

        Ok(CachePolicy {
            id: row.try_get("id")?,
            ttl_seconds: ttl_seconds.max(0) as u64,
            stale_seconds: stale_seconds.max(0) as u64,
            vary_headers: Self::parse_json_list(&vary_raw, "vary_headers")?,
            cacheable_statuses: Self::parse_json_list(&statuses_raw, "cacheable_statuses")?,
            cacheable_methods: Self::parse_json_list(&methods_raw, "cacheable_methods")?,
            max_body_bytes: max_body_bytes.max(0) as usize,
            cache_no_store: row.try_get("cache_no_store")?,
        })
    }
}

#[async_trait]
impl ConfigRepository for SqliteRepository {
    async fn load_catalog(&self) -> Result<CatalogData, RepositoryError> {
        let tenant_rows = sqlx::query("SELECT id, name, is_active FROM tenants")
            .fetch_all(&self.pool)
            .await?;
        let key_rows = sqlx::query(
            "SELECT id, tenant_id, hashed_secret, prefix, status, rate_limit_rps,
                    rate_limit_burst, rate_limit_algorithm, quota_daily, quota_monthly,
                    last_used_at
             FROM api_keys",
        )
        .fetch_all(&self.pool)
        .await?;
        let route_rows = sqlx::query(
            "SELECT id, name, path_pattern, methods, upstream_base_url, timeout_ms,
                    policy_id, priority, is_active, created_at
             FROM routes",
        )
        .fetch_all(&self.pool)
        .await?;
        let policy_rows = sqlx::query(
            "SELECT id, ttl_seconds, stale_seconds, vary_headers, cacheable_statuses,
                    cacheable_methods, max_body_bytes, cache_no_store
             FROM cache_policies",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(CatalogData {
            tenants: tenant_rows
                .iter()
                .map(Self::row_to_tenant)
                .collect::<Result<_, _>>()?,
            api_keys: key_rows.iter().map(Self::row_to_api_key).collect::<Result<_, _>>()?,
            routes: route_rows.iter().map(Self::row_to_route).collect::<Result<_, _>>()?,
            policies: policy_rows
                .iter()
                .map(Self::row_to_policy)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn insert_block_record(
        &self,
        record: &BlockedKeyRecord,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO blocked_keys
                 (api_key_id, reason, anomaly_score, blocked_at, blocked_until, is_active)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.api_key_id)
        .bind(record.reason.as_str())
        .bind(record.anomaly_score)
        .bind(record.blocked_at)
        .bind(record.blocked_until)
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_block_records(&self, api_key_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE blocked_keys SET is_active = 0 WHERE api_key_id = ?")
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_request_log(&self, log: &RequestLog) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO request_logs
                 (request_id, api_key_id, route_id, method, path, status, latency_ms,
                  cache_status, error_type, at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.request_id)
        .bind(&log.api_key_id)
        .bind(&log.route_id)
        .bind(&log.method)
        .bind(&log.path)
        .bind(i64::from(log.status))
        .bind(log.latency_ms as i64)
        .bind(log.cache_status.as_str())
        .bind(&log.error_type)
        .bind(log.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_key_last_used(
        &self,
        api_key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(at)
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_log::CacheStatus;

    async fn seeded_repo() -> SqliteRepository {
        let repo = SqliteRepository::in_memory().await.expect("in-memory db");

        sqlx::query("INSERT INTO tenants (id, name, is_active) VALUES ('t1', 'acme', 1)")
            .execute(&repo.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, hashed_secret, prefix, status,
                                   rate_limit_rps, rate_limit_burst, quota_daily, quota_monthly)
             VALUES ('k1', 't1', ?, 'pc_abcdefghi', 'active', 10.0, 20, 1000, 0)",
        )
        .bind(ApiKey::hash_secret("pc_secret"))
        .execute(&repo.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO cache_policies (id, ttl_seconds, stale_seconds, vary_headers,
                                         cacheable_statuses, cacheable_methods,
                                         max_body_bytes, cache_no_store)
             VALUES ('p1', 60, 60, '[\"Accept\"]', '[200,404]', '[\"GET\",\"HEAD\"]', 1024, 0)",
        )
        .execute(&repo.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO routes (id, name, path_pattern, methods, upstream_base_url,
                                 timeout_ms, policy_id, priority, is_active, created_at)
             VALUES ('r1', 'demo', '/*', '[\"GET\",\"POST\"]', 'http://up:8001',
                     5000, 'p1', 1, 1, ?)",
        )
        .bind(Utc::now())
        .execute(&repo.pool)
        .await
        .unwrap();

        repo
    }

    #[tokio::test]
    async fn test_load_catalog() {
        let repo = seeded_repo().await;
        let data = repo.load_catalog().await.expect("catalog load should succeed");

        assert_eq!(data.tenants.len(), 1);
        assert_eq!(data.api_keys.len(), 1);
        assert_eq!(data.routes.len(), 1);
        assert_eq!(data.policies.len(), 1);

        let key = &data.api_keys[0];
        assert_eq!(key.tenant_id, "t1");
        assert_eq!(key.status, KeyStatus::Active);
        assert_eq!(key.rate_limit_burst, Some(20));
        assert_eq!(key.quota_daily, 1000);

        let route = &data.routes[0];
        assert_eq!(route.name, "demo");
        assert_eq!(route.methods, vec!["GET", "POST"]);
        assert_eq!(route.policy_id.as_deref(), Some("p1"));

        let policy = &data.policies[0];
        assert_eq!(policy.vary_headers, vec!["Accept"]);
        assert!(policy.is_cacheable_status(404));
    }

    #[tokio::test]
    async fn test_block_record_roundtrip() {
        let repo = seeded_repo().await;
        let record = BlockedKeyRecord {
            api_key_id: "k1".to_string(),
            reason: BlockReason::RateSpike,
            anomaly_score: 4.2,
            blocked_at: Utc::now(),
            blocked_until: Some(Utc::now() + chrono::Duration::seconds(300)),
            is_active: true,
        };
        repo.insert_block_record(&record).await.expect("insert should succeed");

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blocked_keys WHERE api_key_id = 'k1' AND is_active = 1",
        )
        .fetch_one(&repo.pool)
        .await
        .unwrap();
        assert_eq!(active, 1);

        repo.deactivate_block_records("k1").await.expect("deactivate should succeed");
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blocked_keys WHERE api_key_id = 'k1' AND is_active = 1",
        )
        .fetch_one(&repo.pool)
        .await
        .unwrap();
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn test_insert_request_log() {
        let repo = seeded_repo().await;
        let log = RequestLog {
            request_id: "req-1".to_string(),
            api_key_id: Some("k1".to_string()),
            route_id: Some("r1".to_string()),
            method: "GET".to_string(),
            path: "/g/demo/items".to_string(),
            status: 200,
            latency_ms: 12,
            cache_status: CacheStatus::Hit,
            error_type: None,
            at: Utc::now(),
        };
        repo.insert_request_log(&log).await.expect("insert should succeed");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_touch_last_used() {
        let repo = seeded_repo().await;
        let at = Utc::now();
        repo.touch_key_last_used("k1", at).await.expect("touch should succeed");

        let data = repo.load_catalog().await.unwrap();
        let stored = data.api_keys[0].last_used_at.expect("last_used_at should be set");
        assert!((stored - at).num_seconds().abs() < 2);
    }

    #[tokio::test]
    async fn test_ping() {
        let repo = seeded_repo().await;
        assert!(repo.ping().await.is_ok());
    }
}
