//! The gateway request engine.
//!
//! One [`GatewayEngine::handle`] call per inbound request, composing
//! authentication → route match → abuse precheck → rate limit → quota →
//! cache path → upstream fetch → post-processing → log emission. Every
//! outbound dependency (KV, upstream, persistence) is timeout-bounded; KV
//! trouble degrades the request path instead of failing it.

pub mod errors;

pub use errors::GatewayError;

use crate::{
    abuse::AbuseDetector,
    auth::{ApiKey, ConfigRepository},
    cache::{
        service::unix_ms_now, BloomFilter, BloomProbe, CacheEntry, CacheKeyBuilder, CacheLookup,
        CoalescedFetch, FetchPayload, ResponseCache,
    },
    catalog::{CachePolicy, ConfigCatalog, Route, RouteMatch},
    kv::KvStore,
    limit::{QuotaCounter, QuotaDecision, RateLimitDecision, RateLimiter},
    metrics::MetricsCollector,
    request_log::{CacheStatus, RequestLog, RequestLogHandle},
    upstream::{UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse},
};
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::{sync::Arc, time::Duration, time::Instant};
use tracing::{debug, warn};

/// Response headers never forwarded back to clients.
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["connection", "keep-alive", "transfer-encoding", "upgrade", "content-length"];

/// Engine-level configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_rate_limit_rps: f64,
    pub default_rate_limit_burst: u32,
    pub upstream_default_timeout: Duration,
    /// False whenever the gateway runs on the fallback KV store.
    pub bloom_enabled: bool,
}

/// An inbound request, already routed to `/g/{route_name}/{path...}`.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub request_id: String,
    pub method: String,
    pub route_name: String,
    /// Remaining path after the route name, with leading slash.
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The response handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Per-request state accumulated while the pipeline advances, used by
/// post-processing and logging regardless of where the request exited.
#[derive(Default)]
struct RequestContext {
    api_key: Option<Arc<ApiKey>>,
    route: Option<Arc<Route>>,
    admitted: bool,
    cache_status: CacheStatus,
}

/// The gateway request pipeline.
pub struct GatewayEngine {
    catalog: Arc<ConfigCatalog>,
    cache: Arc<ResponseCache>,
    bloom: Arc<BloomFilter>,
    limiter: RateLimiter,
    quota: QuotaCounter,
    abuse: Arc<AbuseDetector>,
    upstream: Arc<UpstreamClient>,
    repo: Arc<dyn ConfigRepository>,
    logs: RequestLogHandle,
    metrics: Arc<MetricsCollector>,
    config: EngineConfig,
}

impl GatewayEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<ConfigCatalog>,
        kv: Arc<dyn KvStore>,
        cache: Arc<ResponseCache>,
        bloom: Arc<BloomFilter>,
        abuse: Arc<AbuseDetector>,
        upstream: Arc<UpstreamClient>,
        repo: Arc<dyn ConfigRepository>,
        logs: RequestLogHandle,
        metrics: Arc<MetricsCollector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            cache,
            bloom,
            limiter: RateLimiter::new(Arc::clone(&kv)),
            quota: QuotaCounter::new(kv),
            abuse,
            upstream,
            repo,
            logs,
            metrics,
            config,
        }
    }

    /// Runs one request through the pipeline. Never fails at this level:
    /// errors become their mapped HTTP responses.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        self.metrics.record_request();

        let mut ctx = RequestContext::default();
        let (mut response, error_kind) = match self.process(&request, &mut ctx).await {
            Ok(response) => (response, None),
            Err(error) => {
                self.record_error_metrics(&error);
                let kind = error.kind();
                (self.error_response(&error, &request.request_id), Some(kind))
            }
        };

        // Post-processing headers, present on success and error alike.
        response
            .headers
            .push(("x-request-id".to_string(), request.request_id.clone()));
        if let Some(route) = &ctx.route {
            response.headers.push(("x-route".to_string(), route.name.clone()));
        }
        if ctx.cache_status != CacheStatus::None {
            response
                .headers
                .push(("x-cache".to_string(), ctx.cache_status.as_str().to_string()));
        }

        if ctx.admitted {
            if let Some(api_key) = &ctx.api_key {
                self.abuse
                    .record_request(&api_key.id, response.status >= 400, unix_ms_now())
                    .await;

                let repo = Arc::clone(&self.repo);
                let api_key_id = api_key.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = repo.touch_key_last_used(&api_key_id, Utc::now()).await {
                        debug!(api_key_id = %api_key_id, error = %e, "last-used update failed");
                    }
                });
            }
        }

        self.logs.emit(RequestLog {
            request_id: request.request_id.clone(),
            api_key_id: ctx.api_key.as_ref().map(|k| k.id.clone()),
            route_id: ctx.route.as_ref().map(|r| r.id.clone()),
            method: request.method.clone(),
            path: format!("/g/{}{}", request.route_name, request.path),
            status: response.status,
            latency_ms: started.elapsed().as_millis() as u64,
            cache_status: ctx.cache_status,
            error_type: error_kind.map(String::from),
            at: Utc::now(),
        });

        response
    }

    async fn process(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<GatewayResponse, GatewayError> {
        // 1. Credentials.
        let presented = header_value(&request.headers, "x-api-key")
            .ok_or(GatewayError::MissingApiKey)?;

        // 2. Authenticate against the catalog snapshot.
        let snapshot = self.catalog.current();
        let auth = snapshot
            .authenticate(&ApiKey::hash_secret(presented))
            .ok_or(GatewayError::InvalidApiKey)?;
        ctx.api_key = Some(Arc::clone(&auth.api_key));

        // 3. Route match.
        let matched: RouteMatch = snapshot
            .match_route(&request.route_name, &request.method, &request.path)
            .ok_or(GatewayError::NoRoute)?;
        ctx.route = Some(Arc::clone(&matched.route));

        // 4. Abuse precheck.
        let now_ms = unix_ms_now();
        if let Some(block) = self.abuse.check_blocked(&auth.api_key.id, now_ms).await {
            return Err(GatewayError::AbuseBlocked {
                reason: block.reason.as_str().to_string(),
                retry_after_seconds: block.retry_after_seconds(now_ms),
            });
        }

        // 5. Rate limit (key overrides, then gateway defaults).
        let rps = auth.api_key.rate_limit_rps.unwrap_or(self.config.default_rate_limit_rps);
        let burst =
            auth.api_key.rate_limit_burst.unwrap_or(self.config.default_rate_limit_burst);
        if let RateLimitDecision::Deny { retry_after_seconds } = self
            .limiter
            .check(
                &auth.api_key.id,
                &matched.route.id,
                rps,
                burst,
                auth.api_key.rate_limit_algorithm,
            )
            .await
        {
            return Err(GatewayError::RateLimited { retry_after_seconds });
        }

        // 6. Quota.
        if let QuotaDecision::Deny { scope, retry_after_seconds } = self
            .quota
            .check_and_increment(
                &auth.api_key.id,
                auth.api_key.quota_daily,
                auth.api_key.quota_monthly,
                Utc::now(),
            )
            .await
        {
            return Err(GatewayError::QuotaExceeded { scope, retry_after_seconds });
        }
        ctx.admitted = true;

        let upstream_request = self.build_upstream_request(request, &matched.route);

        // 7-8. Cache path when the method and policy allow it, else bypass.
        let cache_policy = matched
            .policy
            .clone()
            .filter(|p| !p.cache_no_store && p.is_cacheable_method(&request.method));

        match cache_policy {
            Some(policy) => {
                self.cached_fetch(request, ctx, &auth.tenant.id, &matched, &policy, upstream_request)
                    .await
            }
            None => {
                ctx.cache_status = CacheStatus::Bypass;
                self.metrics.record_cache_bypass();
                let response = self.upstream.fetch(upstream_request).await?;
                Ok(render_upstream(response))
            }
        }
    }

    /// Steps 7–9 for cacheable traffic: lookup, SWR, bloom-guarded negative
    /// short-circuit, and the coalesced miss path.
    async fn cached_fetch(
        &self,
        request: &GatewayRequest,
        ctx: &mut RequestContext,
        tenant_id: &str,
        matched: &RouteMatch,
        policy: &Arc<CachePolicy>,
        upstream_request: UpstreamRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let cache_key = CacheKeyBuilder::build(
            &request.method,
            tenant_id,
            &matched.route.name,
            &request.path,
            request.query.as_deref(),
            &request.headers,
            &policy.vary_headers,
        );
        let now_ms = unix_ms_now();

        match self.cache.lookup(&cache_key, now_ms).await {
            CacheLookup::Hit(entry) => {
                ctx.cache_status = CacheStatus::Hit;
                self.metrics.record_cache_hit();
                Ok(render_entry(&entry, true, now_ms))
            }
            CacheLookup::Stale(entry) => {
                ctx.cache_status = CacheStatus::Stale;
                self.metrics.record_cache_stale();
                self.metrics.record_revalidation();
                let fetch = self.make_fetch(
                    upstream_request,
                    Arc::clone(policy),
                    request.method.clone(),
                );
                self.cache.spawn_revalidation(&cache_key, fetch);
                Ok(render_entry(&entry, true, now_ms))
            }
            CacheLookup::Miss => {
                // Bloom hint: a remembered 404 with a stored negative entry
                // answers without touching the origin.
                if self.config.bloom_enabled {
                    if let Ok(BloomProbe::Maybe) = self.bloom.probe(&cache_key).await {
                        if let Some(entry) = self.cache.lookup_negative(&cache_key).await {
                            ctx.cache_status = CacheStatus::Hit;
                            self.metrics.record_negative_hit();
                            return Ok(render_entry(&entry, true, now_ms));
                        }
                    }
                }

                ctx.cache_status = CacheStatus::Miss;
                self.metrics.record_cache_miss();

                let fetch = self.make_fetch(
                    upstream_request,
                    Arc::clone(policy),
                    request.method.clone(),
                );
                let outcome = self.cache.fetch_coalesced(&cache_key, fetch).await?;
                if matches!(outcome, CoalescedFetch::FromPeer(_)) {
                    self.metrics.record_coalesced_wait();
                }
                let entry = outcome.into_entry();

                if self.config.bloom_enabled
                    && matches!(entry.status, 404 | 410)
                    && request.method.eq_ignore_ascii_case("GET")
                {
                    if let Err(e) = self.bloom.add(&cache_key).await {
                        debug!(key = %cache_key, error = %e, "bloom add skipped");
                    }
                    let ttl = Duration::from_secs(policy.ttl_seconds.max(1));
                    self.cache.store_negative(&cache_key, &entry, ttl).await;
                }

                Ok(render_entry(&entry, false, now_ms))
            }
        }
    }

    fn build_upstream_request(&self, request: &GatewayRequest, route: &Route) -> UpstreamRequest {
        let timeout = if route.timeout_ms > 0 {
            Duration::from_millis(route.timeout_ms)
        } else {
            self.config.upstream_default_timeout
        };

        UpstreamRequest {
            method: request.method.clone(),
            base_url: route.upstream_base_url.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout,
        }
    }

    /// Builds the reusable fetch closure shared by the single-flight leader
    /// and background revalidation: perform the upstream exchange, then
    /// judge storability under the policy.
    fn make_fetch(
        &self,
        template: UpstreamRequest,
        policy: Arc<CachePolicy>,
        method: String,
    ) -> impl Fn() -> BoxFuture<'static, Result<FetchPayload, UpstreamError>> + Send + Sync + 'static
    {
        let upstream = Arc::clone(&self.upstream);
        move || {
            let upstream = Arc::clone(&upstream);
            let template = template.clone();
            let policy = Arc::clone(&policy);
            let method = method.clone();
            Box::pin(async move {
                let response = upstream.fetch(template).await?;
                Ok(build_payload(response, &policy, &method))
            })
        }
    }

    fn record_error_metrics(&self, error: &GatewayError) {
        match error {
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => {
                self.metrics.record_auth_failure();
            }
            GatewayError::NoRoute => self.metrics.record_no_route(),
            GatewayError::RateLimited { .. } => self.metrics.record_rate_limited(),
            GatewayError::QuotaExceeded { .. } => self.metrics.record_quota_exceeded(),
            GatewayError::AbuseBlocked { .. } => self.metrics.record_abuse_blocked(),
            GatewayError::UpstreamTimeout => self.metrics.record_upstream_timeout(),
            GatewayError::Upstream(_) => self.metrics.record_upstream_error(),
            GatewayError::Internal(_) => self.metrics.record_internal_error(),
        }
    }

    fn error_response(&self, error: &GatewayError, request_id: &str) -> GatewayResponse {
        if matches!(error, GatewayError::Internal(_)) {
            warn!(request_id, error = %error, "internal gateway error");
        }

        let mut body = json!({
            "error": error.kind(),
            "request_id": request_id,
        });
        if let Some(detail) = error.detail() {
            body["detail"] = json!(detail);
        }

        let mut headers =
            vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(retry_after) = error.retry_after_seconds() {
            headers.push(("retry-after".to_string(), retry_after.to_string()));
        }

        GatewayResponse {
            status: error.http_status(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }
}

/// Judges a completed origin exchange against the policy and stamps the
/// freshness windows.
fn build_payload(response: UpstreamResponse, policy: &CachePolicy, method: &str) -> FetchPayload {
    let now_ms = unix_ms_now();
    let headers: Vec<(String, String)> = response
        .headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();

    let response_no_store = headers.iter().any(|(name, value)| {
        name == "cache-control" && value.to_ascii_lowercase().contains("no-store")
    });

    let entry = CacheEntry {
        status: response.status,
        headers,
        body: response.body,
        stored_at: now_ms,
        fresh_until: now_ms + policy.ttl_seconds as i64 * 1000,
        stale_until: now_ms + (policy.ttl_seconds + policy.stale_seconds) as i64 * 1000,
        origin: response.origin,
    };

    let store = !policy.cache_no_store
        && policy.is_cacheable_status(entry.status)
        && policy.is_cacheable_method(method)
        && entry.body.len() <= policy.max_body_bytes
        && !response_no_store;

    FetchPayload { entry, store }
}

/// Renders a cache entry back into a client response. `Age` is only present
/// when the response was served from the cache (HIT/STALE).
fn render_entry(entry: &CacheEntry, include_age: bool, now_ms: i64) -> GatewayResponse {
    let mut headers: Vec<(String, String)> = entry
        .headers
        .iter()
        .filter(|(name, _)| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
        .cloned()
        .collect();
    if include_age {
        headers.push(("age".to_string(), entry.age_seconds(now_ms).to_string()));
    }

    GatewayResponse { status: entry.status, headers, body: entry.body.clone() }
}

/// Renders a bypass (uncached) upstream response.
fn render_upstream(response: UpstreamResponse) -> GatewayResponse {
    let headers = response
        .headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .filter(|(name, _)| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
        .collect();

    GatewayResponse { status: response.status, headers, body: response.body }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
