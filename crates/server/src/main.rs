use anyhow::Result;
use axum::{
    routing::{any, get},
    serve, Router,
};
use portcullis_core::{
    abuse::{AbuseConfig, AbuseDetector},
    auth::{ConfigRepository, SqliteRepository},
    cache::{BloomFilter, CacheSettings, ResponseCache},
    catalog::ConfigCatalog,
    config::AppConfig,
    kv::{KvStore, MemoryStore, RedisStore},
    metrics::MetricsCollector,
    pipeline::{EngineConfig, GatewayEngine},
    request_log,
    upstream::UpstreamClient,
};
use server::{middleware, router};
use std::{sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Request bodies past this size are rejected before they reach the engine.
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,portcullis_core={level},server={level}",
            level = config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty().with_target(false)).init();
    }
}

/// Probes the shared KV backend once at startup. Unreachable (or demo mode)
/// means the gateway runs degraded on the in-process fallback; the health
/// endpoint reports it and the bloom hint is disabled.
async fn init_kv(
    config: &AppConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> (Arc<dyn KvStore>, bool) {
    if config.force_fallback_kv() {
        info!("using in-process fallback kv store (demo mode or no REDIS_URL)");
        let store = Arc::new(MemoryStore::new());
        store.start_janitor(shutdown_tx.subscribe());
        return (store, false);
    }

    match RedisStore::connect(&config.redis_url, config.kv_op_timeout()).await {
        Ok(store) => {
            info!("shared kv backend connected");
            (Arc::new(store), true)
        }
        Err(e) => {
            warn!(error = %e, "shared kv backend unreachable, degrading to fallback store");
            let store = Arc::new(MemoryStore::new());
            store.start_janitor(shutdown_tx.subscribe());
            (store, false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()
        .map_err(|e| anyhow::anyhow!("configuration load failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    init_logging(&config);
    info!(bind = %config.bind_address, port = config.bind_port, "starting portcullis gateway");

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Persistence is load-bearing for authentication: failing to reach it at
    // startup is fatal.
    let sqlite = SqliteRepository::new(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("persistence store unavailable: {e}"))?;
    sqlite
        .ensure_schema()
        .await
        .map_err(|e| anyhow::anyhow!("schema bootstrap failed: {e}"))?;
    let repo: Arc<dyn ConfigRepository> = Arc::new(sqlite);

    let (kv, kv_shared) = init_kv(&config, &shutdown_tx).await;

    let catalog = ConfigCatalog::load(Arc::clone(&repo))
        .await
        .map_err(|e| anyhow::anyhow!("initial catalog load failed: {e}"))?;
    let catalog_task = catalog.start_refresh_task(
        Arc::clone(&kv),
        config.catalog_refresh_interval(),
        shutdown_tx.subscribe(),
    );

    let cache_settings = CacheSettings {
        lock_ttl: Duration::from_secs(config.cache_lock_ttl_seconds),
        safety_margin: Duration::from_secs(config.cache_safety_margin_seconds),
        revalidation_workers: config.revalidation_workers,
        ..CacheSettings::default()
    };
    let cache =
        Arc::new(ResponseCache::new(Arc::clone(&kv), cache_settings, shutdown_tx.clone()));
    let bloom = Arc::new(BloomFilter::new(
        Arc::clone(&kv),
        config.bloom_expected_items,
        config.bloom_false_positive_rate,
    ));
    let abuse = Arc::new(AbuseDetector::new(
        Arc::clone(&kv),
        Arc::clone(&repo),
        AbuseConfig {
            alpha: config.abuse_ewma_alpha,
            z_threshold: config.abuse_zscore_threshold,
            block_duration: config.abuse_block_duration(),
            ..AbuseConfig::default()
        },
    ));
    let upstream = Arc::new(
        UpstreamClient::new(config.upstream_default_timeout())
            .map_err(|e| anyhow::anyhow!("upstream client init failed: {e}"))?,
    );
    let (logs, log_writer) = request_log::spawn_writer(
        Arc::clone(&repo),
        config.log_queue_capacity,
        shutdown_tx.subscribe(),
    );
    let metrics = Arc::new(MetricsCollector::new());
    metrics.set_kv_degraded(!kv_shared);

    let engine = Arc::new(GatewayEngine::new(
        Arc::clone(&catalog),
        Arc::clone(&kv),
        cache,
        bloom,
        abuse,
        upstream,
        Arc::clone(&repo),
        logs.clone(),
        Arc::clone(&metrics),
        EngineConfig {
            default_rate_limit_rps: config.default_rate_limit_rps,
            default_rate_limit_burst: config.default_rate_limit_burst,
            upstream_default_timeout: config.upstream_default_timeout(),
            bloom_enabled: kv_shared,
        },
    ));

    let state = Arc::new(router::AppState {
        engine,
        kv,
        repo,
        metrics,
        logs,
        kv_shared,
    });

    let (set_request_id, propagate_request_id) = middleware::create_request_id_layers();
    let app = Router::new()
        .route("/health", get(router::handle_health))
        .route("/metrics", get(router::handle_metrics))
        .route("/g/:route_name", any(router::handle_gateway_root))
        .route("/g/:route_name/*path", any(router::handle_gateway))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(config.max_concurrent_requests))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(propagate_request_id)
        .layer(set_request_id);

    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "gateway listening");

    if let Err(e) = serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }

    // Stop background work and let the log writer flush.
    let _ = shutdown_tx.send(());
    catalog_task.abort();
    if let Err(e) = tokio::time::timeout(Duration::from_secs(5), log_writer).await {
        warn!(error = %e, "log writer did not flush in time");
    }
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
