//! In-memory view of tenants, API keys, routes and cache policies.
//!
//! The catalog is a copy-on-write snapshot ([`arc_swap`]) refreshed from the
//! persistence store on a timer and invalidated early by `config:changed`
//! pub/sub notifications from the admin surface. Request handling only ever
//! touches the snapshot; no request waits on the database.

mod route;

pub use route::{CachePolicy, Route};
pub(crate) use route::route_order;

use crate::{
    auth::{
        repository::{CatalogData, ConfigRepository, RepositoryError},
        ApiKey, Tenant,
    },
    kv::KvStore,
};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Topic carrying admin mutation notifications.
pub const CONFIG_CHANGED_TOPIC: &str = "config:changed";

/// Notification payload published by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// `tenant`, `api_key`, `route`, `policy`, `cache_purge` or `unblock`.
    pub entity: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Glob for `cache_purge`; defaults to every cache entry.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// A successful authentication: the key and its (active) tenant.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: Arc<ApiKey>,
    pub tenant: Arc<Tenant>,
}

/// A matched route and its policy, if any.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub policy: Option<Arc<CachePolicy>>,
}

/// One immutable view of the configuration.
#[derive(Default)]
pub struct CatalogSnapshot {
    tenants: HashMap<String, Arc<Tenant>>,
    keys_by_hash: HashMap<String, Arc<ApiKey>>,
    routes_by_name: HashMap<String, Vec<Arc<Route>>>,
    policies: HashMap<String, Arc<CachePolicy>>,
}

impl CatalogSnapshot {
    #[must_use]
    pub fn build(data: CatalogData) -> Self {
        let tenants: HashMap<String, Arc<Tenant>> =
            data.tenants.into_iter().map(|t| (t.id.clone(), Arc::new(t))).collect();
        let keys_by_hash: HashMap<String, Arc<ApiKey>> = data
            .api_keys
            .into_iter()
            .map(|k| (k.hashed_secret.clone(), Arc::new(k)))
            .collect();
        let policies: HashMap<String, Arc<CachePolicy>> =
            data.policies.into_iter().map(|p| (p.id.clone(), Arc::new(p))).collect();

        let mut routes_by_name: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for route in data.routes {
            if !route.is_active {
                continue;
            }
            routes_by_name.entry(route.name.clone()).or_default().push(Arc::new(route));
        }
        for candidates in routes_by_name.values_mut() {
            candidates.sort_by(|a, b| route_order(a.as_ref(), b.as_ref()));
        }

        Self { tenants, keys_by_hash, routes_by_name, policies }
    }

    /// Looks up the presented bearer by its hash. Returns `None` for unknown
    /// hashes, non-active keys, and inactive or missing tenants alike; the
    /// caller cannot distinguish which, by design.
    #[must_use]
    pub fn authenticate(&self, hashed_secret: &str) -> Option<AuthContext> {
        let api_key = self.keys_by_hash.get(hashed_secret)?;
        if !api_key.is_active() {
            return None;
        }
        let tenant = self.tenants.get(&api_key.tenant_id)?;
        if !tenant.is_active {
            return None;
        }
        Some(AuthContext { api_key: Arc::clone(api_key), tenant: Arc::clone(tenant) })
    }

    /// Selects the best active route for `(name, method, path)`.
    #[must_use]
    pub fn match_route(&self, route_name: &str, method: &str, path: &str) -> Option<RouteMatch> {
        let candidates = self.routes_by_name.get(route_name)?;
        let route = candidates
            .iter()
            .find(|r| r.matches_method(method) && r.matches_path(path))?;
        let policy = route
            .policy_id
            .as_ref()
            .and_then(|id| self.policies.get(id))
            .map(Arc::clone);
        Some(RouteMatch { route: Arc::clone(route), policy })
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys_by_hash.len()
    }
}

/// Shared, refreshable configuration catalog.
pub struct ConfigCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
    repo: Arc<dyn ConfigRepository>,
}

impl ConfigCatalog {
    /// Performs the initial load. Failure here is a startup error.
    ///
    /// # Errors
    /// Returns [`RepositoryError`] if the persistence store cannot be read.
    pub async fn load(repo: Arc<dyn ConfigRepository>) -> Result<Arc<Self>, RepositoryError> {
        let data = repo.load_catalog().await?;
        let snapshot = CatalogSnapshot::build(data);
        info!(keys = snapshot.key_count(), "config catalog loaded");
        Ok(Arc::new(Self { snapshot: ArcSwap::from_pointee(snapshot), repo }))
    }

    #[must_use]
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }

    /// Re-reads the whole catalog and swaps the snapshot in.
    ///
    /// # Errors
    /// Returns [`RepositoryError`] if the read fails; the previous snapshot
    /// stays in place.
    pub async fn refresh(&self) -> Result<(), RepositoryError> {
        let data = self.repo.load_catalog().await?;
        self.snapshot.store(Arc::new(CatalogSnapshot::build(data)));
        debug!("config catalog refreshed");
        Ok(())
    }

    /// Spawns the background refresh loop: a periodic full re-read plus
    /// `config:changed` subscription handling. Runs until shutdown.
    pub fn start_refresh_task(
        self: &Arc<Self>,
        kv: Arc<dyn KvStore>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it, we loaded at startup.
            ticker.tick().await;

            let mut subscription = match kv.subscribe(CONFIG_CHANGED_TOPIC).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    warn!(error = %e, "config change subscription unavailable, relying on periodic refresh");
                    None
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("catalog refresh task shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = catalog.refresh().await {
                            warn!(error = %e, "periodic catalog refresh failed");
                        }
                        if subscription.is_none() {
                            subscription = kv.subscribe(CONFIG_CHANGED_TOPIC).await.ok();
                        }
                    }

                    message = recv_or_pending(&mut subscription) => {
                        match message {
                            Some(payload) => {
                                catalog.handle_change(&kv, &payload).await;
                            }
                            None => {
                                warn!("config change subscription closed");
                                subscription = None;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle_change(&self, kv: &Arc<dyn KvStore>, payload: &[u8]) {
        let event: ChangeEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring malformed config change event");
                return;
            }
        };

        match event.entity.as_str() {
            "cache_purge" => {
                let pattern = event.pattern.as_deref().unwrap_or("cache:*");
                match kv.del_pattern(pattern).await {
                    Ok(count) => info!(pattern, count, "cache purge applied"),
                    Err(e) => warn!(pattern, error = %e, "cache purge failed"),
                }
            }
            "unblock" => {
                let Some(id) = event.id.as_deref() else {
                    warn!("unblock event without key id");
                    return;
                };
                if let Err(e) = kv.del(&format!("abuse:block:{id}")).await {
                    warn!(api_key_id = id, error = %e, "failed to clear abuse block key");
                }
                if let Err(e) = self.repo.deactivate_block_records(id).await {
                    warn!(api_key_id = id, error = %e, "failed to deactivate block records");
                }
                info!(api_key_id = id, "api key unblocked");
            }
            "tenant" | "api_key" | "route" | "policy" => {
                debug!(entity = %event.entity, id = ?event.id, "config entity changed");
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "catalog refresh after change event failed");
                }
            }
            other => {
                warn!(entity = other, "unknown config change entity");
            }
        }
    }
}

/// Awaits the next message when a subscription exists, otherwise parks
/// forever so the surrounding `select!` ignores this branch.
async fn recv_or_pending(
    subscription: &mut Option<crate::kv::Subscription>,
) -> Option<bytes::Bytes> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
