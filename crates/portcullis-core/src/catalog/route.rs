//! Route and cache-policy models plus route selection.
//!
//! Routes are addressed by name in the gateway URL (`/g/{route_name}/...`);
//! among same-named active routes the winner is the one whose pattern
//! matches the remaining path and whose method set contains the verb, ties
//! broken by priority (higher first), then most-specific pattern (longest
//! literal prefix), then creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Proxy routing rule for one upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    /// Glob/prefix pattern matched against the path after the route name.
    /// `*` matches any suffix and is only meaningful at the end.
    pub path_pattern: String,
    pub methods: Vec<String>,
    pub upstream_base_url: String,
    pub timeout_ms: u64,
    /// `None` disables caching for this route's traffic.
    pub policy_id: Option<String>,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Route {
    #[must_use]
    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        match self.path_pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.path_pattern == path,
        }
    }

    /// Length of the literal part of the pattern; longer is more specific.
    #[must_use]
    pub fn pattern_specificity(&self) -> usize {
        match self.path_pattern.strip_suffix('*') {
            Some(prefix) => prefix.len(),
            None => self.path_pattern.len() + 1,
        }
    }
}

/// Caching behavior attached to a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    pub id: String,
    pub ttl_seconds: u64,
    /// Length of the stale-while-revalidate window after the TTL.
    pub stale_seconds: u64,
    /// Ordered request header names partitioning the cache.
    pub vary_headers: Vec<String>,
    pub cacheable_statuses: Vec<u16>,
    pub cacheable_methods: Vec<String>,
    pub max_body_bytes: usize,
    /// Bypass flag: the route keeps its policy but nothing is stored.
    pub cache_no_store: bool,
}

impl CachePolicy {
    #[must_use]
    pub fn default_cacheable_statuses() -> Vec<u16> {
        vec![200, 203, 204, 301, 304, 404, 410]
    }

    #[must_use]
    pub fn default_cacheable_methods() -> Vec<String> {
        vec!["GET".to_string(), "HEAD".to_string()]
    }

    #[must_use]
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        self.cacheable_statuses.contains(&status)
    }

    #[must_use]
    pub fn is_cacheable_method(&self, method: &str) -> bool {
        self.cacheable_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Orders candidate routes best-first for selection.
pub(crate) fn route_order(a: &Route, b: &Route) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.pattern_specificity().cmp(&a.pattern_specificity()))
        .then_with(|| a.created_at.cmp(&b.created_at))
}
