//! Canonical cache key derivation.
//!
//! The fingerprint must be stable under query-parameter reordering and
//! header-name casing, and must change whenever the tenant, route, path,
//! any query value, or any configured vary-header value changes.

use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Field separator inside the canonical byte string. Cannot appear in an
/// URL-encoded query or a token header value, so fields cannot collide.
const SEPARATOR: u8 = 0x1f;

/// Builds canonical cache keys of the form `cache:<hex>`.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Derives the cache key for one request.
    ///
    /// `vary_headers` is the policy's ordered list; for each name the
    /// matching request header value is folded in lowercased, or empty when
    /// absent.
    #[must_use]
    pub fn build(
        method: &str,
        tenant_id: &str,
        route_name: &str,
        path: &str,
        query: Option<&str>,
        request_headers: &[(String, String)],
        vary_headers: &[String],
    ) -> String {
        let mut canonical: Vec<u8> = Vec::with_capacity(128);

        canonical.extend_from_slice(method.to_ascii_uppercase().as_bytes());
        canonical.push(SEPARATOR);
        canonical.extend_from_slice(tenant_id.as_bytes());
        canonical.push(SEPARATOR);
        canonical.extend_from_slice(route_name.as_bytes());
        canonical.push(SEPARATOR);
        canonical.extend_from_slice(normalize_path(path).as_bytes());
        canonical.push(SEPARATOR);
        canonical.extend_from_slice(normalize_query(query).as_bytes());

        for name in vary_headers {
            canonical.push(SEPARATOR);
            canonical.extend_from_slice(name.to_ascii_lowercase().as_bytes());
            canonical.push(b'=');
            if let Some(value) = header_value(request_headers, name) {
                canonical.extend_from_slice(value.to_ascii_lowercase().as_bytes());
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("cache:{}", hex::encode(hasher.finalize()))
    }

    /// Key of the single-flight lease guarding a cache key.
    #[must_use]
    pub fn lock_key(cache_key: &str) -> String {
        format!("lock:{cache_key}")
    }

    /// Key of the revalidation lease guarding a stale refresh.
    #[must_use]
    pub fn revalidate_key(cache_key: &str) -> String {
        format!("revalidate:{cache_key}")
    }

    /// Key of the stored negative (404/410) entry.
    #[must_use]
    pub fn negative_key(cache_key: &str) -> String {
        format!("neg:{cache_key}")
    }

    /// Pub/sub topic announcing a completed single-flight fetch.
    #[must_use]
    pub fn done_topic(cache_key: &str) -> String {
        format!("cache:done:{cache_key}")
    }
}

fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// Parses, sorts (by name then value) and re-encodes the query string.
fn normalize_query(query: Option<&str>) -> String {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return String::new();
    };

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in &pairs {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
