//! Upstream HTTP execution.
//!
//! One shared connection pool serves every route. Each fetch carries the
//! route's deadline covering DNS, connect, TLS and the full response read.
//! Outcomes are classified so the pipeline can map them onto client-visible
//! error kinds (504 for deadlines, 502 for connect/protocol failures).

use bytes::Bytes;
use reqwest::{Client, ClientBuilder, Method};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Hop-by-hop headers that must not be forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers owned by the gateway exchange itself: the client's credential and
/// the inbound host must never leak to the origin.
const GATEWAY_HEADERS: &[&str] = &["x-api-key", "host", "content-length"];

/// Classified upstream failure.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The route deadline elapsed before the response completed.
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream connect error: {0}")]
    Connect(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// A request ready to be replayed against the origin.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub base_url: String,
    /// Path after the route name, with leading slash.
    pub path: String,
    pub query: Option<String>,
    /// Raw inbound headers; hygiene filtering happens here.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
}

/// A completed origin exchange.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Lowercase names, response order preserved.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Host component of the origin URL, for diagnostics and cache entries.
    pub origin: String,
}

/// Shared upstream HTTP client.
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    /// Builds the shared client. `max_timeout` caps any route deadline and
    /// bounds pool-level waits.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Protocol`] if the underlying client fails to
    /// build.
    pub fn new(max_timeout: Duration) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(5))
            .timeout(max_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("portcullis/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                warn!(error = %e, "failed to build upstream http client");
                UpstreamError::Protocol(format!("client build failed: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Replays a request against the origin under the route deadline.
    ///
    /// # Errors
    ///
    /// Returns the classified [`UpstreamError`]; HTTP error statuses are NOT
    /// errors here, they are responses.
    pub async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = build_url(&request.base_url, &request.path, request.query.as_deref())?;
        let origin = url
            .host_str()
            .map(|host| match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
            .unwrap_or_default();

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| UpstreamError::InvalidRequest(format!("method {}", request.method)))?;

        let mut builder = self.client.request(method, url).timeout(request.timeout);
        for (name, value) in filter_request_headers(&request.headers) {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| classify(&e))?;
        debug!(status, origin = %origin, bytes = body.len(), "upstream fetch completed");

        Ok(UpstreamResponse { status, headers, body, origin })
    }
}

/// Joins base URL, remaining path and the original query string.
fn build_url(base: &str, path: &str, query: Option<&str>) -> Result<url::Url, UpstreamError> {
    let mut joined = String::with_capacity(base.len() + path.len() + 16);
    joined.push_str(base.trim_end_matches('/'));
    if !path.starts_with('/') {
        joined.push('/');
    }
    joined.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        joined.push('?');
        joined.push_str(query);
    }
    url::Url::parse(&joined)
        .map_err(|e| UpstreamError::InvalidRequest(format!("url {joined}: {e}")))
}

/// Drops hop-by-hop and gateway-owned headers; everything else forwards.
fn filter_request_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !HOP_BY_HOP_HEADERS.contains(&name.as_str())
                && !GATEWAY_HEADERS.contains(&name.as_str())
        })
        .cloned()
        .collect()
}

/// Maps a transport error onto the outcome classification, with messages
/// sanitized so internal addresses do not leak into client-facing errors.
fn classify(error: &reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout
    } else if error.is_connect() {
        UpstreamError::Connect("connection refused or unreachable".to_string())
    } else if error.is_body() || error.is_decode() {
        UpstreamError::Protocol("response body error".to_string())
    } else if error.is_redirect() {
        UpstreamError::Protocol("too many redirects".to_string())
    } else if error.is_request() {
        UpstreamError::Protocol("request failed".to_string())
    } else {
        UpstreamError::Protocol("network error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UpstreamClient {
        UpstreamClient::new(Duration::from_secs(30)).expect("client should build")
    }

    fn base_request(base_url: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: "GET".to_string(),
            base_url: base_url.to_string(),
            path: "/items".to_string(),
            query: None,
            headers: vec![],
            body: Bytes::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_build_url_joins_cleanly() {
        let url = build_url("http://up:8001/", "/items", None).unwrap();
        assert_eq!(url.as_str(), "http://up:8001/items");

        let url = build_url("http://up:8001", "items/1", Some("a=1&b=2")).unwrap();
        assert_eq!(url.as_str(), "http://up:8001/items/1?a=1&b=2");
    }

    #[test]
    fn test_build_url_rejects_garbage() {
        assert!(build_url("not a url", "/x", None).is_err());
    }

    #[test]
    fn test_filter_strips_hop_by_hop_and_gateway_headers() {
        let headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Keep-Alive".to_string(), "timeout=5".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Upgrade".to_string(), "websocket".to_string()),
            ("Proxy-Authorization".to_string(), "basic xyz".to_string()),
            ("Host".to_string(), "gateway.example".to_string()),
            ("X-API-Key".to_string(), "pc_secret".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), "Bearer client-token".to_string()),
        ];

        let filtered = filter_request_headers(&headers);
        let names: Vec<&str> = filtered.iter().map(|(n, _)| n.as_str()).collect();

        assert_eq!(names, vec!["Accept", "Authorization"]);
    }

    #[tokio::test]
    async fn test_fetch_success_and_header_forwarding() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items")
            .match_header("accept", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":1}]"#)
            .create_async()
            .await;

        let mut request = base_request(&server.url());
        request.headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("X-API-Key".to_string(), "pc_secret".to_string()),
        ];

        let response = client().fetch(request).await.expect("fetch should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(br#"[{"id":1}]"#));
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "content-type" && v == "application/json"));
        assert!(!response.origin.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_api_key_not_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items")
            .match_header("x-api-key", mockito::Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let mut request = base_request(&server.url());
        request.headers = vec![("X-API-Key".to_string(), "pc_secret".to_string())];

        client().fetch(request).await.expect("fetch should succeed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_a_response() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/items").with_status(404).with_body("nope").create_async().await;

        let response = client().fetch(base_request(&server.url())).await.unwrap();
        assert_eq!(response.status, 404, "4xx is a response, not an UpstreamError");
    }

    #[tokio::test]
    async fn test_fetch_query_and_body_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_query(mockito::Matcher::UrlEncoded("a".into(), "1".into()))
            .match_body("payload")
            .with_status(201)
            .create_async()
            .await;

        let mut request = base_request(&server.url());
        request.method = "POST".to_string();
        request.query = Some("a=1".to_string());
        request.body = Bytes::from_static(b"payload");

        let response = client().fetch(request).await.expect("fetch should succeed");
        assert_eq!(response.status, 201);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_connect_error_classified() {
        // Port 9 on localhost: nothing is listening.
        let result = client().fetch(base_request("http://127.0.0.1:9")).await;
        match result {
            Err(UpstreamError::Connect(msg)) => {
                assert!(!msg.contains("127.0.0.1"), "sanitized message must not leak addresses");
            }
            Err(UpstreamError::Timeout) => {} // some environments swallow RST into timeouts
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_deadline_enforced() {
        use std::io::Write as _;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/items")
            .with_status(200)
            .with_chunked_body(|writer| {
                std::thread::sleep(std::time::Duration::from_millis(500));
                writer.write_all(b"late")
            })
            .create_async()
            .await;

        let mut request = base_request(&server.url());
        request.timeout = Duration::from_millis(100);

        match client().fetch(request).await {
            Err(UpstreamError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let mut request = base_request("http://up:8001");
        request.method = "NOT A METHOD".to_string();
        assert!(matches!(
            client().fetch(request).await,
            Err(UpstreamError::InvalidRequest(_))
        ));
    }
}
