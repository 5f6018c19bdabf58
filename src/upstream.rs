//! Outbound side of the gateway
//!
//! Each forwarded request gets its own upstream connection. Establishing the
//! TCP connection is retried a bounded number of times; once connected, the
//! request body and the response body are streamed without buffering.

use crate::config::GatewayConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream {addr} unreachable after {attempts} attempt(s): {source}")]
    Unavailable {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream {addr} did not respond within {}ms", .timeout.as_millis())]
    Timeout { addr: String, timeout: Duration },
    #[error("HTTP exchange with upstream {addr} failed: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: hyper::Error,
    },
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

/// Retry and timeout budget for upstream calls
#[derive(Debug, Clone)]
pub struct UpstreamPolicy {
    /// Extra connection attempts after the first failure
    pub connect_retries: u32,
    /// Pause between connection attempts
    pub retry_delay: Duration,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Max time from sending the request to receiving response headers
    pub request_timeout: Duration,
}

impl UpstreamPolicy {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            connect_retries: config.connect_retries,
            retry_delay: config.retry_delay(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Total connection attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.connect_retries.saturating_add(1)
    }
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

/// Statistics for upstream traffic
#[derive(Debug, Default)]
pub struct UpstreamStats {
    /// Requests that received an upstream response
    pub forwarded: AtomicU64,
    /// Connection attempts that were retried
    pub connect_retries: AtomicU64,
    /// Requests that gave up after exhausting the retry budget
    pub unavailable: AtomicU64,
}

impl UpstreamStats {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.connect_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_connect_retries(&self) -> u64 {
        self.connect_retries.load(Ordering::Relaxed)
    }

    pub fn get_unavailable(&self) -> u64 {
        self.unavailable.load(Ordering::Relaxed)
    }
}

/// Client used by the gateway to reach upstream services
pub struct UpstreamClient {
    policy: UpstreamPolicy,
    stats: Arc<UpstreamStats>,
}

impl UpstreamClient {
    pub fn new(policy: UpstreamPolicy) -> Self {
        debug!(
            connect_retries = policy.connect_retries,
            retry_delay_ms = policy.retry_delay.as_millis() as u64,
            request_timeout_secs = policy.request_timeout.as_secs(),
            "Upstream client initialized"
        );
        Self {
            policy,
            stats: Arc::new(UpstreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Open a TCP connection, retrying up to the policy's budget
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, UpstreamError> {
        let attempts = self.policy.max_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(addr, attempt, error = %e, "Upstream connection failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(addr, attempt, "Upstream connection timed out");
                    last_error = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection attempt timed out",
                    ));
                }
            }

            if attempt < attempts {
                self.stats.record_retry();
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        self.stats.record_unavailable();
        Err(UpstreamError::Unavailable {
            addr: addr.to_string(),
            attempts,
            source: last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no connection attempt made")
            }),
        })
    }

    /// Forward a request to `addr` and return the upstream response with
    /// hop-by-hop headers removed. The body is streamed in both directions.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        addr: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let req = prepare_request(req)?;
        let stream = self.connect(addr).await?;

        let exchange = async {
            let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

            // The connection task ends when the response body is consumed or
            // when the response future is dropped (client went away)
            let conn_addr = addr.to_string();
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(addr = %conn_addr, error = %e, "Upstream connection closed with error");
                }
            });

            sender.send_request(req).await
        };

        let response = tokio::time::timeout(self.policy.request_timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout {
                addr: addr.to_string(),
                timeout: self.policy.request_timeout,
            })?
            .map_err(|source| UpstreamError::Protocol {
                addr: addr.to_string(),
                source,
            })?;

        self.stats.record_forwarded();

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Rewrite an inbound request for an HTTP/1.1 upstream: origin-form URI,
/// a Host header, and no hop-by-hop headers
fn prepare_request<B>(req: Request<B>) -> Result<Request<B>, UpstreamError> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        // HTTP/2 clients carry the host in the :authority pseudo-header
        if let Some(authority) = parts.uri.authority() {
            let value = authority
                .as_str()
                .parse()
                .map_err(|e: hyper::header::InvalidHeaderValue| UpstreamError::RequestBuild(e.to_string()))?;
            parts.headers.insert(HOST, value);
        }
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_policy(retries: u32) -> UpstreamPolicy {
        UpstreamPolicy {
            connect_retries: retries,
            retry_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        }
    }

    /// A port nothing listens on
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_policy_from_gateway() {
        let policy = UpstreamPolicy::default();
        assert_eq!(policy.connect_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("content-type"));
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn test_prepare_request_uses_origin_form() {
        let req = Request::builder()
            .method("POST")
            .uri("http://example.com/api/items?page=2")
            .version(Version::HTTP_2)
            .header("te", "trailers")
            .body(())
            .unwrap();

        let req = prepare_request(req).unwrap();
        assert_eq!(req.uri(), "/api/items?page=2");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers().get(HOST).unwrap(), "example.com");
        assert!(!req.headers().contains_key("te"));
    }

    #[test]
    fn test_prepare_request_keeps_existing_host() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "app.local")
            .body(())
            .unwrap();
        let req = prepare_request(req).unwrap();
        assert_eq!(req.headers().get(HOST).unwrap(), "app.local");
        assert_eq!(req.uri(), "/");
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_bounded_attempts() {
        let port = closed_port().await;
        let client = UpstreamClient::new(fast_policy(2));

        let start = std::time::Instant::now();
        let err = client.connect(&format!("127.0.0.1:{}", port)).await.unwrap_err();

        match err {
            UpstreamError::Unavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected unavailable, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(client.stats().get_connect_retries(), 2);
        assert_eq!(client.stats().get_unavailable(), 1);
    }

    #[tokio::test]
    async fn test_connect_zero_retries_fails_immediately() {
        let port = closed_port().await;
        let client = UpstreamClient::new(fast_policy(0));

        let err = client.connect(&format!("127.0.0.1:{}", port)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { attempts: 1, .. }));
        assert_eq!(client.stats().get_connect_retries(), 0);
    }

    #[tokio::test]
    async fn test_forward_relays_status_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 201 Created\r\ncontent-length: 5\r\nx-upstream: yes\r\nconnection: close\r\n\r\nhello",
                )
                .await
                .unwrap();
        });

        let client = UpstreamClient::new(fast_policy(0));
        let req = Request::builder()
            .uri("/api/items")
            .header(HOST, "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = client.forward(req, &addr).await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        assert!(!response.headers().contains_key("connection"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
        assert_eq!(client.stats().get_forwarded(), 1);
    }

    #[tokio::test]
    async fn test_forward_times_out_on_silent_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut policy = fast_policy(0);
        policy.request_timeout = Duration::from_millis(200);
        let client = UpstreamClient::new(policy);
        let req = Request::builder()
            .uri("/slow")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = client.forward(req, &addr).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout { .. }));
    }
}
