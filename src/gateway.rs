use crate::config::Config;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::router::RouteTable;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamPolicy, UpstreamStats};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Everything a request handler needs; immutable once the gateway starts
struct GatewayState {
    routes: RouteTable,
    upstreams: HashMap<String, String>,
    client: UpstreamClient,
}

/// The public-facing router
pub struct Gateway {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        bind_addr: SocketAddr,
        routes: RouteTable,
        upstreams: HashMap<String, String>,
        policy: UpstreamPolicy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(GatewayState {
                routes,
                upstreams,
                client: UpstreamClient::new(policy),
            }),
            shutdown_rx,
        }
    }

    pub fn from_config(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let routes = RouteTable::from_config(&config.gateway, &config.routes)?;

        let upstreams = config.upstreams();
        if let Some(missing) = routes.services().into_iter().find(|s| !upstreams.contains_key(*s)) {
            anyhow::bail!("Gateway routes to '{}' but no such service is configured", missing);
        }

        Ok(Self::new(
            config.gateway.bind_addr()?,
            routes,
            upstreams,
            UpstreamPolicy::from_gateway(&config.gateway),
            shutdown_rx,
        ))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn routes(&self) -> &RouteTable {
        &self.state.routes
    }

    /// Upstream statistics (forwarded, retried, unavailable)
    pub fn stats(&self) -> Arc<UpstreamStats> {
        self.state.client.stats()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind gateway to {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            routes = self.state.routes.routes().len(),
            default_service = self.state.routes.default_service(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let authority = req.uri().authority().map(|a| a.to_string());
    set_forwarding_headers(req.headers_mut(), client_addr, &request_id, authority.as_deref());

    let route = state.routes.resolve(req.uri().path());
    let service = route.service;

    debug!(
        method = %req.method(),
        uri = %req.uri(),
        service,
        prefix = route.prefix.unwrap_or("<default>"),
        request_id,
        "Incoming request"
    );

    let addr = match state.upstreams.get(service) {
        Some(addr) => addr,
        None => {
            error!(service, request_id, "Route targets a service with no upstream address");
            return Ok(json_error_response(
                GatewayErrorCode::UnknownUpstream,
                "No upstream configured for this route",
            ));
        }
    };

    match state.client.forward(req, addr).await {
        Ok(response) => {
            debug!(service, status = response.status().as_u16(), request_id, "Upstream responded");
            Ok(response)
        }
        Err(e @ UpstreamError::Unavailable { .. }) => {
            warn!(service, addr = %addr, request_id, error = %e, "Upstream unavailable");
            Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                format!("Service '{}' is unavailable", service),
            ))
        }
        Err(e @ UpstreamError::Timeout { .. }) => {
            warn!(service, addr = %addr, request_id, error = %e, "Upstream timed out");
            Ok(json_error_response(
                GatewayErrorCode::UpstreamTimeout,
                format!("Service '{}' did not respond in time", service),
            ))
        }
        Err(e @ UpstreamError::Protocol { .. }) => {
            warn!(service, addr = %addr, request_id, error = %e, "Upstream exchange failed");
            Ok(json_error_response(
                GatewayErrorCode::UpstreamError,
                format!("Service '{}' returned an invalid response", service),
            ))
        }
        Err(e @ UpstreamError::RequestBuild(_)) => {
            error!(service, request_id, error = %e, "Failed to build upstream request");
            Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to forward request",
            ))
        }
    }
}

/// Stamp the request id and the X-Forwarded-* headers.
///
/// X-Forwarded-* values are overwritten rather than appended: the gateway is
/// the first trusted hop, so client-supplied values are not kept.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    request_id: &str,
    authority: Option<&str>,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let host = headers
        .get(HOST)
        .cloned()
        .or_else(|| authority.and_then(|a| HeaderValue::from_str(a).ok()));
    match host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
