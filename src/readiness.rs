//! Readiness probes used while a service starts

use crate::config::{ProbeConfig, ServiceConfig, ServiceDefaults};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Upper bound for a single probe attempt
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single readiness check
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// The address accepts TCP connections
    Tcp { addr: String },
    /// `GET path` on the address returns a 2xx status
    Http { addr: String, path: String },
    /// No check; the service is considered ready after the delay
    Delay(Duration),
}

impl Probe {
    pub fn for_service(config: &ServiceConfig, defaults: &ServiceDefaults) -> Self {
        match &config.readiness {
            ProbeConfig::Tcp => Probe::Tcp {
                addr: config.upstream_addr(),
            },
            ProbeConfig::Http { path } => Probe::Http {
                addr: config.upstream_addr(),
                path: path.clone(),
            },
            ProbeConfig::None => Probe::Delay(config.grace_delay(defaults)),
        }
    }

    /// Run the probe once. A `Delay` probe sleeps and then succeeds.
    pub async fn check(&self) -> bool {
        match self {
            Probe::Tcp { addr } => check_tcp(addr).await,
            Probe::Http { addr, path } => check_http(addr, path).await,
            Probe::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                true
            }
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Tcp { addr } => write!(f, "tcp://{}", addr),
            Probe::Http { addr, path } => write!(f, "http://{}{}", addr, path),
            Probe::Delay(delay) => write!(f, "delay {}ms", delay.as_millis()),
        }
    }
}

async fn check_tcp(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

async fn check_http(addr: &str, path: &str) -> bool {
    let result = tokio::time::timeout(PROBE_TIMEOUT, async {
        let stream = TcpStream::connect(addr).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(hyper::header::HOST, addr)
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(req).await?;
        Ok::<_, anyhow::Error>(response.status())
    })
    .await;

    match result {
        Ok(Ok(status)) => {
            trace!(addr, path, status = status.as_u16(), "Readiness probe response");
            status.is_success()
        }
        Ok(Err(e)) => {
            trace!(addr, path, error = %e, "Readiness probe failed");
            false
        }
        Err(_) => false,
    }
}
