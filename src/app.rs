//! The `up` lifecycle: start the group, serve, then tear everything down

use crate::gateway::Gateway;
use crate::supervisor::Supervisor;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How long a stopping gateway may take to drain
const GATEWAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build and launch every service, optionally serve the gateway in-process,
/// and run until `shutdown_rx` turns true or a service exits on its own.
///
/// Returns `Ok` on a requested shutdown (including one that arrives during
/// startup) and `Err` for any startup failure or unexpected exit. In every
/// case the services that were started are stopped before returning.
pub async fn run_up(
    supervisor: &Supervisor,
    embedded_gateway: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interrupted = tokio::select! {
        result = supervisor.up() => {
            result?;
            false
        }
        _ = shutdown_requested(&mut shutdown_rx) => true,
    };
    if interrupted {
        info!("Interrupted during startup, stopping services...");
        supervisor.stop_all().await;
        return Ok(());
    }

    let (gateway_tx, gateway_rx) = watch::channel(false);
    let gateway_handle = if embedded_gateway {
        match start_embedded_gateway(supervisor, gateway_rx).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                supervisor.stop_all().await;
                return Err(e);
            }
        }
    } else {
        None
    };

    let result = supervisor.wait_for_exit(shutdown_rx).await;

    let _ = gateway_tx.send(true);
    info!("Stopping all services...");
    supervisor.stop_all().await;

    if let Some(handle) = gateway_handle {
        let _ = tokio::time::timeout(GATEWAY_DRAIN_TIMEOUT, handle).await;
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Bind before spawning so a taken port fails the whole group
async fn start_embedded_gateway(
    supervisor: &Supervisor,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let gateway = Gateway::from_config(supervisor.config(), shutdown_rx)?;
    let listener = TcpListener::bind(gateway.bind_addr())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind gateway to {}: {}", gateway.bind_addr(), e))?;

    Ok(tokio::spawn(async move {
        if let Err(e) = gateway.serve(listener).await {
            error!(error = %e, "Gateway error");
        }
    }))
}

/// Resolves once shutdown is requested or the sender is gone
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
