use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiergate::config::Config;
use tiergate::gateway::Gateway;
use tiergate::graph::ServiceGraph;
use tiergate::router::RouteTable;
use tiergate::supervisor::Supervisor;
use tiergate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tiergate")]
#[command(version)]
#[command(about = "Runs a frontend, an API backend and a path-routing gateway behind one port", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and launch all services in dependency order
    Up {
        /// Topology file
        #[arg(default_value = "tiergate.toml")]
        config: PathBuf,

        /// Run the gateway in this process once all services are ready
        #[arg(long)]
        embedded_gateway: bool,
    },
    /// Run only the gateway
    Gateway {
        /// Topology file
        #[arg(default_value = "tiergate.toml")]
        config: PathBuf,
    },
    /// Validate the topology and print the start order
    Check {
        /// Topology file
        #[arg(default_value = "tiergate.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tiergate=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Up {
            config,
            embedded_gateway,
        } => run_up(&config, embedded_gateway).await,
        Commands::Gateway { config } => run_gateway(&config).await,
        Commands::Check { config } => run_check(&config),
    };

    if let Err(ref e) = result {
        error!(error = %format!("{:#}", e), "Exiting with failure");
    }
    result
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn run_up(config_path: &Path, embedded_gateway: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    print_startup_banner(&config);

    let supervisor = Supervisor::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tiergate::run_up(&supervisor, embedded_gateway, shutdown_rx).await
}

async fn run_gateway(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Gateway::from_config(&config, shutdown_rx)?;

    for route in gateway.routes().routes() {
        info!(prefix = route.prefix(), service = route.service(), "Route");
    }
    info!(service = gateway.routes().default_service(), "Default route");

    let stats = gateway.stats();
    let mut handle = tokio::spawn(gateway.run());

    let result = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = shutdown_signal() => None,
    };

    let result = match result {
        Some(joined) => joined.map_err(|e| anyhow::anyhow!("Gateway task failed: {}", e))?,
        None => {
            let _ = shutdown_tx.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
            Ok(())
        }
    };

    info!(
        forwarded = stats.get_forwarded(),
        connect_retries = stats.get_connect_retries(),
        unavailable = stats.get_unavailable(),
        "Gateway stopped"
    );
    result
}

fn run_check(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let graph = ServiceGraph::from_config(&config)?;
    let routes = RouteTable::from_config(&config.gateway, &config.routes)?;

    println!("Configuration OK: {}", config_path.display());
    println!();
    println!("Start order:");
    for (index, wave) in graph.waves().iter().enumerate() {
        println!("  wave {}: {}", index + 1, wave.join(", "));
    }
    println!();
    println!("Routes:");
    for route in routes.routes() {
        println!("  {:<20} -> {}", route.prefix(), route.service());
    }
    println!("  {:<20} -> {}", "(default)", routes.default_service());

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting services");
    info!(
        bind = %config.gateway.bind,
        port = config.gateway.port,
        default_service = %config.gateway.default_service,
        routes = config.routes.len(),
        "Gateway configuration"
    );
    info!(
        connect_retries = config.gateway.connect_retries,
        retry_delay_ms = config.gateway.retry_delay_ms,
        request_timeout_secs = config.gateway.request_timeout_secs,
        "Upstream settings"
    );
    info!(
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        probe_interval_ms = config.defaults.probe_interval_ms,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Service defaults"
    );

    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();
    for name in names {
        let service = &config.services[name];
        if service.secrets.is_empty() {
            info!(service = %name, kind = ?service.kind, port = service.port, "Service configured");
        } else {
            info!(
                service = %name,
                kind = ?service.kind,
                port = service.port,
                secrets = ?service.secrets,
                "Service configured"
            );
        }
    }
}
