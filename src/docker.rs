//! Docker container management for docker-type services

use crate::config::ServiceConfig;
use crate::secrets::SecretRef;
use anyhow::Context;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything needed to create a service's container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub config: Config<String>,
}

impl ContainerSpec {
    /// Build the container definition for a service.
    ///
    /// `env` is the final launch environment, secrets included. Every secret
    /// file is also bind-mounted read-only under `/run/secrets/<name>`.
    pub fn for_service(
        service: &str,
        config: &ServiceConfig,
        env: &BTreeMap<String, String>,
        secrets: &[SecretRef],
    ) -> anyhow::Result<Self> {
        let image = config
            .image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Docker service requires 'image' field"))?;

        let name = config
            .container_name
            .clone()
            .unwrap_or_else(|| format!("tiergate-{}", service));

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        // Publish the service port on loopback only; the gateway is the public face
        let port_key = format!("{}/tcp", config.port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(config.port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut binds = Vec::with_capacity(config.mounts.len() + secrets.len());
        for mount in &config.mounts {
            let source = absolute_source(Path::new(&mount.source))?;
            binds.push(bind_spec(&source, &mount.target, mount.read_only));
        }
        for secret in secrets {
            let source = absolute_source(&secret.path)?;
            binds.push(bind_spec(&source, &secret.container_path(), true));
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: config.network.clone(),
            binds: (!binds.is_empty()).then_some(binds),
            ..Default::default()
        };

        let cmd = if config.command.is_some() {
            Some(config.argv()?)
        } else if !config.args.is_empty() {
            Some(config.args.clone())
        } else {
            None
        };

        Ok(Self {
            name,
            image: image.clone(),
            config: Config {
                image: Some(image),
                cmd,
                env: Some(env),
                exposed_ports: Some(exposed_ports),
                host_config: Some(host_config),
                ..Default::default()
            },
        })
    }

    /// Bind mounts in `source:target[:ro]` form
    pub fn binds(&self) -> &[String] {
        self.config
            .host_config
            .as_ref()
            .and_then(|h| h.binds.as_deref())
            .unwrap_or(&[])
    }
}

fn bind_spec(source: &Path, target: &str, read_only: bool) -> String {
    if read_only {
        format!("{}:{}:ro", source.display(), target)
    } else {
        format!("{}:{}", source.display(), target)
    }
}

/// Docker only accepts absolute bind sources
fn absolute_source(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("mount source '{}' does not exist", path.display()))
}

/// Connection to the Docker daemon
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host.map(String::from).or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(host) => Self::connect_to_host(&host)
                .with_context(|| format!("Failed to connect to Docker at '{}'", host))?,
            None => Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set DOCKER_HOST.",
                    e
                )
            })?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Create and start a container, replacing any stale one with the same name
    pub async fn start_container(&self, service: &str, spec: ContainerSpec) -> anyhow::Result<String> {
        let _ = self.remove_container(&spec.name).await;

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), spec.config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    spec.name,
                    spec.image,
                    e
                )
            })?;

        let container_id = response.id;
        info!(
            service,
            container_id,
            container_name = %spec.name,
            image = %spec.image,
            "Created Docker container"
        );

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to start container '{}' (id: {}): {}",
                    spec.name,
                    container_id,
                    e
                )
            })?;

        info!(service, container_id, "Started Docker container");
        Ok(container_id)
    }

    /// Stop a container, giving it `timeout` before Docker kills it
    pub async fn stop_container(&self, container_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!(container_id, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }

    /// Remove a container; removal errors are logged, never returned
    pub async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => debug!(container_id, "Removed Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!(container_id, "Container not found"),
            Err(e) => warn!(container_id, error = %e, "Failed to remove container"),
        }
        Ok(())
    }

    pub async fn is_running(&self, container_id: &str) -> bool {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Wait for a container to exit and return its exit code
    pub async fn wait_container(&self, container_id: &str) -> anyhow::Result<i64> {
        let mut stream = self
            .client
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(anyhow::anyhow!("Failed to wait for container: {}", e)),
            None => anyhow::bail!("Container wait stream ended without a status"),
        }
    }

    /// Stream container logs and forward them to tracing
    ///
    /// Returns a sender that stops the streaming task when `true` is sent
    /// or when it is dropped.
    pub fn stream_logs(&self, container_id: String, service: String) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: false,
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(service, container_id, "Log streaming stopped");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => {
                                let (stream, message) = match output {
                                    LogOutput::StdOut { message } => ("stdout", message),
                                    LogOutput::StdErr { message } => ("stderr", message),
                                    LogOutput::Console { message } => ("console", message),
                                    LogOutput::StdIn { .. } => continue,
                                };
                                let line = String::from_utf8_lossy(&message);
                                let line = line.trim_end();
                                if !line.is_empty() {
                                    info!(target: "container", service, stream, "{}", line);
                                }
                            }
                            Some(Err(e)) => {
                                warn!(service, container_id, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(service, container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
