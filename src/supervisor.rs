//! Service supervisor
//!
//! Runs every build step, then launches services wave by wave: a service is
//! spawned only once all of its dependencies report ready. Any failure stops
//! what was already started, in reverse start order.

use crate::builder::{forward_output, BuildStep, OutputSource};
use crate::config::{Config, ServiceConfig, ServiceKind};
use crate::docker::{ContainerSpec, DockerRuntime};
use crate::graph::{GraphError, ServiceGraph};
use crate::readiness::Probe;
use crate::secrets::{resolve_all, SecretRef, SecretSet};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often running services are checked for unexpected exits
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Nothing has happened yet
    Pending,
    /// Build step running
    Building,
    /// Build step finished (or there was none)
    Built,
    /// Spawned, waiting for the readiness probe
    Starting,
    /// Readiness probe passed
    Ready,
    /// Build, launch or readiness failed
    Failed,
    /// Shutdown in progress
    Stopping,
    /// Not running anymore
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Build failed for service '{service}': {reason}")]
    BuildFailed { service: String, reason: String },
    #[error("Service '{service}' failed to start: {reason}")]
    StartupFailed { service: String, reason: String },
    #[error("Service '{service}' was not started because dependency '{dependency}' is not ready")]
    DependencyFailed { service: String, dependency: String },
    #[error("Service '{service}' exited unexpectedly: {status}")]
    Exited { service: String, status: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl SupervisorError {
    /// Service the error is about
    pub fn service(&self) -> Option<&str> {
        match self {
            SupervisorError::BuildFailed { service, .. }
            | SupervisorError::StartupFailed { service, .. }
            | SupervisorError::DependencyFailed { service, .. }
            | SupervisorError::Exited { service, .. } => Some(service),
            SupervisorError::Graph(_) => None,
        }
    }
}

enum ProcessHandle {
    Local(Child),
    Docker {
        container_id: String,
        runtime: Arc<DockerRuntime>,
        /// Stops the log streaming task
        logs: watch::Sender<bool>,
    },
}

struct RunningService {
    handle: ProcessHandle,
    grace_period: Duration,
}

/// Builds, launches and stops the services of a topology
pub struct Supervisor {
    config: Config,
    graph: ServiceGraph,
    states: HashMap<String, watch::Sender<ServiceState>>,
    running: DashMap<String, RunningService>,
    /// Services in the order they were spawned
    start_log: Mutex<Vec<String>>,
    /// Docker connections keyed by docker_host ("" for the default)
    docker: DashMap<String, Arc<DockerRuntime>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        let graph = ServiceGraph::from_config(&config)?;
        let states = config
            .services
            .keys()
            .map(|name| (name.clone(), watch::channel(ServiceState::Pending).0))
            .collect();

        Ok(Self {
            config,
            graph,
            states,
            running: DashMap::new(),
            start_log: Mutex::new(Vec::new()),
            docker: DashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.states.get(service).map(|tx| *tx.borrow())
    }

    /// Follow state changes of a service
    pub fn subscribe(&self, service: &str) -> Option<watch::Receiver<ServiceState>> {
        self.states.get(service).map(|tx| tx.subscribe())
    }

    /// Services in the order they were actually spawned
    pub fn started(&self) -> Vec<String> {
        self.start_log.lock().clone()
    }

    fn set_state(&self, service: &str, state: ServiceState) {
        if let Some(tx) = self.states.get(service) {
            let previous = tx.send_replace(state);
            if previous != state {
                debug!(service, ?previous, ?state, "Service state changed");
            }
        }
    }

    fn service_config(&self, service: &str) -> &ServiceConfig {
        &self.config.services[service]
    }

    /// Launch environment: configured `env`, then secrets, then HOST and PORT
    pub fn environment_for(&self, service: &str, secrets: &SecretSet) -> BTreeMap<String, String> {
        let config = self.service_config(service);
        let mut env: BTreeMap<String, String> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in secrets.iter() {
            if env.contains_key(key) {
                warn!(service, key, "Secret overrides a configured environment variable");
            }
            env.insert(key.to_string(), value.to_string());
        }

        // Containers must listen on all interfaces for the published port to reach them
        let host = match config.kind {
            ServiceKind::Docker => "0.0.0.0".to_string(),
            ServiceKind::Local => config.host.clone(),
        };
        env.insert("HOST".to_string(), host);
        env.insert("PORT".to_string(), config.port.to_string());
        env
    }

    /// Build then launch every service. On failure, everything already
    /// started is stopped before the error is returned.
    pub async fn up(&self) -> Result<(), SupervisorError> {
        info!(
            services = self.graph.len(),
            waves = self.graph.waves().len(),
            order = ?self.graph.start_order(),
            "Starting services"
        );

        self.build_all().await?;

        if let Err(e) = self.launch_all().await {
            error!(error = %e, "Startup failed, stopping started services");
            self.stop_all().await;
            return Err(e);
        }

        info!(started = ?self.started(), "All services ready");
        Ok(())
    }

    /// Run every build step concurrently. Nothing is launched here; the
    /// first failure (in start order) is returned after all builds finish.
    pub async fn build_all(&self) -> Result<(), SupervisorError> {
        let order = self.graph.start_order();
        let results = join_all(order.iter().map(|service| self.build_service(service))).await;
        results.into_iter().collect()
    }

    async fn build_service(&self, service: &str) -> Result<(), SupervisorError> {
        let config = self.service_config(service);
        let build_failed = |reason: String| SupervisorError::BuildFailed {
            service: service.to_string(),
            reason,
        };

        let step = match BuildStep::for_service(config) {
            Ok(Some(step)) => step,
            Ok(None) => {
                self.set_state(service, ServiceState::Built);
                return Ok(());
            }
            Err(e) => {
                self.set_state(service, ServiceState::Failed);
                return Err(build_failed(format!("{:#}", e)));
            }
        };

        self.set_state(service, ServiceState::Building);
        match step.run(service, config.build_timeout(&self.config.defaults)).await {
            Ok(_) => {
                self.set_state(service, ServiceState::Built);
                Ok(())
            }
            Err(e) => {
                self.set_state(service, ServiceState::Failed);
                Err(build_failed(format!("{:#}", e)))
            }
        }
    }

    /// Launch every service as soon as its dependencies are ready
    pub async fn launch_all(&self) -> Result<(), SupervisorError> {
        let order = self.graph.start_order();
        let results = join_all(order.iter().map(|service| self.launch_when_ready(service))).await;

        // Report the root cause rather than the services that were waiting on it
        let mut errors: Vec<SupervisorError> = results.into_iter().filter_map(Result::err).collect();
        match errors
            .iter()
            .position(|e| !matches!(e, SupervisorError::DependencyFailed { .. }))
        {
            Some(index) => Err(errors.swap_remove(index)),
            None => errors.into_iter().next().map_or(Ok(()), Err),
        }
    }

    async fn launch_when_ready(&self, service: &str) -> Result<(), SupervisorError> {
        for dependency in self.graph.dependencies(service) {
            self.wait_until_ready(service, dependency).await?;
        }

        match self.launch_service(service).await {
            Ok(()) => {
                self.set_state(service, ServiceState::Ready);
                info!(service, "Service ready");
                Ok(())
            }
            Err(reason) => {
                self.set_state(service, ServiceState::Failed);
                error!(
                    service,
                    reason = %reason,
                    blocked = ?self.graph.dependents(service),
                    "Service failed to start"
                );
                Err(SupervisorError::StartupFailed {
                    service: service.to_string(),
                    reason,
                })
            }
        }
    }

    async fn wait_until_ready(&self, service: &str, dependency: &str) -> Result<(), SupervisorError> {
        let dependency_failed = || SupervisorError::DependencyFailed {
            service: service.to_string(),
            dependency: dependency.to_string(),
        };

        let mut rx = self.subscribe(dependency).ok_or_else(dependency_failed)?;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ServiceState::Ready => return Ok(()),
                ServiceState::Failed | ServiceState::Stopping | ServiceState::Stopped => {
                    warn!(service, dependency, ?state, "Dependency will not become ready");
                    return Err(dependency_failed());
                }
                _ => {
                    debug!(service, dependency, ?state, "Waiting for dependency");
                }
            }
            if rx.changed().await.is_err() {
                return Err(dependency_failed());
            }
        }
    }

    /// Resolve secrets, spawn the service and wait for its readiness probe.
    /// Returns the failure reason on error.
    async fn launch_service(&self, service: &str) -> Result<(), String> {
        let config = self.service_config(service);
        self.set_state(service, ServiceState::Starting);

        // Secrets fail closed: nothing is spawned unless every file parses
        let secret_refs = config
            .secrets
            .iter()
            .map(|name| SecretRef::from_config(&self.config, name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let secrets = resolve_all(&secret_refs).map_err(|e| e.to_string())?;
        if !secrets.is_empty() {
            debug!(service, keys = ?secrets.keys().collect::<Vec<_>>(), "Secrets resolved");
        }

        let env = self.environment_for(service, &secrets);
        let handle = match config.kind {
            ServiceKind::Local => self.spawn_local(service, config, &env)?,
            ServiceKind::Docker => self.start_docker(service, config, &env, &secret_refs).await?,
        };

        self.running.insert(
            service.to_string(),
            RunningService {
                handle,
                grace_period: config.shutdown_grace_period(&self.config.defaults),
            },
        );
        self.start_log.lock().push(service.to_string());

        self.await_ready(service, config).await
    }

    fn spawn_local(
        &self,
        service: &str,
        config: &ServiceConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, String> {
        let argv = config.argv().map_err(|e| format!("{:#}", e))?;

        for mount in &config.mounts {
            if !Path::new(&mount.source).exists() {
                return Err(format!("mount source '{}' does not exist", mount.source));
            }
        }

        info!(service, command = %shell_words::join(&argv), port = config.port, "Starting local service");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", argv[0], e))?;
        let pid = child.id().unwrap_or(0);
        info!(service, pid, "Service process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(service.to_string(), "stdout", OutputSource::Service, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(service.to_string(), "stderr", OutputSource::Service, stderr));
        }

        Ok(ProcessHandle::Local(child))
    }

    async fn start_docker(
        &self,
        service: &str,
        config: &ServiceConfig,
        env: &BTreeMap<String, String>,
        secrets: &[SecretRef],
    ) -> Result<ProcessHandle, String> {
        let spec = ContainerSpec::for_service(service, config, env, secrets).map_err(|e| format!("{:#}", e))?;
        let runtime = self
            .docker_runtime(config.docker_host.as_deref())
            .await
            .map_err(|e| format!("{:#}", e))?;

        let container_id = runtime
            .start_container(service, spec)
            .await
            .map_err(|e| format!("{:#}", e))?;
        let logs = runtime.stream_logs(container_id.clone(), service.to_string());

        Ok(ProcessHandle::Docker {
            container_id,
            runtime,
            logs,
        })
    }

    async fn docker_runtime(&self, docker_host: Option<&str>) -> anyhow::Result<Arc<DockerRuntime>> {
        let key = docker_host.unwrap_or_default().to_string();
        if let Some(runtime) = self.docker.get(&key) {
            return Ok(runtime.value().clone());
        }

        let runtime = Arc::new(DockerRuntime::connect(docker_host).await?);
        Ok(self.docker.entry(key).or_insert(runtime).value().clone())
    }

    /// Poll the readiness probe until it passes, the process exits, or the
    /// startup timeout elapses
    async fn await_ready(&self, service: &str, config: &ServiceConfig) -> Result<(), String> {
        let defaults = &self.config.defaults;
        let probe = Probe::for_service(config, defaults);
        let timeout = config.startup_timeout(defaults);
        let interval = config.probe_interval(defaults);
        let start = Instant::now();

        debug!(service, probe = %probe, timeout_secs = timeout.as_secs(), "Waiting for readiness");

        loop {
            if let Some(status) = self.exit_status(service).await {
                return Err(format!("exited before becoming ready ({})", status));
            }

            if start.elapsed() > timeout {
                return Err(format!(
                    "not ready within {}s (probe {})",
                    timeout.as_secs(),
                    probe
                ));
            }

            if probe.check().await {
                // A grace delay says nothing about the process; make sure it survived
                if let Some(status) = self.exit_status(service).await {
                    return Err(format!("exited before becoming ready ({})", status));
                }
                debug!(service, elapsed_ms = start.elapsed().as_millis() as u64, "Readiness probe passed");
                return Ok(());
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Exit status of a service that is no longer running, if any
    async fn exit_status(&self, service: &str) -> Option<String> {
        let (container_id, runtime) = {
            let mut entry = self.running.get_mut(service)?;
            match &mut entry.handle {
                ProcessHandle::Local(child) => {
                    return match child.try_wait() {
                        Ok(Some(status)) => Some(status.to_string()),
                        Ok(None) => None,
                        Err(e) => Some(format!("unknown status: {}", e)),
                    };
                }
                ProcessHandle::Docker {
                    container_id,
                    runtime,
                    ..
                } => (container_id.clone(), Arc::clone(runtime)),
            }
        };

        if runtime.is_running(&container_id).await {
            return None;
        }
        match runtime.wait_container(&container_id).await {
            Ok(code) => Some(format!("container exit code: {}", code)),
            Err(_) => Some("container stopped".to_string()),
        }
    }

    /// Watch running services until shutdown is requested (`Ok`) or one of
    /// them exits on its own (`Err`)
    pub async fn wait_for_exit(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                    for service in self.started() {
                        if let Some(status) = self.exit_status(&service).await {
                            error!(service, status = %status, "Service exited unexpectedly");
                            self.set_state(&service, ServiceState::Failed);
                            return Err(SupervisorError::Exited { service, status });
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop one service: SIGTERM, then SIGKILL after its grace period
    pub async fn stop_service(&self, service: &str) {
        let Some((_, running)) = self.running.remove(service) else {
            return;
        };

        self.set_state(service, ServiceState::Stopping);
        match running.handle {
            ProcessHandle::Local(mut child) => {
                stop_local_process(service, &mut child, running.grace_period).await;
            }
            ProcessHandle::Docker {
                container_id,
                runtime,
                logs,
            } => {
                info!(service, container_id, "Stopping Docker container");
                if let Err(e) = runtime.stop_container(&container_id, running.grace_period).await {
                    warn!(service, container_id, error = %e, "Error stopping container, forcing kill");
                    let _ = runtime.kill_container(&container_id).await;
                }
                let _ = runtime.remove_container(&container_id).await;
                let _ = logs.send(true);
            }
        }

        if self.state(service) == Some(ServiceState::Stopping) {
            self.set_state(service, ServiceState::Stopped);
        }
    }

    /// Stop every started service in reverse start order
    pub async fn stop_all(&self) {
        let order = self.started();
        for service in order.iter().rev() {
            self.stop_service(service).await;
        }

        // Anything spawned but not yet logged
        let leftovers: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for service in leftovers {
            self.stop_service(&service).await;
        }
    }
}

async fn stop_local_process(service: &str, child: &mut Child, grace_period: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(service, %status, "Service process already exited");
        return;
    }

    if let Some(pid) = child.id() {
        info!(service, pid, "Sending SIGTERM to service");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(service, %status, "Service process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(service, error = %e, "Error waiting for service to exit");
        }
        Err(_) => {
            warn!(
                service,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProbeConfig, SecretConfig};

    fn sleeper(port: u16) -> ServiceConfig {
        let mut service = ServiceConfig::local("sleep 30", port).with_readiness(ProbeConfig::None);
        service.grace_delay_ms = Some(20);
        service
    }

    fn config_with(services: Vec<(&str, ServiceConfig)>) -> Config {
        let mut config: Config = toml::from_str("").unwrap();
        for (name, service) in services {
            config.services.insert(name.to_string(), service);
        }
        config
    }

    #[test]
    fn test_new_rejects_cycles() {
        let config = config_with(vec![
            ("a", sleeper(9001).with_depends_on(&["b"])),
            ("b", sleeper(9002).with_depends_on(&["a"])),
        ]);
        assert!(matches!(
            Supervisor::new(config),
            Err(SupervisorError::Graph(GraphError::Cycle(_)))
        ));
    }

    #[test]
    fn test_initial_state() {
        let supervisor = Supervisor::new(config_with(vec![("frontend", sleeper(9003))])).unwrap();
        assert_eq!(supervisor.state("frontend"), Some(ServiceState::Pending));
        assert_eq!(supervisor.state("unknown"), None);
        assert!(supervisor.started().is_empty());
    }

    #[test]
    fn test_environment_for() {
        let mut backend = sleeper(8000);
        backend.host = "0.0.0.0".to_string();
        backend.env.insert("LOG_LEVEL".to_string(), "info".to_string());
        backend.env.insert("API_KEY".to_string(), "placeholder".to_string());
        backend.env.insert("PORT".to_string(), "1".to_string());

        let supervisor = Supervisor::new(config_with(vec![("backend", backend)])).unwrap();
        let secrets = SecretSet::parse("backend_env", "API_KEY=s3cret\nDB_URL=postgres://db\n").unwrap();
        let env = supervisor.environment_for("backend", &secrets);

        assert_eq!(env["HOST"], "0.0.0.0");
        assert_eq!(env["PORT"], "8000");
        assert_eq!(env["LOG_LEVEL"], "info");
        assert_eq!(env["API_KEY"], "s3cret");
        assert_eq!(env["DB_URL"], "postgres://db");
    }

    #[test]
    fn test_environment_for_docker_listens_on_all_interfaces() {
        let supervisor =
            Supervisor::new(config_with(vec![("backend", ServiceConfig::docker("api:latest", 8000))])).unwrap();
        let env = supervisor.environment_for("backend", &SecretSet::default());
        assert_eq!(env["HOST"], "0.0.0.0");
    }

    #[test]
    fn test_error_service() {
        let err = SupervisorError::StartupFailed {
            service: "backend".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(err.service(), Some("backend"));
        assert!(err.to_string().contains("'backend'"));
    }

    #[tokio::test]
    async fn test_secret_is_injected_at_launch() {
        let dir = tempfile::tempdir().unwrap();
        let secret_file = dir.path().join("backend.env");
        std::fs::write(&secret_file, "export API_KEY=\"s3cret\"\n").unwrap();

        let mut backend = ServiceConfig::local(
            r#"sh -c 'test "$API_KEY" = s3cret && test "$PORT" = 18000 && sleep 30'"#,
            18000,
        )
        .with_readiness(ProbeConfig::None)
        .with_secrets(&["backend_env"]);
        backend.grace_delay_ms = Some(300);

        let mut config = config_with(vec![("backend", backend)]);
        config.secrets.insert(
            "backend_env".to_string(),
            SecretConfig {
                file: secret_file.to_string_lossy().into_owned(),
            },
        );

        let supervisor = Supervisor::new(config).unwrap();
        supervisor.up().await.unwrap();
        assert_eq!(supervisor.state("backend"), Some(ServiceState::Ready));

        supervisor.stop_all().await;
        assert_eq!(supervisor.state("backend"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn test_missing_mount_source_fails_startup() {
        let mut service = sleeper(9004);
        service.mounts.push(crate::config::MountConfig {
            source: "/nonexistent/tiergate-mount".to_string(),
            target: "/data".to_string(),
            read_only: true,
        });

        let supervisor = Supervisor::new(config_with(vec![("frontend", service)])).unwrap();
        let err = supervisor.up().await.unwrap_err();
        match err {
            SupervisorError::StartupFailed { service, reason } => {
                assert_eq!(service, "frontend");
                assert!(reason.contains("does not exist"));
            }
            other => panic!("expected startup failure, got {:?}", other),
        }
        assert!(supervisor.started().is_empty());
    }

    #[tokio::test]
    async fn test_stop_sends_sigterm_before_grace_period() {
        let mut service = sleeper(9005);
        service.shutdown_grace_period_secs = Some(10);

        let supervisor = Supervisor::new(config_with(vec![("frontend", service)])).unwrap();
        supervisor.up().await.unwrap();

        let start = Instant::now();
        supervisor.stop_service("frontend").await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.state("frontend"), Some(ServiceState::Stopped));
    }
}
