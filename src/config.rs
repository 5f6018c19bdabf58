use crate::graph::ServiceGraph;
use crate::router::RouteTable;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Topology of the composed application
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Global default settings for services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Service descriptors keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    /// Path-prefix routing rules
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Secret files keyed by logical name
    #[serde(default)]
    pub secrets: HashMap<String, SecretConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Public port (default: 80)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Service receiving requests that match no route (default: frontend)
    #[serde(default = "default_service_name")]
    pub default_service: String,

    /// Extra connection attempts after the first one fails (default: 3)
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Pause between connection attempts in milliseconds (default: 50)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Timeout for a single connection attempt in milliseconds (default: 1000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Max time to wait for an upstream response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid gateway bind address '{}:{}': {}", self.bind, self.port, e))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_bind_address(),
            default_service: default_service_name(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Max time for a service to become ready, in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Fixed delay used when a service has no readiness probe, in milliseconds
    #[serde(default = "default_grace_delay")]
    pub grace_delay_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Max time for a build step, in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            grace_delay_ms: default_grace_delay(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

/// Service runtime: local process or Docker container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Local process spawned directly (default)
    #[default]
    Local,
    /// Docker container managed via Docker API
    Docker,
}

/// Build step run before any service is launched.
///
/// Exactly one of `command` (a local build command such as `npm run build`)
/// or `context` (a Dockerfile build tagged with the service's `image`) is set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BuildConfig {
    /// Local build command
    pub command: Option<String>,

    /// Arguments for the build command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the build command
    pub working_dir: Option<String>,

    /// Docker build context directory
    pub context: Option<String>,

    /// Dockerfile path relative to the context (default: Dockerfile)
    pub dockerfile: Option<String>,

    /// Docker build arguments. Secrets never belong here.
    #[serde(default)]
    pub build_args: HashMap<String, String>,

    /// Build timeout in seconds (overrides default)
    pub timeout_secs: Option<u64>,
}

/// How the supervisor decides that a service is ready
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeConfig {
    /// The service port accepts TCP connections
    Tcp,
    /// GET on `path` returns a 2xx status
    Http { path: String },
    /// No probe; wait a fixed grace delay instead
    None,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Tcp
    }
}

/// A path made available to a service
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MountConfig {
    /// Host path
    pub source: String,
    /// Path inside the container (ignored for local services)
    pub target: String,
    /// Mount read-only (default: true)
    #[serde(default = "default_true")]
    pub read_only: bool,
}

/// Configuration for a single service
///
/// # Security Warning
///
/// `command`, `args` and `build.command` are executed directly with the
/// permissions of the supervisor. Topology files must come from trusted
/// sources and be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Service type: "local" (default) or "docker"
    #[serde(default, rename = "type")]
    pub kind: ServiceKind,

    /// Optional build step
    pub build: Option<BuildConfig>,

    // === Local process fields ===
    /// Command to run; split with shell quoting rules when `args` is empty
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command (local only)
    pub working_dir: Option<String>,

    // === Docker-specific fields ===
    /// Docker image to run (and tag, when built from a context)
    pub image: Option<String>,

    /// Container name (default: tiergate-{service})
    pub container_name: Option<String>,

    /// Docker host URL (default: auto-detected)
    pub docker_host: Option<String>,

    /// Docker network to connect to
    pub network: Option<String>,

    // === Common fields ===
    /// Host the service binds to, exported as HOST (default: 127.0.0.1)
    #[serde(default = "default_service_host")]
    pub host: String,

    /// Port the service listens on, exported as PORT
    pub port: u16,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Mounted paths
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    /// Names of secrets injected at launch
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Services that must be ready before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Readiness probe (default: tcp)
    #[serde(default)]
    pub readiness: ProbeConfig,

    /// Startup timeout in seconds (overrides default)
    pub startup_timeout_secs: Option<u64>,

    /// Probe interval in milliseconds (overrides default)
    pub probe_interval_ms: Option<u64>,

    /// Grace delay in milliseconds when readiness is "none" (overrides default)
    pub grace_delay_ms: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,
}

impl ServiceConfig {
    /// Create a new local service config with defaults
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            kind: ServiceKind::Local,
            build: None,
            command: Some(command.to_string()),
            args: Vec::new(),
            working_dir: None,
            image: None,
            container_name: None,
            docker_host: None,
            network: None,
            host: default_service_host(),
            port,
            env: HashMap::new(),
            mounts: Vec::new(),
            secrets: Vec::new(),
            depends_on: Vec::new(),
            readiness: ProbeConfig::default(),
            startup_timeout_secs: None,
            probe_interval_ms: None,
            grace_delay_ms: None,
            shutdown_grace_period_secs: None,
        }
    }

    /// Create a new Docker service config with defaults
    pub fn docker(image: &str, port: u16) -> Self {
        Self {
            kind: ServiceKind::Docker,
            command: None,
            image: Some(image.to_string()),
            ..Self::local("", port)
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set dependencies (builder pattern)
    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Set secrets (builder pattern)
    pub fn with_secrets(mut self, secrets: &[&str]) -> Self {
        self.secrets = secrets.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the readiness probe (builder pattern)
    pub fn with_readiness(mut self, readiness: ProbeConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Full argument vector: the command (split with shell rules when no
    /// explicit args are given) followed by `args`
    pub fn argv(&self) -> anyhow::Result<Vec<String>> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("service has no 'command'"))?;
        command_argv(command, &self.args)
    }

    /// Address the gateway and readiness probes connect to
    pub fn upstream_addr(&self) -> String {
        if self.kind == ServiceKind::Docker {
            // Docker services publish their port on the loopback interface
            return format!("127.0.0.1:{}", self.port);
        }
        match self.host.as_str() {
            "0.0.0.0" | "" => format!("127.0.0.1:{}", self.port),
            "::" | "[::]" => format!("[::1]:{}", self.port),
            host if host.contains(':') && !host.starts_with('[') => format!("[{}]:{}", host, self.port),
            host => format!("{}:{}", host, self.port),
        }
    }

    pub fn startup_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs))
    }

    pub fn probe_interval(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.probe_interval_ms.unwrap_or(defaults.probe_interval_ms))
    }

    pub fn grace_delay(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.grace_delay_ms.unwrap_or(defaults.grace_delay_ms))
    }

    pub fn shutdown_grace_period(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    pub fn build_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.build
                .as_ref()
                .and_then(|b| b.timeout_secs)
                .unwrap_or(defaults.build_timeout_secs),
        )
    }

    /// Validate the service configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        match self.kind {
            ServiceKind::Local => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(format!(
                        "Service '{}': local service requires 'command' field",
                        name
                    ));
                }
                if let Err(e) = self.argv() {
                    return Err(format!("Service '{}': {}", name, e));
                }
            }
            ServiceKind::Docker => {
                if self.image.is_none() {
                    return Err(format!(
                        "Service '{}': Docker service requires 'image' field",
                        name
                    ));
                }
            }
        }

        if self.port == 0 {
            return Err(format!(
                "Service '{}': 'port' must be greater than 0",
                name
            ));
        }

        if let Some(ref build) = self.build {
            if let Some(ref command) = build.command {
                if let Err(e) = command_argv(command, &build.args) {
                    return Err(format!("Service '{}': invalid build command: {}", name, e));
                }
            }
            match (&build.command, &build.context) {
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "Service '{}': build step takes either 'command' or 'context', not both",
                        name
                    ));
                }
                (None, None) => {
                    return Err(format!(
                        "Service '{}': build step requires 'command' or 'context'",
                        name
                    ));
                }
                (None, Some(_)) if self.image.is_none() => {
                    return Err(format!(
                        "Service '{}': Dockerfile build requires 'image' to tag the result",
                        name
                    ));
                }
                _ => {}
            }
        }

        if let ProbeConfig::Http { ref path } = self.readiness {
            if !path.starts_with('/') {
                return Err(format!(
                    "Service '{}': readiness path '{}' must start with '/'",
                    name, path
                ));
            }
        }

        Ok(())
    }
}

/// Split `command` with shell quoting rules when `args` is empty, otherwise
/// use it verbatim as the program followed by `args`
pub fn command_argv(command: &str, args: &[String]) -> anyhow::Result<Vec<String>> {
    if command.trim().is_empty() {
        anyhow::bail!("command is empty");
    }

    let mut argv = if args.is_empty() {
        shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid command '{}': {}", command, e))?
    } else {
        vec![command.to_string()]
    };
    // A leading '#' reads as a comment and leaves nothing to execute
    if argv.is_empty() {
        anyhow::bail!("command '{}' has no program to run", command);
    }
    argv.extend(args.iter().cloned());
    Ok(argv)
}

/// A routing rule: requests whose path starts with `prefix` go to `service`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
}

/// A secret file declaration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SecretConfig {
    /// Path to a newline-delimited KEY=VALUE file
    pub file: String,
}

// Default value functions
fn default_gateway_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_service_name() -> String {
    "frontend".to_string()
}

fn default_service_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    50 // 50ms between connection attempts
}

fn default_connect_timeout() -> u64 {
    1000 // 1 second per connection attempt
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for upstream to respond
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_probe_interval() -> u64 {
    100 // 100ms
}

fn default_grace_delay() -> u64 {
    2000 // 2 seconds
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_build_timeout() -> u64 {
    600 // 10 minutes
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();

        for name in &names {
            if let Err(e) = self.services[*name].validate(name) {
                errors.push(e);
            }
        }

        // Secrets must be declared and consumed by at most one service
        let mut consumers: HashMap<&str, &str> = HashMap::new();
        for name in &names {
            for secret in &self.services[*name].secrets {
                if !self.secrets.contains_key(secret) {
                    errors.push(format!(
                        "Service '{}': references undeclared secret '{}'",
                        name, secret
                    ));
                } else if let Some(other) = consumers.insert(secret.as_str(), name.as_str()) {
                    if other != name.as_str() {
                        errors.push(format!(
                            "Secret '{}' is referenced by both '{}' and '{}'",
                            secret, other, name
                        ));
                    }
                }
            }
        }

        if self.gateway.connect_timeout_ms == 0 {
            errors.push("Gateway 'connect_timeout_ms' must be greater than 0".to_string());
        }
        if self.gateway.request_timeout_secs == 0 {
            errors.push("Gateway 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !self.services.is_empty() && !self.services.contains_key(&self.gateway.default_service) {
            errors.push(format!(
                "Gateway default service '{}' is not a configured service",
                self.gateway.default_service
            ));
        }

        let mut seen_prefixes = HashSet::new();
        for route in &self.routes {
            if let Err(e) = RouteTable::check_prefix(&route.prefix) {
                errors.push(e.to_string());
            }
            if !self.services.contains_key(&route.service) {
                errors.push(format!(
                    "Route '{}' targets unknown service '{}'",
                    route.prefix, route.service
                ));
            }
            if !seen_prefixes.insert(route.prefix.as_str()) {
                errors.push(format!("Route prefix '{}' is declared more than once", route.prefix));
            }
        }

        if let Err(e) = ServiceGraph::from_config(self) {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Upstream addresses keyed by service name
    pub fn upstreams(&self) -> HashMap<String, String> {
        self.services
            .iter()
            .map(|(name, service)| (name.clone(), service.upstream_addr()))
            .collect()
    }
}
