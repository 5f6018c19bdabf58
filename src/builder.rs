//! Build steps run before any service is launched
//!
//! Two strategies:
//! - Command: a local build command such as `npm run build`
//! - Dockerfile: `docker build` tagging the service's image
//!
//! Build steps see the service's configured `env` but never its secrets;
//! secrets are only merged into the environment at launch.

use crate::config::{command_argv, ServiceConfig, ServiceKind};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Where a line of child output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputSource {
    /// A build step
    Build,
    /// A running service
    Service,
}

/// Re-emit each line of a child's stdout or stderr as a tracing event
pub(crate) async fn forward_output<R>(service: String, stream: &'static str, source: OutputSource, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match source {
                OutputSource::Build => info!(target: "build", service = %service, stream, "{}", line),
                OutputSource::Service => info!(target: "service", service = %service, stream, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(service = %service, stream, error = %e, "Error reading child output");
                break;
            }
        }
    }
}

/// A build step resolved from a service's configuration
#[derive(Debug, Clone, PartialEq)]
pub enum BuildStep {
    /// Run a local command
    Command {
        argv: Vec<String>,
        working_dir: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },
    /// Build a Docker image from a context directory
    Dockerfile {
        context: PathBuf,
        dockerfile: PathBuf,
        image: String,
        build_args: BTreeMap<String, String>,
    },
}

impl BuildStep {
    /// The build step for a service, if it declares one
    pub fn for_service(config: &ServiceConfig) -> Result<Option<Self>> {
        let Some(build) = &config.build else {
            return Ok(None);
        };

        if let Some(command) = &build.command {
            // Local builds of a local service default to its working directory
            let working_dir = build.working_dir.clone().or_else(|| {
                (config.kind == ServiceKind::Local)
                    .then(|| config.working_dir.clone())
                    .flatten()
            });
            return Ok(Some(BuildStep::Command {
                argv: command_argv(command, &build.args).context("Invalid build command")?,
                working_dir: working_dir.map(PathBuf::from),
                env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }));
        }

        if let Some(context) = &build.context {
            let image = config
                .image
                .clone()
                .context("Dockerfile build requires 'image' to tag the result")?;
            let context = PathBuf::from(context);
            let dockerfile = context.join(build.dockerfile.as_deref().unwrap_or("Dockerfile"));
            return Ok(Some(BuildStep::Dockerfile {
                context,
                dockerfile,
                image,
                build_args: build.build_args.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }));
        }

        anyhow::bail!("build step requires 'command' or 'context'")
    }

    /// The command that performs this step
    pub fn command(&self) -> Command {
        match self {
            BuildStep::Command {
                argv,
                working_dir,
                env,
            } => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                if let Some(dir) = working_dir {
                    cmd.current_dir(dir);
                }
                cmd.envs(env);
                cmd
            }
            BuildStep::Dockerfile {
                context,
                dockerfile,
                image,
                build_args,
            } => {
                let mut cmd = Command::new("docker");
                cmd.arg("build").arg("-t").arg(image).arg("-f").arg(dockerfile);
                for (key, value) in build_args {
                    cmd.arg("--build-arg").arg(format!("{}={}", key, value));
                }
                cmd.arg(context);
                cmd
            }
        }
    }

    /// Run the step, streaming its output, and fail on a non-zero exit or
    /// when `timeout` elapses
    pub async fn run(&self, service: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        if let BuildStep::Dockerfile { context, dockerfile, .. } = self {
            if !context.exists() {
                anyhow::bail!("build context does not exist: {}", context.display());
            }
            if !dockerfile.exists() {
                anyhow::bail!("Dockerfile not found: {}", dockerfile.display());
            }
        }

        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(service, step = %self, "Building");
        debug!("Running: {:?}", cmd);

        let mut child = cmd.spawn().context("Failed to spawn build")?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(service.to_string(), "stdout", OutputSource::Build, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(service.to_string(), "stderr", OutputSource::Build, stderr));
        }

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.context("Failed to wait for build")?,
            Err(_) => {
                let _ = child.kill().await;
                error!(service, timeout_secs = timeout.as_secs(), "Build timed out");
                anyhow::bail!("build timed out after {}s", timeout.as_secs());
            }
        };

        let duration = start.elapsed();
        if !status.success() {
            let error_msg = match status.code() {
                Some(code) => format!("build exited with code {}", code),
                None => "build was terminated by a signal".to_string(),
            };
            error!(service, error = %error_msg, "Build failed");
            anyhow::bail!(error_msg);
        }

        info!(
            service,
            duration_secs = %format!("{:.1}", duration.as_secs_f64()),
            "Build completed successfully"
        );

        Ok(())
    }
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStep::Command { argv, .. } => write!(f, "{}", shell_words::join(argv)),
            BuildStep::Dockerfile { image, context, .. } => {
                write!(f, "docker build -t {} {}", image, context.display())
            }
        }
    }
}
