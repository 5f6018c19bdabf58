//! Supervisor integration tests with real child processes

use std::time::{Duration, Instant};

use tiergate::config::{BuildConfig, Config, ProbeConfig, SecretConfig, ServiceConfig};
use tiergate::supervisor::{ServiceState, Supervisor, SupervisorError};
use tokio::net::TcpListener;
use tokio::sync::watch;

fn sleeper(port: u16) -> ServiceConfig {
    let mut service = ServiceConfig::local("sleep 30", port).with_readiness(ProbeConfig::None);
    service.grace_delay_ms = Some(20);
    service.shutdown_grace_period_secs = Some(1);
    service
}

fn shell(script: &str, port: u16) -> ServiceConfig {
    let mut service = ServiceConfig::local("sh", port).with_args(vec!["-c".to_string(), script.to_string()]);
    service.shutdown_grace_period_secs = Some(1);
    service
}

fn build_step(script: &str) -> BuildConfig {
    BuildConfig {
        command: Some("sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    }
}

fn config_with(services: Vec<(&str, ServiceConfig)>) -> Config {
    let mut config: Config = toml::from_str("").unwrap();
    for (name, service) in services {
        config.services.insert(name.to_string(), service);
    }
    config
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_gateway_starts_after_frontend_and_backend() {
    let mut backend = sleeper(18101);
    backend.grace_delay_ms = Some(300);
    let config = config_with(vec![
        ("backend", backend),
        ("frontend", sleeper(18102)),
        ("gateway", sleeper(18100).with_depends_on(&["frontend", "backend"])),
    ]);

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.up().await.unwrap();

    let started = supervisor.started();
    assert_eq!(started.len(), 3);
    assert_eq!(started.last().map(String::as_str), Some("gateway"));
    for service in ["backend", "frontend", "gateway"] {
        assert_eq!(supervisor.state(service), Some(ServiceState::Ready));
    }

    supervisor.stop_all().await;
    for service in ["backend", "frontend", "gateway"] {
        assert_eq!(supervisor.state(service), Some(ServiceState::Stopped));
    }
}

#[tokio::test]
async fn test_dependent_waits_for_tcp_readiness() {
    let port = unused_port().await;
    let backend = ServiceConfig::local("sleep 30", port);
    let gateway = sleeper(18110).with_depends_on(&["backend"]);
    let supervisor = Supervisor::new(config_with(vec![("backend", backend), ("gateway", gateway)])).unwrap();

    // The port only starts accepting after a while
    let binder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        TcpListener::bind(("127.0.0.1", port)).await.unwrap()
    });

    let start = Instant::now();
    supervisor.up().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(supervisor.started(), vec!["backend".to_string(), "gateway".to_string()]);

    let _listener = binder.await.unwrap();
    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_missing_secret_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(vec![
        ("frontend", sleeper(18121)),
        ("backend", sleeper(18122).with_secrets(&["backend_env"])),
        ("gateway", sleeper(18120).with_depends_on(&["frontend", "backend"])),
    ]);
    config.secrets.insert(
        "backend_env".to_string(),
        SecretConfig {
            file: dir.path().join("backend.env").to_string_lossy().to_string(),
        },
    );

    let supervisor = Supervisor::new(config).unwrap();
    let err = supervisor.up().await.unwrap_err();

    match err {
        SupervisorError::StartupFailed { ref service, ref reason } => {
            assert_eq!(service, "backend");
            assert!(reason.contains("not found"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }

    let started = supervisor.started();
    assert!(!started.contains(&"backend".to_string()));
    assert!(!started.contains(&"gateway".to_string()));
    assert_eq!(supervisor.state("backend"), Some(ServiceState::Failed));
    assert_eq!(supervisor.state("gateway"), Some(ServiceState::Pending));
    // Everything that did start has been stopped again
    assert_eq!(supervisor.state("frontend"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_build_failure_launches_nothing() {
    let mut backend = sleeper(18131);
    backend.build = Some(build_step("true"));
    let mut frontend = sleeper(18132);
    frontend.build = Some(build_step("echo compiling; exit 1"));

    let supervisor = Supervisor::new(config_with(vec![("backend", backend), ("frontend", frontend)])).unwrap();
    let err = supervisor.up().await.unwrap_err();

    assert!(matches!(err, SupervisorError::BuildFailed { ref service, .. } if service == "frontend"));
    assert!(supervisor.started().is_empty());
    assert_eq!(supervisor.state("frontend"), Some(ServiceState::Failed));
    assert_eq!(supervisor.state("backend"), Some(ServiceState::Built));
}

#[tokio::test]
async fn test_early_exit_is_reported() {
    let port = unused_port().await;
    let supervisor = Supervisor::new(config_with(vec![("backend", shell("exit 2", port))])).unwrap();

    let err = supervisor.up().await.unwrap_err();
    match err {
        SupervisorError::StartupFailed { ref service, ref reason } => {
            assert_eq!(service, "backend");
            assert!(reason.contains("exited"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_readiness_timeout() {
    let port = unused_port().await;
    let mut backend = ServiceConfig::local("sleep 30", port);
    backend.startup_timeout_secs = Some(1);
    backend.probe_interval_ms = Some(100);
    backend.shutdown_grace_period_secs = Some(1);

    let supervisor = Supervisor::new(config_with(vec![("backend", backend)])).unwrap();
    let err = supervisor.up().await.unwrap_err();

    match err {
        SupervisorError::StartupFailed { ref reason, .. } => {
            assert!(reason.contains("not ready within 1s"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(supervisor.state("backend"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_wait_for_exit_reports_crashed_service() {
    let mut worker = shell("sleep 1; exit 4", 18140).with_readiness(ProbeConfig::None);
    worker.grace_delay_ms = Some(20);
    let supervisor = Supervisor::new(config_with(vec![("worker", worker)])).unwrap();
    supervisor.up().await.unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), supervisor.wait_for_exit(shutdown_rx))
        .await
        .expect("exit detected");

    match result {
        Err(SupervisorError::Exited { service, status }) => {
            assert_eq!(service, "worker");
            assert!(status.contains('4'), "status: {}", status);
        }
        other => panic!("unexpected result: {:?}", other.map_err(|e| e.to_string())),
    }
    assert_eq!(supervisor.state("worker"), Some(ServiceState::Failed));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_wait_for_exit_returns_on_shutdown() {
    let supervisor = Supervisor::new(config_with(vec![("frontend", sleeper(18150))])).unwrap();
    supervisor.up().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(true);
    });

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_exit(shutdown_rx))
        .await
        .expect("shutdown observed");
    assert!(result.is_ok());

    let start = Instant::now();
    supervisor.stop_all().await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(supervisor.state("frontend"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_comment_only_command_fails_startup() {
    let service = ServiceConfig::local("#placeholder", 18160).with_readiness(ProbeConfig::None);
    let supervisor = Supervisor::new(config_with(vec![("backend", service)])).unwrap();

    let err = supervisor.up().await.unwrap_err();
    match err {
        SupervisorError::StartupFailed { ref service, ref reason } => {
            assert_eq!(service, "backend");
            assert!(reason.contains("no program to run"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(supervisor.started().is_empty());
}

#[tokio::test]
async fn test_comment_only_build_command_fails_build() {
    let mut frontend = sleeper(18161);
    frontend.build = Some(BuildConfig {
        command: Some("# npm run build".to_string()),
        ..Default::default()
    });

    let supervisor = Supervisor::new(config_with(vec![("frontend", frontend)])).unwrap();
    let err = supervisor.up().await.unwrap_err();

    assert!(matches!(err, SupervisorError::BuildFailed { ref service, .. } if service == "frontend"));
    assert!(supervisor.started().is_empty());
}
