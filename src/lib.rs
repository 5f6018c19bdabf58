//! Tiergate - runs a three-tier web application behind a single public port
//!
//! This library provides:
//! - A gateway that routes requests to upstream services by longest path prefix
//! - Bounded connection retries and JSON error responses when an upstream is down
//! - A supervisor that builds every service, then launches them in dependency order
//! - Explicit readiness probes instead of fixed startup delays
//! - Fail-closed secret injection from KEY=VALUE files at launch time
//! - Local processes and Docker containers as services

pub mod app;
pub mod builder;
pub mod config;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod readiness;
pub mod router;
pub mod secrets;
pub mod supervisor;
pub mod upstream;

pub use app::run_up;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
