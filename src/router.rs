//! Path-prefix routing for the gateway
//!
//! Rules are kept sorted by descending prefix length so the first match is
//! always the most specific one. Paths that match no rule go to the default
//! service.

use crate::config::{GatewayConfig, RouteConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),
    #[error("Route prefix '{0}' is declared more than once")]
    DuplicatePrefix(String),
}

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    prefix: String,
    service: String,
}

impl Route {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Plain string prefix test; a path equal to the prefix matches
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// The service chosen for a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    /// Target service name
    pub service: &'a str,
    /// Matched prefix, or `None` when the default service was used
    pub prefix: Option<&'a str>,
}

/// Immutable routing table
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    default_service: String,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>, default_service: impl Into<String>) -> Result<Self, RouteError> {
        let mut routes = routes;
        for route in &routes {
            Self::check_prefix(&route.prefix)?;
        }

        // Longest prefix first; ties broken lexicographically so equal-length
        // prefixes keep a stable order
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });

        if let Some(pair) = routes.windows(2).find(|w| w[0].prefix == w[1].prefix) {
            return Err(RouteError::DuplicatePrefix(pair[0].prefix.clone()));
        }

        Ok(Self {
            routes,
            default_service: default_service.into(),
        })
    }

    pub fn from_config(gateway: &GatewayConfig, routes: &[RouteConfig]) -> Result<Self, RouteError> {
        let routes = routes
            .iter()
            .map(|r| Route::new(r.prefix.clone(), r.service.clone()))
            .collect();
        Self::new(routes, gateway.default_service.clone())
    }

    pub fn check_prefix(prefix: &str) -> Result<(), RouteError> {
        if !prefix.starts_with('/') {
            return Err(RouteError::InvalidPrefix(prefix.to_string()));
        }
        Ok(())
    }

    /// Pick the service for a request path
    pub fn resolve(&self, path: &str) -> RouteMatch<'_> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .map(|route| RouteMatch {
                service: &route.service,
                prefix: Some(&route.prefix),
            })
            .unwrap_or(RouteMatch {
                service: &self.default_service,
                prefix: None,
            })
    }

    /// Rules in evaluation order
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn default_service(&self) -> &str {
        &self.default_service
    }

    /// Every service the table can route to, default service included
    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<&str> = self.routes.iter().map(|r| r.service.as_str()).collect();
        services.push(&self.default_service);
        services.sort_unstable();
        services.dedup();
        services
    }
}
