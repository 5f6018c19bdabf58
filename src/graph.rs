//! Service dependency graph
//!
//! Built once from the topology. Unknown dependencies and cycles are rejected
//! at construction so the supervisor never waits on something that cannot
//! start.

use crate::config::Config;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },
    #[error("Service dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Directed acyclic graph of services and their dependencies
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    /// Dependencies of each service, sorted and deduplicated
    dependencies: BTreeMap<String, Vec<String>>,
    /// Services grouped by start wave; wave N depends only on waves < N
    waves: Vec<Vec<String>>,
}

impl ServiceGraph {
    pub fn new<I, S, D>(services: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let dependencies: BTreeMap<String, Vec<String>> = services
            .into_iter()
            .map(|(name, deps)| {
                let deps: BTreeSet<String> = deps.into_iter().map(Into::into).collect();
                (name.into(), deps.into_iter().collect())
            })
            .collect();

        for (service, deps) in &dependencies {
            if let Some(dependency) = deps.iter().find(|d| !dependencies.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    service: service.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let order = topological_order(&dependencies)?;

        // A service's wave is one past the deepest of its dependencies
        let mut wave_of: HashMap<&str, usize> = HashMap::new();
        for service in &order {
            let wave = dependencies[service]
                .iter()
                .map(|d| wave_of[d.as_str()] + 1)
                .max()
                .unwrap_or(0);
            wave_of.insert(service, wave);
        }

        let wave_count = wave_of.values().map(|w| w + 1).max().unwrap_or(0);
        let mut waves = vec![Vec::new(); wave_count];
        for (service, wave) in &wave_of {
            waves[*wave].push(service.to_string());
        }
        for wave in &mut waves {
            wave.sort();
        }

        Ok(Self { dependencies, waves })
    }

    pub fn from_config(config: &Config) -> Result<Self, GraphError> {
        Self::new(
            config
                .services
                .iter()
                .map(|(name, service)| (name.clone(), service.depends_on.clone())),
        )
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, service: &str) -> &[String] {
        self.dependencies
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Services that directly depend on `service`
    pub fn dependents(&self, service: &str) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == service))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Start waves: every service in a wave can start concurrently once all
    /// earlier waves are ready
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Flattened start order (wave by wave)
    pub fn start_order(&self) -> Vec<&str> {
        self.waves
            .iter()
            .flat_map(|wave| wave.iter().map(String::as_str))
            .collect()
    }
}

/// Depth-first topological sort, reporting the offending path on a cycle
fn topological_order(dependencies: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, GraphError> {
    let mut order = Vec::with_capacity(dependencies.len());
    let mut visited = BTreeSet::new();
    let mut path = Vec::new();

    for service in dependencies.keys() {
        visit(service, dependencies, &mut visited, &mut path, &mut order)?;
    }

    Ok(order)
}

fn visit(
    service: &str,
    dependencies: &BTreeMap<String, Vec<String>>,
    visited: &mut BTreeSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), GraphError> {
    if visited.contains(service) {
        return Ok(());
    }

    if let Some(start) = path.iter().position(|s| s == service) {
        let mut cycle = path[start..].to_vec();
        cycle.push(service.to_string());
        return Err(GraphError::Cycle(cycle));
    }

    path.push(service.to_string());
    for dep in &dependencies[service] {
        visit(dep, dependencies, visited, path, order)?;
    }
    path.pop();

    visited.insert(service.to_string());
    order.push(service.to_string());
    Ok(())
}
