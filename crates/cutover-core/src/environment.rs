//! Environment resolution.
//!
//! Maps one of the supported environment names to the configuration
//! bundle a release needs: branch, scaling bounds, task defaults, target
//! identifiers and rollout policy. The resolver is built once per
//! pipeline invocation from a [`CutoverConfig`] and is read-only after.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{CutoverConfig, EnvironmentConfig, RolloutSettings};
use crate::error::{DeployError, DeployResult};
use crate::types::ServiceKey;

/// The closed set of environments a release can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentName {
    Dev,
    Staging,
    Prod,
}

impl EnvironmentName {
    pub const ALL: [EnvironmentName; 3] = [Self::Dev, Self::Staging, Self::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    fn supported() -> String {
        Self::ALL
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for EnvironmentName {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| DeployError::UnknownEnvironment {
                name: s.to_string(),
                supported: Self::supported(),
            })
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replica count and autoscaling thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBounds {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub cpu_target_percent: u32,
    pub memory_target_percent: u32,
}

/// Values used to build the first task specification of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefaults {
    pub family: String,
    pub container_name: String,
    pub app_env: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub port: u16,
    pub health_check_path: String,
    pub env: BTreeMap<String, String>,
    /// Environment variable name → secret reference.
    pub secrets: BTreeMap<String, String>,
}

/// Resolved configuration bundle for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: EnvironmentName,
    pub branch: String,
    pub region: String,
    pub cluster: String,
    pub service: String,
    pub repository: String,
    pub scaling: ScalingBounds,
    pub task: TaskDefaults,
    /// Override keys accepted at build time. Anything else is rejected.
    pub allowed_override_keys: BTreeSet<String>,
    pub rollout: RolloutSettings,
    pub history_limit: Option<usize>,
}

impl Environment {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.name, &self.cluster, &self.service)
    }

    fn from_config(
        name: EnvironmentName,
        env: &EnvironmentConfig,
        config: &CutoverConfig,
    ) -> DeployResult<Self> {
        let max_replicas = env.max_count.unwrap_or(env.desired_count.saturating_mul(3));
        if max_replicas < env.desired_count {
            return Err(DeployError::Configuration(format!(
                "{name}: max_count {max_replicas} is below desired_count {}",
                env.desired_count
            )));
        }
        for (field, value) in [
            ("branch", &env.branch),
            ("cluster", &env.cluster),
            ("service", &env.service),
            ("repository", &env.repository),
        ] {
            if value.trim().is_empty() {
                return Err(DeployError::Configuration(format!(
                    "{name}: `{field}` must not be empty"
                )));
            }
        }

        Ok(Self {
            name,
            branch: env.branch.clone(),
            region: env
                .region
                .clone()
                .unwrap_or_else(|| config.defaults.region.clone()),
            cluster: env.cluster.clone(),
            service: env.service.clone(),
            repository: env.repository.clone(),
            scaling: ScalingBounds {
                min_replicas: env.desired_count,
                max_replicas,
                cpu_target_percent: env.cpu_target_percent.unwrap_or(70),
                memory_target_percent: env.memory_target_percent.unwrap_or(80),
            },
            task: TaskDefaults {
                family: env.family.clone().unwrap_or_else(|| env.repository.clone()),
                container_name: env.container_name.clone().unwrap_or_else(|| "app".to_string()),
                app_env: env.app_env.clone().unwrap_or_else(|| name.to_string()),
                cpu: env.cpu,
                memory_mib: env.memory,
                port: env.port.unwrap_or(3000),
                health_check_path: env
                    .health_check_path
                    .clone()
                    .unwrap_or_else(|| "/healthcheck".to_string()),
                env: env.env.clone().unwrap_or_default(),
                secrets: env.secrets.clone().unwrap_or_default(),
            },
            allowed_override_keys: env
                .allowed_override_keys
                .iter()
                .flatten()
                .cloned()
                .collect(),
            rollout: env.rollout.clone().unwrap_or_else(|| config.rollout.clone()),
            history_limit: config.defaults.history_limit,
        })
    }
}

/// Looks up environments by name from a loaded configuration.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    environments: BTreeMap<EnvironmentName, Environment>,
}

impl EnvironmentResolver {
    /// Validate the configuration and build the lookup table.
    ///
    /// Environment tables outside the supported set are a configuration
    /// error, not silently ignored.
    pub fn from_config(config: &CutoverConfig) -> DeployResult<Self> {
        let mut environments = BTreeMap::new();
        for (raw, env) in &config.environments {
            let name = raw.parse::<EnvironmentName>().map_err(|_| {
                DeployError::Configuration(format!(
                    "environment table '{raw}' is not one of: {}",
                    EnvironmentName::supported()
                ))
            })?;
            environments.insert(name, Environment::from_config(name, env, config)?);
        }
        Ok(Self { environments })
    }

    /// Resolve an environment by name.
    pub fn resolve(&self, name: &str) -> DeployResult<Environment> {
        let parsed: EnvironmentName = name.parse()?;
        self.environments.get(&parsed).cloned().ok_or_else(|| {
            DeployError::Configuration(format!("environment '{parsed}' has no configuration"))
        })
    }

    /// Configured environment names, in declaration order of the closed set.
    pub fn names(&self) -> Vec<EnvironmentName> {
        self.environments.keys().copied().collect()
    }
}
