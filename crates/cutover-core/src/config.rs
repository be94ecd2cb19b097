//! cutover.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::environment::EnvironmentName;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CutoverConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub rollout: RolloutSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Keyed by environment name. Only the supported set is accepted.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub region: String,
    /// Task specification versions kept per family. Unbounded when unset.
    pub history_limit: Option<usize>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            history_limit: None,
        }
    }
}

/// Rollout policy knobs, in whole seconds as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSettings {
    /// Replicas allowed above desired count during a rollout.
    pub max_surge: u32,
    /// Replicas allowed below desired count during a rollout.
    pub max_unavailable: u32,
    pub stabilization_timeout_secs: u64,
    /// Desired count must stay healthy this long before the rollout is stable.
    pub health_grace_period_secs: u64,
    pub poll_interval_secs: u64,
    pub max_poll_interval_secs: u64,
    /// Rollback re-apply attempts after a failed rollout.
    pub rollback_attempts: u32,
    pub lease_ttl_secs: u64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
            stabilization_timeout_secs: 600,
            health_grace_period_secs: 30,
            poll_interval_secs: 5,
            max_poll_interval_secs: 30,
            rollback_attempts: 1,
            lease_ttl_secs: 1800,
        }
    }
}

/// Retry behaviour for registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub branch: String,
    pub cluster: String,
    pub service: String,
    pub repository: String,
    /// Task family name. Defaults to the repository name.
    pub family: Option<String>,
    pub region: Option<String>,
    pub container_name: Option<String>,
    pub app_env: Option<String>,
    pub cpu: u32,
    pub memory: u32,
    pub desired_count: u32,
    /// Defaults to three times `desired_count`.
    pub max_count: Option<u32>,
    pub cpu_target_percent: Option<u32>,
    pub memory_target_percent: Option<u32>,
    pub port: Option<u16>,
    pub health_check_path: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub secrets: Option<BTreeMap<String, String>>,
    pub allowed_override_keys: Option<Vec<String>>,
    /// Replaces the global `[rollout]` table for this environment.
    pub rollout: Option<RolloutSettings>,
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CutoverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config with all three environments for the given app name.
    pub fn scaffold(app: &str) -> Self {
        let environments = EnvironmentName::ALL
            .iter()
            .map(|name| {
                let (branch, desired) = match name {
                    EnvironmentName::Dev => ("develop", 1),
                    EnvironmentName::Staging => ("staging", 1),
                    EnvironmentName::Prod => ("main", 2),
                };
                let env = EnvironmentConfig {
                    branch: branch.to_string(),
                    cluster: format!("{app}-cluster-{name}"),
                    service: format!("{app}-service-{name}"),
                    repository: format!("{app}-{name}"),
                    family: None,
                    region: None,
                    container_name: Some(app.to_string()),
                    app_env: Some(name.to_string()),
                    cpu: 256,
                    memory: 512,
                    desired_count: desired,
                    max_count: None,
                    cpu_target_percent: None,
                    memory_target_percent: None,
                    port: Some(3000),
                    health_check_path: Some("/healthcheck".to_string()),
                    env: None,
                    secrets: None,
                    allowed_override_keys: Some(vec!["LOG_LEVEL".to_string()]),
                    rollout: None,
                };
                (name.to_string(), env)
            })
            .collect();

        CutoverConfig {
            defaults: DefaultsConfig::default(),
            rollout: RolloutSettings::default(),
            registry: RegistrySettings::default(),
            environments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_roundtrips() {
        let config = CutoverConfig::scaffold("shop");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("shop-cluster-prod"));

        let back: CutoverConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.environments.len(), 3);
        assert_eq!(back.environments["prod"].desired_count, 2);
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[environments.dev]
branch = "develop"
cluster = "c"
service = "s"
repository = "r"
cpu = 256
memory = 512
desired_count = 1
"#;
        let config: CutoverConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.defaults.region, "us-east-1");
        assert_eq!(config.rollout, RolloutSettings::default());
        assert_eq!(config.registry.max_attempts, 5);
        assert!(config.environments["dev"].rollout.is_none());
    }

    #[test]
    fn test_partial_rollout_table_fills_defaults() {
        let toml_str = r#"
[rollout]
stabilization_timeout_secs = 120
"#;
        let config: CutoverConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rollout.stabilization_timeout_secs, 120);
        assert_eq!(config.rollout.max_surge, 1);
        assert_eq!(config.rollout.rollback_attempts, 1);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutover.toml");
        let text = CutoverConfig::scaffold("app").to_toml_string().unwrap();
        std::fs::write(&path, text).unwrap();

        let config = CutoverConfig::from_file(&path).unwrap();
        assert!(config.environments.contains_key("staging"));
    }
}
