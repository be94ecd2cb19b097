//! Task definition builder.
//!
//! `build` is a pure function of its inputs: the current specification,
//! the new artifact, the overrides, the latest version known to the
//! history store and the supplied creation timestamp. It never mutates
//! the current specification.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use cutover_core::{
    ArtifactReference, DeployError, DeployResult, Environment, PortMapping, Protocol,
    TaskSpecification, TaskVersion,
};

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Environment-variable overrides applied on top of the task's variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides(BTreeMap<String, String>);

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Check every key is a valid variable name inside the environment's
    /// override namespace.
    pub fn validate(&self, env: &Environment) -> DeployResult<()> {
        let mut unknown = Vec::new();
        for key in self.0.keys() {
            if !ENV_KEY_RE.is_match(key) {
                return Err(DeployError::Configuration(format!(
                    "override key '{key}' is not a valid environment variable name"
                )));
            }
            if !env.allowed_override_keys.contains(key) {
                unknown.push(key.as_str());
            }
        }
        if !unknown.is_empty() {
            return Err(DeployError::Configuration(format!(
                "override key(s) not allowed in {}: {}",
                env.name,
                unknown.join(", ")
            )));
        }
        Ok(())
    }
}

impl From<BTreeMap<String, String>> for EnvOverrides {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for EnvOverrides {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds the next task specification version for one environment.
pub struct TaskDefinitionBuilder<'a> {
    env: &'a Environment,
    latest_version: Option<TaskVersion>,
    created_at: u64,
}

impl<'a> TaskDefinitionBuilder<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self {
            env,
            latest_version: None,
            created_at: 0,
        }
    }

    /// Highest version already present in the history store. The built
    /// version is always greater, even if the current one was rolled back.
    pub fn with_latest_version(mut self, latest: Option<TaskVersion>) -> Self {
        self.latest_version = latest;
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build the next specification.
    pub fn build(
        &self,
        current: Option<&TaskSpecification>,
        artifact: &ArtifactReference,
        overrides: &EnvOverrides,
    ) -> DeployResult<TaskSpecification> {
        overrides.validate(self.env)?;

        let mut spec = match current {
            Some(current) => current.clone(),
            None => self.initial_spec(),
        };

        if artifact.location.trim().is_empty() {
            return Err(DeployError::Configuration(
                "artifact has no registry location; image reference cannot be resolved".to_string(),
            ));
        }
        spec.image = artifact.image_uri();

        for (key, value) in overrides.iter() {
            if spec.secrets.contains_key(key) {
                return Err(DeployError::Configuration(format!(
                    "override '{key}' collides with a secret of the same name"
                )));
            }
            spec.environment.insert(key.clone(), value.clone());
        }

        let base = current.map(|c| c.version).max(self.latest_version).unwrap_or(0);
        spec.version = base + 1;
        spec.created_at = self.created_at;

        validate_required(&spec)?;
        debug!(
            family = %spec.family,
            version = spec.version,
            image = %spec.image,
            overrides = overrides.iter().count(),
            "task specification built"
        );
        Ok(spec)
    }

    /// First-ever specification for the environment.
    fn initial_spec(&self) -> TaskSpecification {
        let task = &self.env.task;
        let mut environment = task.env.clone();
        environment.insert("APP_ENV".to_string(), task.app_env.clone());
        environment.insert("APP_NAME".to_string(), task.family.clone());
        environment.insert("APP_REGION".to_string(), self.env.region.clone());
        environment.insert("APP_PORT".to_string(), task.port.to_string());

        TaskSpecification {
            family: task.family.clone(),
            version: 0,
            container_name: task.container_name.clone(),
            image: String::new(),
            cpu: task.cpu,
            memory_mib: task.memory_mib,
            environment,
            secrets: task.secrets.clone(),
            port_mappings: vec![PortMapping {
                container_port: task.port,
                protocol: Protocol::Tcp,
                name: Some("http".to_string()),
            }],
            health_check_path: Some(task.health_check_path.clone()),
            created_at: 0,
        }
    }
}

fn validate_required(spec: &TaskSpecification) -> DeployResult<()> {
    let missing = [
        ("image", spec.image.is_empty()),
        ("container_name", spec.container_name.trim().is_empty()),
        ("cpu", spec.cpu == 0),
        ("memory", spec.memory_mib == 0),
    ];
    match missing.iter().find(|(_, bad)| *bad) {
        Some((field, _)) => Err(DeployError::Configuration(format!(
            "{} v{}: required field `{field}` could not be resolved",
            spec.family, spec.version
        ))),
        None => Ok(()),
    }
}
