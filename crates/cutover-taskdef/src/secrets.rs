//! Secrets/parameter store collaborator.
//!
//! Task specifications only carry secret *references*. Before a new
//! specification is deployed, every reference is resolved once to prove it
//! exists; the value is dropped immediately and is never logged, persisted
//! or formatted.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use cutover_core::{DeployError, DeployResult, TaskSpecification};

/// A resolved secret. `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve a reference name. `Ok(None)` when no such secret exists.
    async fn resolve(&self, reference: &str) -> Result<Option<SecretValue>, SecretError>;
}

/// Resolve every secret reference of `spec`, failing on the first one that
/// does not exist.
pub async fn verify_secrets(store: &dyn SecretStore, spec: &TaskSpecification) -> DeployResult<()> {
    for (var, reference) in &spec.secrets {
        match store.resolve(reference).await {
            Ok(Some(_)) => debug!(%var, %reference, "secret reference resolved"),
            Ok(None) => {
                return Err(DeployError::Configuration(format!(
                    "secret reference '{reference}' for {var} could not be resolved"
                )));
            }
            Err(e) => {
                return Err(DeployError::Configuration(format!(
                    "secret reference '{reference}' for {var}: {e}"
                )));
            }
        }
    }
    Ok(())
}

/// Secrets held in memory.
#[derive(Default)]
pub struct InMemorySecretStore {
    values: HashMap<String, SecretValue>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: &str, value: &str) -> Self {
        self.values
            .insert(reference.to_string(), SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn resolve(&self, reference: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(self.values.get(reference).cloned())
    }
}

/// Reads secrets from process environment variables named
/// `CUTOVER_SECRET_<REFERENCE>`, with the reference upper-cased and every
/// non-alphanumeric character replaced by `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn variable_for(reference: &str) -> String {
        let normalized: String = reference
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("CUTOVER_SECRET_{normalized}")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, reference: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(std::env::var(Self::variable_for(reference))
            .ok()
            .map(SecretValue::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec_with_secret(reference: &str) -> TaskSpecification {
        TaskSpecification {
            family: "app-dev".to_string(),
            version: 1,
            container_name: "app".to_string(),
            image: "r/app@sha:01".to_string(),
            cpu: 256,
            memory_mib: 512,
            environment: BTreeMap::new(),
            secrets: BTreeMap::from([("DATABASE_URL".to_string(), reference.to_string())]),
            port_mappings: Vec::new(),
            health_check_path: None,
            created_at: 0,
        }
    }

    #[test]
    fn debug_is_redacted() {
        let value = SecretValue::new("hunter2");
        assert_eq!(format!("{value:?}"), "SecretValue(<redacted>)");
        assert_eq!(value.expose(), "hunter2");
    }

    #[test]
    fn env_variable_name_is_normalized() {
        assert_eq!(
            EnvSecretStore::variable_for("app/dev/database-url"),
            "CUTOVER_SECRET_APP_DEV_DATABASE_URL"
        );
    }

    #[tokio::test]
    async fn verify_passes_when_all_resolve() {
        let store = InMemorySecretStore::new().with("app/dev/db", "postgres://x");
        verify_secrets(&store, &spec_with_secret("app/dev/db"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_fails_without_leaking_value() {
        let store = InMemorySecretStore::new().with("other", "postgres://secret-password");
        let err = verify_secrets(&store, &spec_with_secret("app/dev/db"))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("app/dev/db"));
        assert!(!msg.contains("secret-password"));
    }
}
