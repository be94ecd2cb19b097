//! Registry backed by the Cutover state store.
//!
//! Lets the CLI run a full release on one machine: `cutover push` records
//! an artifact, and the build stage resolves it through this registry.

use async_trait::async_trait;
use tracing::info;

use cutover_core::{ArtifactReference, Digest};
use cutover_state::StateStore;

use crate::client::{ArtifactRegistry, RegistryError};

#[derive(Clone)]
pub struct StoreRegistry {
    store: StateStore,
    /// Prefix for artifact locations, e.g. `localhost:5000`.
    host: String,
}

impl StoreRegistry {
    pub fn new(store: StateStore, host: &str) -> Self {
        Self {
            store,
            host: host.trim_end_matches('/').to_string(),
        }
    }

    /// Record `digest` under `repository:tag` and return its reference.
    pub fn push(
        &self,
        repository: &str,
        tag: &str,
        digest: Digest,
    ) -> Result<ArtifactReference, RegistryError> {
        let artifact = ArtifactReference {
            location: format!("{}/{repository}", self.host),
            digest,
            tag: tag.to_string(),
        };
        self.store
            .put_artifact(repository, &artifact)
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        info!(%repository, %tag, digest = %artifact.digest, "artifact pushed to local registry");
        Ok(artifact)
    }
}

#[async_trait]
impl ArtifactRegistry for StoreRegistry {
    async fn resolve_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ArtifactReference>, RegistryError> {
        self.store
            .get_artifact(repository, tag)
            .map_err(|e| RegistryError::Unavailable(e.to_string()))
    }

    async fn exists(&self, repository: &str, digest: &Digest) -> Result<bool, RegistryError> {
        self.store
            .find_artifact_by_digest(repository, digest)
            .map(|found| found.is_some())
            .map_err(|e| RegistryError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_resolve() {
        let store = StateStore::open_in_memory().unwrap();
        let registry = StoreRegistry::new(store, "localhost:5000/");
        let digest = Digest::parse("sha256:abc123").unwrap();

        let pushed = registry.push("app-dev", "abc1234", digest.clone()).unwrap();
        assert_eq!(pushed.location, "localhost:5000/app-dev");

        let found = registry.resolve_tag("app-dev", "abc1234").await.unwrap();
        assert_eq!(found, Some(pushed));
        assert!(registry.exists("app-dev", &digest).await.unwrap());
        assert!(!registry.exists("app-prod", &digest).await.unwrap());
    }
}
