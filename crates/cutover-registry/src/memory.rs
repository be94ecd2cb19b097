//! In-process registry, used by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use cutover_core::{ArtifactReference, Digest};

use crate::client::{ArtifactRegistry, RegistryError};

#[derive(Default)]
struct Inner {
    /// `(repository, tag)` → (artifact, lookups remaining before it is visible).
    tags: HashMap<(String, String), (ArtifactReference, u32)>,
    lookups: u32,
}

/// Registry held in memory. Cloning shares the same contents.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an artifact that is immediately visible.
    pub async fn push(&self, repository: &str, artifact: ArtifactReference) {
        self.push_eventually(repository, artifact, 0).await;
    }

    /// Push an artifact that only becomes visible after `hidden_lookups`
    /// tag lookups, mimicking an eventually consistent registry.
    pub async fn push_eventually(
        &self,
        repository: &str,
        artifact: ArtifactReference,
        hidden_lookups: u32,
    ) {
        let mut inner = self.inner.lock().await;
        inner.tags.insert(
            (repository.to_string(), artifact.tag.clone()),
            (artifact, hidden_lookups),
        );
    }

    /// Number of tag lookups served so far.
    pub async fn lookups(&self) -> u32 {
        self.inner.lock().await.lookups
    }
}

#[async_trait]
impl ArtifactRegistry for InMemoryRegistry {
    async fn resolve_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ArtifactReference>, RegistryError> {
        let mut inner = self.inner.lock().await;
        inner.lookups += 1;
        match inner
            .tags
            .get_mut(&(repository.to_string(), tag.to_string()))
        {
            Some((_, hidden)) if *hidden > 0 => {
                *hidden -= 1;
                Ok(None)
            }
            Some((artifact, _)) => Ok(Some(artifact.clone())),
            None => Ok(None),
        }
    }

    async fn exists(&self, repository: &str, digest: &Digest) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tags
            .iter()
            .any(|((repo, _), (artifact, hidden))| {
                repo == repository && &artifact.digest == digest && *hidden == 0
            }))
    }
}
