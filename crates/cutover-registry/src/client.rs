//! Registry trait and the retrying client the pipeline talks to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use cutover_core::{ArtifactReference, DeployError, DeployResult, Digest, RegistrySettings};

/// Transport-level registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached or answered with a transient error.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry rejected the request outright.
    #[error("invalid registry request: {0}")]
    Invalid(String),
}

/// An artifact/image registry.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Look up the artifact currently tagged `tag` in `repository`.
    async fn resolve_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ArtifactReference>, RegistryError>;

    /// Whether `digest` exists in `repository` and can be pulled.
    async fn exists(&self, repository: &str, digest: &Digest) -> Result<bool, RegistryError>;
}

#[async_trait]
impl<T: ArtifactRegistry + ?Sized> ArtifactRegistry for Arc<T> {
    async fn resolve_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ArtifactReference>, RegistryError> {
        (**self).resolve_tag(repository, tag).await
    }

    async fn exists(&self, repository: &str, digest: &Digest) -> Result<bool, RegistryError> {
        (**self).exists(repository, digest).await
    }
}

/// Bounded exponential backoff for registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RegistrySettings::default())
    }
}

impl From<&RegistrySettings> for RetryPolicy {
    fn from(s: &RegistrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }
}

/// Registry client with retry on misses and transient errors.
pub struct RegistryClient<R> {
    registry: R,
    retry: RetryPolicy,
}

impl<R: ArtifactRegistry> RegistryClient<R> {
    pub fn new(registry: R, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Resolve `tag` to an artifact, retrying until found or attempts run out.
    pub async fn resolve(&self, repository: &str, tag: &str) -> DeployResult<ArtifactReference> {
        for attempt in 1..=self.retry.max_attempts {
            match self.registry.resolve_tag(repository, tag).await {
                Ok(Some(artifact)) => {
                    info!(%repository, %tag, digest = %artifact.digest, attempt, "artifact resolved");
                    return Ok(artifact);
                }
                Ok(None) => debug!(%repository, %tag, attempt, "artifact not visible yet"),
                Err(RegistryError::Invalid(msg)) => return Err(DeployError::Configuration(msg)),
                Err(e) => warn!(%repository, %tag, attempt, error = %e, "registry lookup failed"),
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(DeployError::ArtifactNotFound {
            repository: repository.to_string(),
            reference: tag.to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    /// Confirm `artifact` is pullable before anything is deployed from it.
    pub async fn ensure_pullable(
        &self,
        repository: &str,
        artifact: &ArtifactReference,
    ) -> DeployResult<()> {
        for attempt in 1..=self.retry.max_attempts {
            match self.registry.exists(repository, &artifact.digest).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(%repository, digest = %artifact.digest, attempt, "digest not pullable yet"),
                Err(RegistryError::Invalid(msg)) => return Err(DeployError::Configuration(msg)),
                Err(e) => warn!(%repository, attempt, error = %e, "registry existence check failed"),
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(DeployError::ArtifactNotFound {
            repository: repository.to_string(),
            reference: artifact.digest.to_string(),
            attempts: self.retry.max_attempts,
        })
    }
}
