//! The container orchestration platform, as seen by the controller.
//!
//! The platform owns service state. The controller only asks it to change
//! the desired specification and reads back what it observes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cutover_core::{ServiceKey, ServiceState, TaskSpecification};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("platform rejected request: {0}")]
    Rejected(String),
}

/// Replica bounds the platform must respect while replacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeploymentBounds {
    pub min_healthy: u32,
    pub max_running: u32,
}

/// A request to move a service to a new desired specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub spec: TaskSpecification,
    pub desired_count: u32,
    pub bounds: DeploymentBounds,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Fresh observation of a service. Never cached by the caller.
    async fn describe_service(&self, key: &ServiceKey) -> Result<ServiceState, PlatformError>;

    /// Set the desired specification and replica count of a service.
    async fn update_service(&self, key: &ServiceKey, update: ServiceUpdate)
    -> Result<(), PlatformError>;
}

#[async_trait]
impl<T: Platform + ?Sized> Platform for Arc<T> {
    async fn describe_service(&self, key: &ServiceKey) -> Result<ServiceState, PlatformError> {
        (**self).describe_service(key).await
    }

    async fn update_service(
        &self,
        key: &ServiceKey,
        update: ServiceUpdate,
    ) -> Result<(), PlatformError> {
        (**self).update_service(key, update).await
    }
}
