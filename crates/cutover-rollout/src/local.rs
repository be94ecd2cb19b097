//! Local platform: a simulated container platform kept in the state store.
//!
//! Each `describe_service` call advances the simulation by one step:
//! replicas of the target version come up `max_running - min_healthy` at a
//! time (at least one), and the service turns stable once every desired
//! replica is healthy. Versions marked as crashing never become healthy.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use cutover_core::{ServiceKey, ServiceState, ServiceStatus, TaskVersion};
use cutover_state::{LocalServiceRecord, StateError, StateStore};

use crate::platform::{Platform, PlatformError, ServiceUpdate};

#[derive(Clone)]
pub struct LocalPlatform {
    store: StateStore,
    /// Report the rollout as failed after this many crash restarts.
    circuit_breaker: Option<u32>,
}

impl LocalPlatform {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            circuit_breaker: None,
        }
    }

    pub fn with_circuit_breaker(mut self, restarts: u32) -> Self {
        self.circuit_breaker = Some(restarts.max(1));
        self
    }

    /// Make replicas of `version` crash on start.
    pub fn crash_version(&self, key: &ServiceKey, version: TaskVersion) -> Result<(), StateError> {
        let mut record = self.load(key)?;
        record.crashing_versions.insert(version);
        self.store.put_service_record(&record)?;
        info!(service = %key, version, "version marked as crashing");
        Ok(())
    }

    /// Every service the local platform knows about.
    pub fn services(&self) -> Result<Vec<ServiceState>, StateError> {
        Ok(self
            .store
            .list_service_records()?
            .into_iter()
            .map(|r| r.state)
            .collect())
    }

    fn load(&self, key: &ServiceKey) -> Result<LocalServiceRecord, StateError> {
        Ok(self
            .store
            .get_service_record(key)?
            .unwrap_or_else(|| LocalServiceRecord {
                state: ServiceState::empty(key.clone()),
                target_spec: None,
                min_healthy: 0,
                max_running: 0,
                crashing_versions: Default::default(),
                restarts: 0,
            }))
    }

    fn advance(&self, record: &mut LocalServiceRecord) {
        let state = &mut record.state;
        let Some(target) = state.target_version else {
            return;
        };
        if state.status != ServiceStatus::InProgress {
            return;
        }

        if record.crashing_versions.contains(&target) {
            record.restarts += 1;
            state.healthy_count = 0;
            debug!(service = %state.key, version = target, restarts = record.restarts, "replica crashed on start");
            if let Some(limit) = self.circuit_breaker.filter(|l| record.restarts >= *l) {
                warn!(service = %state.key, version = target, limit, "circuit breaker tripped");
                state.status = ServiceStatus::Failed {
                    reason: format!("v{target} replicas crashed {} times", record.restarts),
                };
            }
            return;
        }

        let step = record
            .max_running
            .saturating_sub(record.min_healthy)
            .max(1);
        state.healthy_count = state
            .healthy_count
            .saturating_add(step)
            .min(state.desired_count);
        state.running_count = state.desired_count;
        if state.healthy_count >= state.desired_count {
            state.active_version = Some(target);
            state.status = ServiceStatus::Stable;
            info!(service = %state.key, version = target, healthy = state.healthy_count, "local service converged");
        }
    }
}

fn unavailable(e: StateError) -> PlatformError {
    PlatformError::Unavailable(e.to_string())
}

#[async_trait]
impl Platform for LocalPlatform {
    async fn describe_service(&self, key: &ServiceKey) -> Result<ServiceState, PlatformError> {
        let Some(mut record) = self.store.get_service_record(key).map_err(unavailable)? else {
            return Ok(ServiceState::empty(key.clone()));
        };
        self.advance(&mut record);
        self.store.put_service_record(&record).map_err(unavailable)?;
        Ok(record.state)
    }

    async fn update_service(
        &self,
        key: &ServiceKey,
        update: ServiceUpdate,
    ) -> Result<(), PlatformError> {
        if update.spec.image.is_empty() {
            return Err(PlatformError::Rejected("task specification has no image".to_string()));
        }
        let mut record = self.load(key).map_err(unavailable)?;
        let version = update.spec.version;
        let unchanged = record.state.active_version == Some(version)
            && !record.crashing_versions.contains(&version);

        record.min_healthy = update.bounds.min_healthy;
        record.max_running = update.bounds.max_running;
        record.restarts = 0;
        record.state.target_version = Some(version);
        record.state.desired_count = update.desired_count;
        if unchanged {
            record.state.healthy_count = update.desired_count;
            record.state.running_count = update.desired_count;
            record.state.status = ServiceStatus::Stable;
        } else {
            record.state.healthy_count = 0;
            record.state.status = ServiceStatus::InProgress;
        }
        record.target_spec = Some(update.spec);
        self.store.put_service_record(&record).map_err(unavailable)?;

        info!(
            service = %key,
            version,
            desired = update.desired_count,
            min_healthy = update.bounds.min_healthy,
            max_running = update.bounds.max_running,
            "local service updated"
        );
        Ok(())
    }
}
