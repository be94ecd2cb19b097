//! Rollout controller: drives a [`Rollout`] against a [`Platform`].
//!
//! A [`DeploymentLease`] is held for a service from before its first
//! platform request until the outcome is known, including any rollback.
//! The last known-stable version is only ever updated after a rollout has
//! converged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cutover_core::{
    DeployError, DeployResult, ServiceKey, ServiceState, TaskSpecification, TaskVersion,
    epoch_millis,
};
use cutover_state::{LeaseAttempt, StateStore};

use crate::platform::{Platform, PlatformError, ServiceUpdate};
use crate::policy::RolloutPolicy;
use crate::rollout::{FailureCause, Rollout, RolloutKind, Step};

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

/// How an `apply` call ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloutOutcome {
    /// The new version converged and is now the stable version.
    Stable { version: TaskVersion },
    /// The new version failed and the previous stable version was restored.
    RolledBack {
        failed_version: TaskVersion,
        restored_version: TaskVersion,
        cause: FailureCause,
    },
    /// The new version failed and the service could not be restored.
    Unrecoverable {
        failed_version: TaskVersion,
        rollback_version: Option<TaskVersion>,
        reason: String,
    },
}

/// Exclusive right to change one service. Released on drop.
pub struct DeploymentLease {
    store: StateStore,
    service: ServiceKey,
    owner: String,
}

impl DeploymentLease {
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for DeploymentLease {
    fn drop(&mut self) {
        let key = &self.service;
        match self.store.release_lease(&key.table_key(), &self.owner) {
            Ok(true) => debug!(service = %key, "deployment lease released"),
            Ok(false) => warn!(service = %key, owner = %self.owner, "deployment lease was no longer held"),
            Err(e) => error!(service = %key, error = %e, "failed to release deployment lease"),
        }
    }
}

/// Applies task specifications to services.
#[derive(Clone)]
pub struct RolloutController {
    platform: Arc<dyn Platform>,
    store: StateStore,
    min_replicas: u32,
}

impl RolloutController {
    pub fn new(platform: Arc<dyn Platform>, store: StateStore) -> Self {
        Self {
            platform,
            store,
            min_replicas: 1,
        }
    }

    /// Replica count used when the platform reports a desired count of 0.
    pub fn with_min_replicas(mut self, min_replicas: u32) -> Self {
        self.min_replicas = min_replicas.max(1);
        self
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn desired_count(&self, service: &ServiceState) -> u32 {
        if service.desired_count == 0 {
            self.min_replicas
        } else {
            service.desired_count
        }
    }

    /// Take the deployment lease for `key`.
    ///
    /// Fails with `ConcurrentDeployment` while another owner holds an
    /// unexpired lease. The lease is released when the guard is dropped.
    pub fn acquire_lease(
        &self,
        key: &ServiceKey,
        policy: &RolloutPolicy,
    ) -> DeployResult<DeploymentLease> {
        let owner = lease_owner();
        let ttl_ms = u64::try_from(policy.lease_ttl.as_millis()).unwrap_or(u64::MAX);
        match self
            .store
            .try_acquire_lease(&key.table_key(), &owner, ttl_ms, epoch_millis())?
        {
            LeaseAttempt::Acquired(_) => {
                debug!(service = %key, %owner, "deployment lease acquired");
                Ok(DeploymentLease {
                    store: self.store.clone(),
                    service: key.clone(),
                    owner,
                })
            }
            LeaseAttempt::Held(held) => {
                warn!(service = %key, owner = %held.owner, "deployment already in progress");
                Err(DeployError::ConcurrentDeployment {
                    service: key.to_string(),
                    owner: held.owner,
                })
            }
        }
    }

    /// Roll `service` onto `spec`, rolling back on failure.
    ///
    /// Sending `true` on `cancel` fails the rollout and triggers the same
    /// rollback path as a timeout. Cancellation is not observed while
    /// rolling back.
    pub async fn apply(
        &self,
        service: &ServiceState,
        spec: &TaskSpecification,
        policy: &RolloutPolicy,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<RolloutOutcome> {
        policy.validate(self.desired_count(service))?;
        let lease = self.acquire_lease(&service.key, policy)?;
        self.apply_leased(&lease, service, spec, policy, cancel)
            .await
    }

    /// [`apply`](Self::apply) under a lease the caller already holds.
    ///
    /// A cancel that is already set when this is called fails it before
    /// anything is registered or requested.
    pub async fn apply_leased(
        &self,
        lease: &DeploymentLease,
        service: &ServiceState,
        spec: &TaskSpecification,
        policy: &RolloutPolicy,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<RolloutOutcome> {
        let key = &service.key;
        if lease.service != *key {
            return Err(DeployError::Configuration(format!(
                "lease is held for {}, not {key}",
                lease.service
            )));
        }
        let desired = self.desired_count(service);
        policy.validate(desired)?;
        if *cancel.borrow() {
            warn!(service = %key, version = spec.version, "cancelled before the update was requested");
            return Err(DeployError::RolloutFailure {
                service: key.to_string(),
                reason: format!("cancelled before v{} was requested", spec.version),
            });
        }

        let previous = self.rollback_target(service, spec)?;
        self.register(spec)?;

        info!(
            service = %key,
            family = %spec.family,
            version = spec.version,
            image = %spec.image,
            desired,
            previous = ?previous.as_ref().map(|s| s.version),
            "applying task specification"
        );

        self.request(key, spec, desired, policy)
            .await
            .map_err(|e| DeployError::Platform(format!("updating {key} to v{}: {e}", spec.version)))?;

        let mut rollout = Rollout::new(key, RolloutKind::Deploy, spec.version, desired, policy);
        let cause = match self
            .converge(&mut rollout, policy, Some(cancel))
            .await
        {
            Ok(()) => {
                self.store
                    .set_stable_version(key, &spec.family, spec.version)?;
                return Ok(RolloutOutcome::Stable {
                    version: spec.version,
                });
            }
            Err(cause) => cause,
        };

        self.roll_back(key, spec.version, previous, desired, policy, cause)
            .await
    }

    /// Re-apply the last known-stable specification, at most
    /// `rollback_attempts` times. Never rolls back a rollback.
    async fn roll_back(
        &self,
        key: &ServiceKey,
        failed_version: TaskVersion,
        previous: Option<TaskSpecification>,
        desired: u32,
        policy: &RolloutPolicy,
        cause: FailureCause,
    ) -> DeployResult<RolloutOutcome> {
        let Some(stable) = previous else {
            error!(service = %key, failed_version, %cause, "no known-stable version to roll back to");
            return Ok(RolloutOutcome::Unrecoverable {
                failed_version,
                rollback_version: None,
                reason: format!("{cause}; no known-stable version to restore"),
            });
        };
        if policy.rollback_attempts == 0 {
            error!(service = %key, failed_version, %cause, "rollback disabled");
            return Ok(RolloutOutcome::Unrecoverable {
                failed_version,
                rollback_version: Some(stable.version),
                reason: format!("{cause}; rollback disabled"),
            });
        }

        let mut last_error = String::new();
        for attempt in 1..=policy.rollback_attempts {
            warn!(
                service = %key,
                failed_version,
                restore_version = stable.version,
                attempt,
                "rolling back"
            );
            if let Err(e) = self.request(key, &stable, desired, policy).await {
                last_error = format!("re-applying v{}: {e}", stable.version);
                continue;
            }
            let mut rollout =
                Rollout::new(key, RolloutKind::Rollback, stable.version, desired, policy);
            match self.converge(&mut rollout, policy, None).await {
                Ok(()) => {
                    self.store
                        .set_stable_version(key, &stable.family, stable.version)?;
                    info!(service = %key, restored_version = stable.version, "rollback converged");
                    return Ok(RolloutOutcome::RolledBack {
                        failed_version,
                        restored_version: stable.version,
                        cause,
                    });
                }
                Err(rollback_cause) => last_error = rollback_cause.to_string(),
            }
        }

        error!(
            service = %key,
            failed_version,
            rollback_version = stable.version,
            error = %last_error,
            "rollback failed, operator intervention required"
        );
        Ok(RolloutOutcome::Unrecoverable {
            failed_version,
            rollback_version: Some(stable.version),
            reason: format!(
                "{cause}; rollback to v{} failed: {last_error}",
                stable.version
            ),
        })
    }

    /// The specification to restore if this rollout fails.
    ///
    /// Prefers the recorded stable version and falls back to the version
    /// the platform reports as active, when that one is in the history.
    fn rollback_target(
        &self,
        service: &ServiceState,
        spec: &TaskSpecification,
    ) -> DeployResult<Option<TaskSpecification>> {
        if let Some(stable) = self.store.get_stable_spec(&service.key)? {
            if stable.version != spec.version {
                return Ok(Some(stable));
            }
        }
        match service.active_version {
            Some(active) if active != spec.version => {
                Ok(self.store.get_task_spec(&spec.family, active)?)
            }
            _ => Ok(None),
        }
    }

    /// Register `spec` unless the identical version is already stored.
    fn register(&self, spec: &TaskSpecification) -> DeployResult<()> {
        match self.store.get_task_spec(&spec.family, spec.version)? {
            Some(stored) if stored == *spec => {
                debug!(family = %spec.family, version = spec.version, "task specification already registered");
                Ok(())
            }
            Some(_) => Err(DeployError::Configuration(format!(
                "{} v{} is already registered with different contents",
                spec.family, spec.version
            ))),
            None => Ok(self.store.register_task_spec(spec)?),
        }
    }

    async fn request(
        &self,
        key: &ServiceKey,
        spec: &TaskSpecification,
        desired: u32,
        policy: &RolloutPolicy,
    ) -> Result<(), PlatformError> {
        let update = ServiceUpdate {
            spec: spec.clone(),
            desired_count: desired,
            bounds: policy.bounds(desired),
        };
        self.platform.update_service(key, update).await
    }

    /// Poll until `rollout` reaches a terminal phase.
    async fn converge(
        &self,
        rollout: &mut Rollout,
        policy: &RolloutPolicy,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), FailureCause> {
        let key = rollout.service.clone();
        let mut delay = policy.poll_interval;
        rollout.start(Instant::now());

        loop {
            if cancel.as_mut().is_some_and(|rx| *rx.borrow_and_update()) {
                if let Step::Failed(cause) = rollout.cancel() {
                    return Err(cause);
                }
            }

            let step = match self.platform.describe_service(&key).await {
                Ok(state) => rollout.observe(&state, Instant::now()),
                Err(e) => {
                    warn!(service = %key, error = %e, "describe failed, will retry");
                    rollout.check_deadline(Instant::now()).unwrap_or(Step::Wait)
                }
            };
            match step {
                Step::Converged => return Ok(()),
                Step::Failed(cause) => return Err(cause),
                Step::Wait => {}
            }

            let now = Instant::now();
            let mut pause = delay.min(rollout.remaining(now));
            if let Some(grace) = rollout.remaining_grace(now) {
                pause = pause.min(grace);
            }

            let mut sender_gone = false;
            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        changed = rx.changed() => sender_gone = changed.is_err(),
                    }
                }
                None => tokio::time::sleep(pause).await,
            }
            if sender_gone {
                cancel = None;
            }
            delay = policy.next_poll_delay(delay);
        }
    }
}

/// A lease owner id unique to this process and call.
fn lease_owner() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        epoch_millis(),
        OWNER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}
