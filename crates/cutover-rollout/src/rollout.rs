//! Rollout state machine.
//!
//! A [`Rollout`] tracks one attempt to move a service onto one task
//! version: `Requested → Converging → {Stable, Failed}`. It holds no I/O;
//! the controller feeds it observations and timestamps and acts on the
//! [`Step`] it returns.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use cutover_core::{ServiceKey, ServiceState, ServiceStatus, TaskVersion};

use crate::policy::RolloutPolicy;

/// Why a rollout left `Converging` without becoming stable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// `stabilization_timeout` elapsed.
    Timeout { waited_secs: u64 },
    /// The platform itself declared the rollout failed.
    PlatformReported { reason: String },
    /// Cancelled by an operator.
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout { waited_secs } => {
                write!(f, "did not converge within {waited_secs}s")
            }
            FailureCause::PlatformReported { reason } => write!(f, "platform reported: {reason}"),
            FailureCause::Cancelled => f.write_str("cancelled by operator"),
        }
    }
}

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RolloutPhase {
    /// New version requested, not yet observed.
    Requested,
    /// Polling for convergence.
    Converging,
    /// Desired count healthy on the target version for the grace period.
    Stable,
    Failed { cause: FailureCause },
}

/// Whether this rollout moves forward or restores a previous version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RolloutKind {
    Deploy,
    Rollback,
}

/// What the controller should do after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Keep polling.
    Wait,
    Converged,
    Failed(FailureCause),
}

/// One attempt to converge a service on one version.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub service: ServiceKey,
    pub kind: RolloutKind,
    pub target_version: TaskVersion,
    pub desired_count: u32,
    pub phase: RolloutPhase,
    timeout: Duration,
    grace: Duration,
    started_at: Option<Instant>,
    healthy_since: Option<Instant>,
}

impl Rollout {
    pub fn new(
        service: &ServiceKey,
        kind: RolloutKind,
        target_version: TaskVersion,
        desired_count: u32,
        policy: &RolloutPolicy,
    ) -> Self {
        Self {
            service: service.clone(),
            kind,
            target_version,
            desired_count,
            phase: RolloutPhase::Requested,
            timeout: policy.stabilization_timeout,
            grace: policy.health_grace_period,
            started_at: None,
            healthy_since: None,
        }
    }

    /// Enter `Converging`. The timeout is measured from here.
    pub fn start(&mut self, now: Instant) {
        if self.phase == RolloutPhase::Requested {
            self.started_at = Some(now);
            self.phase = RolloutPhase::Converging;
            info!(
                service = %self.service,
                version = self.target_version,
                kind = ?self.kind,
                desired = self.desired_count,
                "rollout converging"
            );
        }
    }

    /// Feed one platform observation taken at `now`.
    pub fn observe(&mut self, state: &ServiceState, now: Instant) -> Step {
        match &self.phase {
            RolloutPhase::Requested => return Step::Wait,
            RolloutPhase::Stable => return Step::Converged,
            RolloutPhase::Failed { cause } => return Step::Failed(cause.clone()),
            RolloutPhase::Converging => {}
        }

        if let ServiceStatus::Failed { reason } = &state.status {
            return self.fail(FailureCause::PlatformReported {
                reason: reason.clone(),
            });
        }

        if state.is_converged_on(self.target_version, self.desired_count) {
            let since = *self.healthy_since.get_or_insert(now);
            if now.duration_since(since) >= self.grace {
                self.phase = RolloutPhase::Stable;
                info!(
                    service = %self.service,
                    version = self.target_version,
                    healthy = state.healthy_count,
                    desired = state.desired_count,
                    "rollout stable"
                );
                return Step::Converged;
            }
            debug!(
                service = %self.service,
                version = self.target_version,
                remaining_grace = ?self.grace.saturating_sub(now.duration_since(since)),
                "healthy, waiting out grace period"
            );
        } else {
            if self.healthy_since.take().is_some() {
                debug!(service = %self.service, "health lost during grace period");
            }
            debug!(
                service = %self.service,
                version = self.target_version,
                healthy = state.healthy_count,
                desired = state.desired_count.max(self.desired_count),
                "not converged yet"
            );
        }

        self.check_deadline(now).unwrap_or(Step::Wait)
    }

    /// Fail with a timeout once `stabilization_timeout` has elapsed.
    pub fn check_deadline(&mut self, now: Instant) -> Option<Step> {
        if self.phase != RolloutPhase::Converging {
            return None;
        }
        let elapsed = self.elapsed(now);
        (elapsed >= self.timeout).then(|| {
            self.fail(FailureCause::Timeout {
                waited_secs: elapsed.as_secs(),
            })
        })
    }

    /// Operator cancellation. Treated exactly like a failure.
    pub fn cancel(&mut self) -> Step {
        match &self.phase {
            RolloutPhase::Stable => Step::Converged,
            RolloutPhase::Failed { cause } => Step::Failed(cause.clone()),
            _ => self.fail(FailureCause::Cancelled),
        }
    }

    /// Time left before the timeout fires.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.timeout.saturating_sub(self.elapsed(now))
    }

    /// Time left in the grace period, if one is running.
    pub fn remaining_grace(&self, now: Instant) -> Option<Duration> {
        self.healthy_since
            .map(|since| self.grace.saturating_sub(now.duration_since(since)))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RolloutPhase::Stable | RolloutPhase::Failed { .. })
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.duration_since(start))
            .unwrap_or_default()
    }

    fn fail(&mut self, cause: FailureCause) -> Step {
        warn!(
            service = %self.service,
            version = self.target_version,
            kind = ?self.kind,
            %cause,
            "rollout failed"
        );
        self.phase = RolloutPhase::Failed {
            cause: cause.clone(),
        };
        Step::Failed(cause)
    }
}
