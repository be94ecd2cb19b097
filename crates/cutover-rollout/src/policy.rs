//! Rollout policy: capacity bounds, timing, and poll backoff.

use std::time::Duration;

use cutover_core::{DeployError, DeployResult, RolloutSettings};

use crate::platform::DeploymentBounds;

/// How a rollout is allowed to progress.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RolloutPolicy {
    /// Replicas allowed above the desired count while replacing.
    pub max_surge: u32,
    /// Replicas allowed below the desired count while replacing.
    pub max_unavailable: u32,
    /// Give up on convergence after this long.
    pub stabilization_timeout: Duration,
    /// Desired count must stay healthy this long to count as stable.
    pub health_grace_period: Duration,
    /// First poll delay; doubles up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Re-apply attempts of the last known-stable version. Zero disables rollback.
    pub rollback_attempts: u32,
    pub lease_ttl: Duration,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self::from(&RolloutSettings::default())
    }
}

impl From<&RolloutSettings> for RolloutPolicy {
    fn from(s: &RolloutSettings) -> Self {
        Self {
            max_surge: s.max_surge,
            max_unavailable: s.max_unavailable,
            stabilization_timeout: Duration::from_secs(s.stabilization_timeout_secs),
            health_grace_period: Duration::from_secs(s.health_grace_period_secs),
            poll_interval: Duration::from_secs(s.poll_interval_secs),
            max_poll_interval: Duration::from_secs(s.max_poll_interval_secs),
            rollback_attempts: s.rollback_attempts,
            lease_ttl: Duration::from_secs(s.lease_ttl_secs),
        }
    }
}

impl RolloutPolicy {
    /// Reject policies that could never make progress for `desired` replicas.
    pub fn validate(&self, desired: u32) -> DeployResult<()> {
        if desired == 0 {
            return Err(DeployError::Configuration(
                "desired replica count must be at least 1".to_string(),
            ));
        }
        if self.max_surge == 0 && self.max_unavailable == 0 {
            return Err(DeployError::Configuration(
                "max_surge and max_unavailable cannot both be 0".to_string(),
            ));
        }
        if self.max_unavailable > desired {
            return Err(DeployError::Configuration(format!(
                "max_unavailable {} exceeds desired count {desired}",
                self.max_unavailable
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(DeployError::Configuration(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        // The lease must outlive the rollout plus every rollback attempt.
        let worst_case = self
            .stabilization_timeout
            .saturating_mul(1 + self.rollback_attempts);
        if self.lease_ttl < worst_case {
            return Err(DeployError::Configuration(format!(
                "lease_ttl {}s is shorter than the worst-case rollout {}s",
                self.lease_ttl.as_secs(),
                worst_case.as_secs()
            )));
        }
        Ok(())
    }

    /// Capacity bounds handed to the platform for `desired` replicas.
    pub fn bounds(&self, desired: u32) -> DeploymentBounds {
        DeploymentBounds {
            min_healthy: desired.saturating_sub(self.max_unavailable),
            max_running: desired.saturating_add(self.max_surge),
        }
    }

    /// Delay after a poll that waited `current`.
    pub fn next_poll_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(self.max_poll_interval.max(self.poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = RolloutPolicy::default();
        assert_eq!(policy.max_surge, 1);
        assert_eq!(policy.max_unavailable, 0);
        assert_eq!(policy.rollback_attempts, 1);
        policy.validate(2).unwrap();
    }

    #[test]
    fn bounds_never_drop_below_or_exceed() {
        let policy = RolloutPolicy {
            max_surge: 2,
            max_unavailable: 1,
            ..Default::default()
        };
        let b = policy.bounds(4);
        assert_eq!(b.min_healthy, 3);
        assert_eq!(b.max_running, 6);
    }

    #[test]
    fn zero_surge_and_unavailable_rejected() {
        let policy = RolloutPolicy {
            max_surge: 0,
            max_unavailable: 0,
            ..Default::default()
        };
        assert!(policy.validate(2).is_err());
    }

    #[test]
    fn unavailable_above_desired_rejected() {
        let policy = RolloutPolicy {
            max_unavailable: 3,
            ..Default::default()
        };
        assert!(policy.validate(2).is_err());
        assert!(policy.validate(3).is_ok());
    }

    #[test]
    fn short_lease_rejected() {
        let policy = RolloutPolicy {
            stabilization_timeout: Duration::from_secs(600),
            rollback_attempts: 1,
            lease_ttl: Duration::from_secs(900),
            ..Default::default()
        };
        assert!(policy.validate(1).is_err());
    }

    #[test]
    fn poll_delay_backs_off_to_cap() {
        let policy = RolloutPolicy {
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(policy.next_poll_delay(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(policy.next_poll_delay(Duration::from_secs(20)), Duration::from_secs(30));
        assert_eq!(policy.next_poll_delay(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[test]
    fn from_settings_converts_seconds() {
        let settings = RolloutSettings {
            stabilization_timeout_secs: 120,
            ..Default::default()
        };
        let policy = RolloutPolicy::from(&settings);
        assert_eq!(policy.stabilization_timeout, Duration::from_secs(120));
    }
}
