//! Cutover rollout controller: apply, converge, roll back.
//!
//! This crate moves a running service from one task specification version
//! to another. The controller requests the new version from the platform,
//! polls until every desired replica has been healthy on it for a grace
//! period, and re-applies the last known-stable version once if the
//! rollout fails, times out or is cancelled.
//!
//! # Components
//!
//! - **`policy`**: surge/unavailable bounds, timeouts, poll backoff
//! - **`platform`**: the container platform collaborator trait
//! - **`rollout`**: pure rollout state machine (observations in, steps out)
//! - **`controller`**: async driver: lease, request, poll, rollback
//! - **`local`**: simulated platform persisted in the state store

pub mod controller;
pub mod local;
pub mod platform;
pub mod policy;
pub mod rollout;

pub use controller::{DeploymentLease, RolloutController, RolloutOutcome};
pub use local::LocalPlatform;
pub use platform::{DeploymentBounds, Platform, PlatformError, ServiceUpdate};
pub use policy::RolloutPolicy;
pub use rollout::{FailureCause, Rollout, RolloutKind, RolloutPhase, Step};
