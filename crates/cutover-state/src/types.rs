//! Record types owned by the state store.
//!
//! Shared domain types (task specifications, pipeline runs, service state)
//! live in `cutover-core`; these are the store's own bookkeeping records.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use cutover_core::{ServiceState, TaskSpecification, TaskVersion};

// ── Leases ────────────────────────────────────────────────────────

/// Time-bounded exclusive claim on deploying one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Service key the lease guards.
    pub key: String,
    pub owner: String,
    /// Unix milliseconds.
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    /// The caller now holds the lease.
    Acquired(Lease),
    /// Another owner holds an unexpired lease.
    Held(Lease),
}

// ── Stable versions ───────────────────────────────────────────────

/// The version a service last converged on, used as the rollback target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableRecord {
    pub family: String,
    pub version: TaskVersion,
    /// Unix seconds.
    pub recorded_at: u64,
}

// ── Local platform ────────────────────────────────────────────────

/// Persisted state of a service run by the local platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalServiceRecord {
    pub state: ServiceState,
    /// Specification the service is rolling toward.
    pub target_spec: Option<TaskSpecification>,
    /// Lower bound on healthy replicas while replacing.
    pub min_healthy: u32,
    /// Upper bound on running replicas while replacing.
    pub max_running: u32,
    /// Versions whose replicas crash on start.
    #[serde(default)]
    pub crashing_versions: BTreeSet<TaskVersion>,
    /// Crash restarts observed for the current target.
    #[serde(default)]
    pub restarts: u32,
}
