//! redb table definitions for the Cutover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Task specifications keyed by `{family}:{version:020}`.
pub const TASK_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_specs");

/// Last known-stable task version keyed by service key.
pub const STABLE_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("stable_versions");

/// Deployment leases keyed by service key.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Pipeline run records keyed by `{service}#{started_at:020}#{run_id}`.
pub const PIPELINE_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("pipeline_runs");

/// Local platform service records keyed by service key.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Local registry artifacts keyed by `{repository}:{tag}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");
