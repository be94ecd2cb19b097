//! cutover-state: embedded state store for Cutover.
//!
//! Backed by [redb](https://docs.rs/redb), holds everything the orchestrator
//! must share between runs: task specification history, the last
//! known-stable version per service, deployment leases, the pipeline run
//! audit log, and the records behind the local platform and registry.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{family}:{version}`, `{service}#{started_at}#{id}`)
//! keep related records adjacent and sorted.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every check-and-set operation
//! (lease acquisition, version registration) runs inside a single write
//! transaction, which redb serializes.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
