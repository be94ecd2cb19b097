//! Cutover artifact registry client.
//!
//! Resolves a build tag to an immutable, content-addressed
//! [`ArtifactReference`](cutover_core::ArtifactReference) and checks that a
//! digest is pullable. Registries may be eventually consistent, so lookups
//! go through [`RegistryClient`], which retries misses with bounded
//! exponential backoff before failing with `ArtifactNotFound`.
//!
//! # Components
//!
//! - **`client`**: `ArtifactRegistry` trait and the retrying `RegistryClient`
//! - **`definitions`**: commit → tag derivation and the image definitions handoff file
//! - **`memory`**: in-process registry for tests
//! - **`local`**: registry backed by the state store, used by the CLI

pub mod client;
pub mod definitions;
pub mod local;
pub mod memory;

pub use client::{ArtifactRegistry, RegistryClient, RegistryError, RetryPolicy};
pub use definitions::{
    ImageDefinition, content_digest, image_tag_for_commit, parse_image_definitions,
    write_image_definitions,
};
pub use local::StoreRegistry;
pub use memory::InMemoryRegistry;
