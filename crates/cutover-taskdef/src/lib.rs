//! Cutover task definition builder.
//!
//! Produces the next immutable [`TaskSpecification`](cutover_core::TaskSpecification)
//! for a service from its current specification (or the environment
//! defaults on a first deploy), a freshly built artifact, and a validated
//! set of environment-variable overrides.
//!
//! # Components
//!
//! - **`builder`**: `TaskDefinitionBuilder` and the `EnvOverrides` mapping
//! - **`secrets`**: `SecretStore` trait, redacted `SecretValue`, in-memory and env-var stores

pub mod builder;
pub mod secrets;

pub use builder::{EnvOverrides, TaskDefinitionBuilder};
pub use secrets::{EnvSecretStore, InMemorySecretStore, SecretError, SecretStore, SecretValue, verify_secrets};
