//! Cutover pipeline: stage runner and release orchestrator.
//!
//! A release is a fixed sequence of stages (`source → build → test →
//! deploy`) run against a [`PipelineContext`]. The runner is fail-fast:
//! the first fatal failure marks every later stage as skipped. Each run
//! ends in exactly one [`PipelineRun`](cutover_core::PipelineRun) record,
//! handed to an [`AuditSink`].
//!
//! # Components
//!
//! - **`context`**: per-run state shared by the stages
//! - **`runner`**: `StageAction` trait, `StageDefinition`, `StageRunner`
//! - **`stages`**: built-in stages and the `TestExecutor` collaborator
//! - **`orchestrator`**: environment resolution, stage wiring, audit

pub mod context;
pub mod orchestrator;
pub mod runner;
pub mod stages;

pub use context::PipelineContext;
pub use orchestrator::{AuditSink, ReleaseOrchestrator};
pub use runner::{StageAction, StageDefinition, StageRunner};
pub use stages::{
    BuildStage, CommandTestExecutor, DeployStage, NoopTestExecutor, SourceStage, TestExecutor,
    TestStage,
};
