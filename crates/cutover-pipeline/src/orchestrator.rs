//! Release orchestrator: one trigger in, one audited pipeline run out.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::sync::watch;
use tracing::{error, info};

use cutover_core::{
    DeployResult, EnvironmentResolver, PipelineRun, RegistrySettings, Trigger, epoch_millis,
};
use cutover_registry::{ArtifactRegistry, RegistryClient, RetryPolicy};
use cutover_rollout::{Platform, RolloutController};
use cutover_state::StateStore;
use cutover_taskdef::{EnvOverrides, EnvSecretStore, SecretStore};

use crate::context::PipelineContext;
use crate::runner::{StageDefinition, StageRunner};
use crate::stages::{BuildStage, DeployStage, NoopTestExecutor, SourceStage, TestExecutor, TestStage};

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Append-only destination for finished runs.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, run: &PipelineRun) -> DeployResult<()>;
}

#[async_trait]
impl AuditSink for StateStore {
    async fn record(&self, run: &PipelineRun) -> DeployResult<()> {
        Ok(self.append_pipeline_run(run)?)
    }
}

/// Wires the collaborators together and runs releases.
pub struct ReleaseOrchestrator {
    resolver: EnvironmentResolver,
    store: StateStore,
    platform: Arc<dyn Platform>,
    registry: Arc<dyn ArtifactRegistry>,
    retry: RetryPolicy,
    tests: Arc<dyn TestExecutor>,
    secrets: Arc<dyn SecretStore>,
    audit: Arc<dyn AuditSink>,
    definitions_dir: Option<PathBuf>,
}

impl ReleaseOrchestrator {
    /// Defaults: no tests, secrets from the process environment, runs
    /// audited to `store`.
    pub fn new(
        resolver: EnvironmentResolver,
        store: StateStore,
        platform: Arc<dyn Platform>,
        registry: Arc<dyn ArtifactRegistry>,
    ) -> Self {
        Self {
            resolver,
            audit: Arc::new(store.clone()),
            store,
            platform,
            registry,
            retry: RetryPolicy::default(),
            tests: Arc::new(NoopTestExecutor),
            secrets: Arc::new(EnvSecretStore),
            definitions_dir: None,
        }
    }

    pub fn with_registry_settings(mut self, settings: &RegistrySettings) -> Self {
        self.retry = RetryPolicy::from(settings);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tests(mut self, tests: Arc<dyn TestExecutor>) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_definitions_dir(mut self, dir: PathBuf) -> Self {
        self.definitions_dir = Some(dir);
        self
    }

    /// The stage list of a release, in execution order.
    pub fn stages(&self, cancel: watch::Receiver<bool>) -> Vec<StageDefinition> {
        let client = RegistryClient::new(self.registry.clone(), self.retry.clone());
        let mut build = BuildStage::new(client);
        if let Some(dir) = &self.definitions_dir {
            build = build.with_definitions_dir(dir.clone());
        }
        let controller = RolloutController::new(self.platform.clone(), self.store.clone());
        vec![
            StageDefinition::new("source", SourceStage),
            StageDefinition::new("build", build),
            StageDefinition::new("test", TestStage::new(self.tests.clone())),
            StageDefinition::new(
                "deploy",
                DeployStage::new(controller, self.store.clone(), self.secrets.clone(), cancel),
            ),
        ]
    }

    /// Run one release for `trigger`.
    ///
    /// An unknown or unconfigured environment fails before any stage runs
    /// and produces no run record.
    pub async fn execute(
        &self,
        trigger: Trigger,
        overrides: EnvOverrides,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<PipelineRun> {
        let environment = self.resolver.resolve(&trigger.environment)?;
        let run_id = run_id(&trigger);
        let mut ctx = PipelineContext::new(&run_id, trigger, environment).with_overrides(overrides);

        let run = StageRunner::run(&self.stages(cancel), &mut ctx).await;
        if let Err(e) = self.audit.record(&run).await {
            error!(run_id = %run.id, error = %e, "failed to record pipeline run");
            return Err(e);
        }
        info!(
            run_id = %run.id,
            service = %run.service,
            outcome = ?run.outcome,
            failed_stage = run.failed_stage().map(|s| s.name.as_str()).unwrap_or("-"),
            "release recorded"
        );
        Ok(run)
    }
}

/// Short unique run id derived from the trigger and the current time.
fn run_id(trigger: &Trigger) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trigger.environment.as_bytes());
    hasher.update(trigger.commit.as_bytes());
    hasher.update(epoch_millis().to_be_bytes());
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(RUN_SEQ.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hex::encode(&hasher.finalize()[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        let trigger = Trigger {
            environment: "dev".to_string(),
            commit: "abc1234".to_string(),
            branch: "develop".to_string(),
        };
        let a = run_id(&trigger);
        let b = run_id(&trigger);
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
