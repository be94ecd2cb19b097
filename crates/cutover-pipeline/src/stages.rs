//! Built-in stages: source → build → test → deploy.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cutover_core::{
    ArtifactReference, DeployError, DeployResult, Environment, ServiceKey, TaskSpecification,
    TestCase, TestOutcome, TestReport, epoch_secs,
};
use cutover_registry::{
    ArtifactRegistry, RegistryClient, image_tag_for_commit, parse_image_definitions,
    write_image_definitions,
};
use cutover_rollout::{FailureCause, RolloutController, RolloutOutcome, RolloutPolicy};
use cutover_state::StateStore;
use cutover_taskdef::{SecretStore, TaskDefinitionBuilder, verify_secrets};

use crate::context::PipelineContext;
use crate::runner::StageAction;

// ── Source ─────────────────────────────────────────────────────────

/// Accepts the trigger only for the branch the environment deploys from.
pub struct SourceStage;

#[async_trait]
impl StageAction for SourceStage {
    async fn execute(&self, ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>> {
        let expected = &ctx.environment.branch;
        if ctx.trigger.branch != *expected {
            return Err(DeployError::Configuration(format!(
                "{} deploys from branch '{expected}', trigger is for '{}'",
                ctx.environment.name, ctx.trigger.branch
            )));
        }
        debug!(branch = %expected, commit = %ctx.trigger.commit, "source accepted");
        Ok(Vec::new())
    }
}

// ── Build ──────────────────────────────────────────────────────────

/// Resolves the commit's image in the registry and pins it by digest.
pub struct BuildStage {
    registry: RegistryClient<Arc<dyn ArtifactRegistry>>,
    definitions_dir: Option<PathBuf>,
}

impl BuildStage {
    pub fn new(registry: RegistryClient<Arc<dyn ArtifactRegistry>>) -> Self {
        Self {
            registry,
            definitions_dir: None,
        }
    }

    /// Write `imagedefinitions.json` into `dir` after a successful build.
    pub fn with_definitions_dir(mut self, dir: PathBuf) -> Self {
        self.definitions_dir = Some(dir);
        self
    }
}

#[async_trait]
impl StageAction for BuildStage {
    async fn execute(&self, ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>> {
        let repository = ctx.environment.repository.clone();
        let tag = image_tag_for_commit(&ctx.trigger.commit);

        let artifact = self.registry.resolve(&repository, &tag).await?;
        self.registry.ensure_pullable(&repository, &artifact).await?;

        if let Some(dir) = &self.definitions_dir {
            let container = &ctx.environment.task.container_name;
            let path = write_image_definitions(dir, container, &artifact)?;
            let written = std::fs::read_to_string(&path).map_err(|e| {
                DeployError::Configuration(format!("cannot read {}: {e}", path.display()))
            })?;
            let uri = parse_image_definitions(&written, container)?;
            if uri != artifact.image_uri() {
                return Err(DeployError::Configuration(format!(
                    "image definitions disagree with the built artifact: {uri}"
                )));
            }
            debug!(path = %path.display(), "image definitions written");
            ctx.image_definitions = Some(path);
        }

        info!(image = %artifact.image_uri(), %tag, "artifact pinned");
        ctx.set_artifact(artifact.clone())?;
        Ok(vec![artifact])
    }
}

// ── Test ───────────────────────────────────────────────────────────

/// Runs the test suite against a built artifact.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn run(&self, env: &Environment, artifact: &ArtifactReference)
    -> DeployResult<TestReport>;
}

/// Reports an empty, passing suite.
pub struct NoopTestExecutor;

#[async_trait]
impl TestExecutor for NoopTestExecutor {
    async fn run(&self, env: &Environment, _artifact: &ArtifactReference) -> DeployResult<TestReport> {
        debug!(environment = %env.name, "no test command configured");
        Ok(TestReport::default())
    }
}

/// Runs an external command as a single test case.
///
/// The command sees `CUTOVER_IMAGE`, `CUTOVER_DIGEST` and
/// `CUTOVER_ENVIRONMENT`. A non-zero exit is a failed case carrying the
/// tail of stderr.
pub struct CommandTestExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandTestExecutor {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }

    /// Split a shell-like command line on whitespace.
    pub fn parse(command_line: &str) -> DeployResult<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            DeployError::Configuration("test command must not be empty".to_string())
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

const STDERR_TAIL: usize = 2048;

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    async fn run(&self, env: &Environment, artifact: &ArtifactReference) -> DeployResult<TestReport> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("CUTOVER_IMAGE", artifact.image_uri())
            .env("CUTOVER_DIGEST", artifact.digest.as_str())
            .env("CUTOVER_ENVIRONMENT", env.name.as_str())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DeployError::Configuration(format!("cannot run test command '{}': {e}", self.program))
            })?;

        let name = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let case = if output.status.success() {
            TestCase {
                name,
                outcome: TestOutcome::Passed,
                message: None,
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_TAIL)
                .map(|(i, _)| i)
                .unwrap_or(0);
            TestCase {
                name,
                outcome: TestOutcome::Failed,
                message: Some(format!("{}: {}", output.status, stderr[start..].trim())),
            }
        };
        Ok(TestReport { cases: vec![case] })
    }
}

pub struct TestStage {
    executor: Arc<dyn TestExecutor>,
}

impl TestStage {
    pub fn new(executor: Arc<dyn TestExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StageAction for TestStage {
    async fn execute(&self, ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>> {
        let artifact = ctx.require_artifact()?.clone();
        let report = self.executor.run(&ctx.environment, &artifact).await?;
        let total = report.cases.len();
        let failed: Vec<TestCase> = report.failed().cloned().collect();
        ctx.test_report = Some(report);

        if !failed.is_empty() {
            return Err(DeployError::TestFailure {
                failed: failed.len(),
                total,
                cases: failed,
            });
        }
        info!(cases = total, "tests passed");
        Ok(Vec::new())
    }
}

// ── Deploy ─────────────────────────────────────────────────────────

/// Builds the next task specification and rolls the service onto it.
pub struct DeployStage {
    controller: RolloutController,
    store: StateStore,
    secrets: Arc<dyn SecretStore>,
    cancel: watch::Receiver<bool>,
}

impl DeployStage {
    pub fn new(
        controller: RolloutController,
        store: StateStore,
        secrets: Arc<dyn SecretStore>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            controller,
            store,
            secrets,
            cancel,
        }
    }

    /// The specification the service runs now, if it is in the history.
    fn current_spec(&self, env: &Environment, active: Option<u64>) -> DeployResult<Option<TaskSpecification>> {
        let family = &env.task.family;
        if let Some(spec) = active
            .map(|v| self.store.get_task_spec(family, v))
            .transpose()?
            .flatten()
        {
            return Ok(Some(spec));
        }
        Ok(self.store.get_stable_spec(&env.service_key())?)
    }

    fn prune_history(&self, env: &Environment, key: &ServiceKey) -> DeployResult<()> {
        let Some(limit) = env.history_limit else {
            return Ok(());
        };
        let stable = self.store.get_stable_version(key)?.map(|r| r.version);
        let removed = self.store.prune_task_specs(&env.task.family, limit, stable)?;
        if removed > 0 {
            info!(family = %env.task.family, removed, limit, "task specification history pruned");
        }
        Ok(())
    }
}

#[async_trait]
impl StageAction for DeployStage {
    async fn execute(&self, ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>> {
        let env = ctx.environment.clone();
        let key = env.service_key();
        let artifact = ctx.require_artifact()?.clone();
        let policy = RolloutPolicy::from(&env.rollout);
        let controller = self
            .controller
            .clone()
            .with_min_replicas(env.scaling.min_replicas);

        let lease = controller.acquire_lease(&key, &policy)?;

        let state = controller
            .platform()
            .describe_service(&key)
            .await
            .map_err(|e| DeployError::Platform(format!("describing {key}: {e}")))?;

        let current = self.current_spec(&env, state.active_version)?;
        let latest = self.store.latest_task_version(&env.task.family)?;
        let spec = TaskDefinitionBuilder::new(&env)
            .with_latest_version(latest)
            .with_created_at(epoch_secs())
            .build(current.as_ref(), &artifact, &ctx.overrides)?;
        verify_secrets(self.secrets.as_ref(), &spec).await?;

        let outcome = controller
            .apply_leased(&lease, &state, &spec, &policy, self.cancel.clone())
            .await?;
        ctx.task_spec = Some(spec);
        ctx.rollout = Some(outcome.clone());

        if let Err(e) = self.prune_history(&env, &key) {
            warn!(service = %key, error = %e, "history pruning failed");
        }
        drop(lease);

        match outcome {
            RolloutOutcome::Stable { version } => {
                info!(service = %key, version, "deploy stable");
                Ok(vec![artifact])
            }
            RolloutOutcome::RolledBack {
                failed_version,
                cause: FailureCause::Timeout { .. },
                ..
            } => Err(DeployError::ConvergenceTimeout {
                service: key.to_string(),
                version: failed_version,
                timeout_secs: policy.stabilization_timeout.as_secs(),
            }),
            RolloutOutcome::RolledBack {
                failed_version,
                restored_version,
                cause,
            } => Err(DeployError::RolloutFailure {
                service: key.to_string(),
                reason: format!("v{failed_version} {cause}; restored v{restored_version}"),
            }),
            RolloutOutcome::Unrecoverable { reason, .. } => Err(DeployError::Unrecoverable {
                service: key.to_string(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::{CutoverConfig, Digest, EnvironmentResolver, Trigger};
    use cutover_registry::{InMemoryRegistry, RetryPolicy};
    use std::time::Duration;

    fn env(name: &str) -> Environment {
        EnvironmentResolver::from_config(&CutoverConfig::scaffold("app"))
            .unwrap()
            .resolve(name)
            .unwrap()
    }

    fn context(branch: &str) -> PipelineContext {
        let trigger = Trigger {
            environment: "dev".to_string(),
            commit: "abc1234def5678".to_string(),
            branch: branch.to_string(),
        };
        PipelineContext::new("run-1", trigger, env("dev"))
    }

    fn artifact() -> ArtifactReference {
        ArtifactReference {
            location: "registry.local/app-dev".to_string(),
            digest: Digest::parse("sha:abc123").unwrap(),
            tag: "abc1234".to_string(),
        }
    }

    fn client(registry: InMemoryRegistry) -> RegistryClient<Arc<dyn ArtifactRegistry>> {
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };
        RegistryClient::new(Arc::new(registry) as Arc<dyn ArtifactRegistry>, retry)
    }

    #[tokio::test]
    async fn source_rejects_wrong_branch() {
        let err = SourceStage.execute(&mut context("main")).await.unwrap_err();
        assert!(err.to_string().contains("develop"));
        SourceStage.execute(&mut context("develop")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn build_pins_artifact_and_writes_definitions() {
        let registry = InMemoryRegistry::new();
        registry.push("app-dev", artifact()).await;
        let dir = tempfile::tempdir().unwrap();
        let stage = BuildStage::new(client(registry)).with_definitions_dir(dir.path().to_path_buf());

        let mut ctx = context("develop");
        let produced = stage.execute(&mut ctx).await.unwrap();

        assert_eq!(produced, vec![artifact()]);
        assert_eq!(ctx.artifact(), Some(&artifact()));
        let written = std::fs::read_to_string(ctx.image_definitions.unwrap()).unwrap();
        assert!(written.contains("registry.local/app-dev@sha:abc123"));
    }

    #[tokio::test(start_paused = true)]
    async fn build_fails_when_tag_missing() {
        let stage = BuildStage::new(client(InMemoryRegistry::new()));
        let err = stage.execute(&mut context("develop")).await.unwrap_err();
        assert!(matches!(err, DeployError::ArtifactNotFound { attempts: 2, .. }));
    }

    struct FixedReport(TestReport);

    #[async_trait]
    impl TestExecutor for FixedReport {
        async fn run(&self, _: &Environment, _: &ArtifactReference) -> DeployResult<TestReport> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_failure_carries_cases() {
        let report = TestReport {
            cases: vec![
                TestCase {
                    name: "health".to_string(),
                    outcome: TestOutcome::Passed,
                    message: None,
                },
                TestCase {
                    name: "checkout".to_string(),
                    outcome: TestOutcome::Failed,
                    message: Some("expected 200, got 500".to_string()),
                },
            ],
        };
        let stage = TestStage::new(Arc::new(FixedReport(report)));
        let mut ctx = context("develop");
        ctx.set_artifact(artifact()).unwrap();

        let err = stage.execute(&mut ctx).await.unwrap_err();
        match err {
            DeployError::TestFailure { failed, total, cases } => {
                assert_eq!((failed, total), (1, 2));
                assert_eq!(cases[0].name, "checkout");
            }
            other => panic!("expected test failure, got {other:?}"),
        }
        assert_eq!(ctx.test_report.unwrap().cases.len(), 2);
    }

    #[tokio::test]
    async fn test_stage_needs_artifact() {
        let stage = TestStage::new(Arc::new(NoopTestExecutor));
        assert!(stage.execute(&mut context("develop")).await.is_err());
    }

    #[test]
    fn command_line_parses() {
        let exec = CommandTestExecutor::parse("  make  smoke-test ").unwrap();
        assert_eq!(exec.program, "make");
        assert_eq!(exec.args, vec!["smoke-test".to_string()]);
        assert!(CommandTestExecutor::parse("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_reports_exit_status() {
        let passing = CommandTestExecutor::new("true", &[]);
        let report = passing.run(&env("dev"), &artifact()).await.unwrap();
        assert!(report.passed());

        let failing = CommandTestExecutor::new("false", &[]);
        let report = failing.run(&env("dev"), &artifact()).await.unwrap();
        assert!(!report.passed());
        assert_eq!(report.cases[0].name, "false");
    }
}
