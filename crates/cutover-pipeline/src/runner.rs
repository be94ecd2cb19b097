//! Stage runner: executes declared stages in order, fail-fast.
//!
//! Every declared stage yields exactly one [`StageResult`]. After the
//! first fatal failure the remaining stages are recorded as skipped and
//! never executed. Completed stages are not undone.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use cutover_core::{
    ArtifactReference, DeployResult, PipelineRun, RunOutcome, StageError, StageResult, epoch_millis,
};

use crate::context::PipelineContext;

/// The work of one stage. Returns the artifacts the stage produced.
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn execute(&self, ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>>;
}

pub struct StageDefinition {
    pub name: String,
    /// A fatal failure skips every later stage.
    pub fatal: bool,
    action: Box<dyn StageAction>,
}

impl StageDefinition {
    pub fn new(name: &str, action: impl StageAction + 'static) -> Self {
        Self {
            name: name.to_string(),
            fatal: true,
            action: Box::new(action),
        }
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }
}

pub struct StageRunner;

impl StageRunner {
    /// Run `stages` against `ctx` and return the run record.
    pub async fn run(stages: &[StageDefinition], ctx: &mut PipelineContext) -> PipelineRun {
        let started_at = epoch_millis();
        let service = ctx.environment.service_key();
        info!(
            run_id = %ctx.run_id,
            environment = %ctx.environment.name,
            commit = %ctx.trigger.commit,
            stages = stages.len(),
            "pipeline run started"
        );

        let mut results = Vec::with_capacity(stages.len());
        let mut halted = false;
        for stage in stages {
            if halted {
                info!(run_id = %ctx.run_id, stage = %stage.name, "stage skipped");
                results.push(StageResult::skipped(&stage.name));
                continue;
            }

            info!(run_id = %ctx.run_id, stage = %stage.name, "stage started");
            let clock = Instant::now();
            let outcome = stage.action.execute(ctx).await;
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            let result = match outcome {
                Ok(artifacts) => {
                    info!(
                        run_id = %ctx.run_id,
                        stage = %stage.name,
                        duration_ms,
                        artifacts = artifacts.len(),
                        "stage succeeded"
                    );
                    StageResult::success(&stage.name, artifacts, duration_ms)
                }
                Err(err) => {
                    let detail = StageError::from(&err);
                    if stage.fatal {
                        halted = true;
                        error!(
                            run_id = %ctx.run_id,
                            stage = %stage.name,
                            kind = ?detail.kind,
                            requires_operator = detail.requires_operator,
                            error = %err,
                            "stage failed"
                        );
                    } else {
                        warn!(
                            run_id = %ctx.run_id,
                            stage = %stage.name,
                            kind = ?detail.kind,
                            error = %err,
                            "non-fatal stage failed, continuing"
                        );
                    }
                    StageResult::failure(&stage.name, detail, duration_ms)
                }
            };
            results.push(result);
        }

        let outcome = RunOutcome::from_stages(&results);
        let run = PipelineRun {
            id: ctx.run_id.clone(),
            trigger: ctx.trigger.clone(),
            service,
            stages: results,
            outcome,
            started_at,
            finished_at: epoch_millis(),
        };
        info!(run_id = %run.id, outcome = ?run.outcome, "pipeline run finished");
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use cutover_core::{
        CutoverConfig, DeployError, EnvironmentResolver, ErrorKind, StageOutcome, Trigger,
    };

    struct Counting {
        calls: Arc<AtomicU32>,
        fail_with: Option<DeployError>,
    }

    #[async_trait]
    impl StageAction for Counting {
        async fn execute(&self, _ctx: &mut PipelineContext) -> DeployResult<Vec<ArtifactReference>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(Vec::new()),
            }
        }
    }

    fn stage(name: &str, calls: &Arc<AtomicU32>, fail_with: Option<DeployError>) -> StageDefinition {
        StageDefinition::new(
            name,
            Counting {
                calls: calls.clone(),
                fail_with,
            },
        )
    }

    fn context() -> PipelineContext {
        let env = EnvironmentResolver::from_config(&CutoverConfig::scaffold("app"))
            .unwrap()
            .resolve("dev")
            .unwrap();
        let trigger = Trigger {
            environment: "dev".to_string(),
            commit: "abc1234".to_string(),
            branch: "develop".to_string(),
        };
        PipelineContext::new("run-1", trigger, env)
    }

    #[tokio::test]
    async fn all_stages_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let stages = vec![
            stage("source", &calls, None),
            stage("build", &calls, None),
            stage("test", &calls, None),
        ];
        let run = StageRunner::run(&stages, &mut context()).await;

        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.stages.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(run.finished_at >= run.started_at);
        assert_eq!(run.service.service, "app-service-dev");
    }

    #[tokio::test]
    async fn fatal_failure_skips_the_rest() {
        let names = ["source", "build", "test", "deploy"];
        for failing in 0..names.len() {
            let calls = Arc::new(AtomicU32::new(0));
            let stages: Vec<StageDefinition> = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let fail_with =
                        (i == failing).then(|| DeployError::Configuration("bad".into()));
                    stage(name, &calls, fail_with)
                })
                .collect();
            let run = StageRunner::run(&stages, &mut context()).await;

            assert_eq!(run.outcome, RunOutcome::Failure);
            assert_eq!(run.stages.len(), names.len());
            assert_eq!(calls.load(Ordering::SeqCst) as usize, failing + 1);
            for (i, result) in run.stages.iter().enumerate() {
                let expected = match i.cmp(&failing) {
                    std::cmp::Ordering::Less => StageOutcome::Success,
                    std::cmp::Ordering::Equal => StageOutcome::Failure,
                    std::cmp::Ordering::Greater => StageOutcome::Skipped,
                };
                assert_eq!(result.outcome, expected, "stage {i} with failure at {failing}");
            }
            let failed = run.failed_stage().unwrap();
            assert_eq!(failed.name, names[failing]);
            assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Configuration);
        }
    }

    #[tokio::test]
    async fn non_fatal_failure_continues_but_fails_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let stages = vec![
            stage("lint", &calls, Some(DeployError::Platform("flaky".into()))).non_fatal(),
            stage("build", &calls, None),
        ];
        let run = StageRunner::run(&stages, &mut context()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.stage("build").unwrap().outcome, StageOutcome::Success);
        assert_eq!(run.outcome, RunOutcome::Failure);
    }
}
