//! State handed from stage to stage within one run.

use std::path::PathBuf;

use cutover_core::{
    ArtifactReference, DeployError, DeployResult, Environment, TaskSpecification, TestReport,
    Trigger,
};
use cutover_rollout::RolloutOutcome;
use cutover_taskdef::EnvOverrides;

/// Everything the stages of one run read and produce.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub run_id: String,
    pub trigger: Trigger,
    pub environment: Environment,
    pub overrides: EnvOverrides,
    artifact: Option<ArtifactReference>,
    /// `imagedefinitions.json` written by the build stage.
    pub image_definitions: Option<PathBuf>,
    pub test_report: Option<TestReport>,
    /// Task specification built by the deploy stage.
    pub task_spec: Option<TaskSpecification>,
    pub rollout: Option<RolloutOutcome>,
}

impl PipelineContext {
    pub fn new(run_id: &str, trigger: Trigger, environment: Environment) -> Self {
        Self {
            run_id: run_id.to_string(),
            trigger,
            environment,
            overrides: EnvOverrides::new(),
            artifact: None,
            image_definitions: None,
            test_report: None,
            task_spec: None,
            rollout: None,
        }
    }

    pub fn with_overrides(mut self, overrides: EnvOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn artifact(&self) -> Option<&ArtifactReference> {
        self.artifact.as_ref()
    }

    /// The artifact of this run, or an error for stages that need one.
    pub fn require_artifact(&self) -> DeployResult<&ArtifactReference> {
        self.artifact.as_ref().ok_or_else(|| {
            DeployError::Configuration("no artifact has been built for this run".to_string())
        })
    }

    /// Record the run's artifact. An artifact is immutable once set.
    pub fn set_artifact(&mut self, artifact: ArtifactReference) -> DeployResult<()> {
        match &self.artifact {
            Some(existing) if *existing != artifact => Err(DeployError::Configuration(format!(
                "artifact already set to {}; refusing {}",
                existing.image_uri(),
                artifact.image_uri()
            ))),
            Some(_) => Ok(()),
            None => {
                self.artifact = Some(artifact);
                Ok(())
            }
        }
    }
}
