//! Pipeline run records.
//!
//! A [`PipelineRun`] is the append-only audit record of one release
//! attempt: the trigger that started it, one [`StageResult`] per declared
//! stage, and the overall outcome.

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, ErrorKind};
use crate::types::{ArtifactReference, ServiceKey, TestCase};

/// Build trigger delivered by source control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Environment name as received, not yet validated.
    pub environment: String,
    pub commit: String,
    pub branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
}

/// Structured failure detail carried by a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_cases: Vec<TestCase>,
    pub requires_operator: bool,
}

impl From<&DeployError> for StageError {
    fn from(err: &DeployError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            test_cases: err.test_cases().to_vec(),
            requires_operator: err.kind().requires_operator(),
        }
    }
}

/// Result of executing (or skipping) one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub outcome: StageOutcome,
    pub artifacts: Vec<ArtifactReference>,
    pub duration_ms: u64,
    pub error: Option<StageError>,
}

impl StageResult {
    pub fn success(name: &str, artifacts: Vec<ArtifactReference>, duration_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            outcome: StageOutcome::Success,
            artifacts,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(name: &str, error: StageError, duration_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            outcome: StageOutcome::Failure,
            artifacts: Vec::new(),
            duration_ms,
            error: Some(error),
        }
    }

    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: StageOutcome::Skipped,
            artifacts: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }
}

/// One release attempt for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub trigger: Trigger,
    pub service: ServiceKey,
    pub stages: Vec<StageResult>,
    pub outcome: RunOutcome,
    /// Unix milliseconds.
    pub started_at: u64,
    pub finished_at: u64,
}

impl PipelineRun {
    /// Composite store key: `{service}#{started_at}#{id}`, sortable by start time.
    pub fn table_key(&self) -> String {
        format!("{}#{:020}#{}", self.service.table_key(), self.started_at, self.id)
    }

    /// The first failed stage, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| s.outcome == StageOutcome::Failure)
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

impl RunOutcome {
    /// `Failure` iff any stage failed.
    pub fn from_stages(stages: &[StageResult]) -> Self {
        if stages.iter().any(|s| s.outcome == StageOutcome::Failure) {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        }
    }
}
