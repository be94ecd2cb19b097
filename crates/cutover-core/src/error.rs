//! Error taxonomy shared by every stage of a release.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TestCase;

/// Result type alias for orchestrator operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors raised while driving a release.
#[derive(Debug, Clone, Error)]
pub enum DeployError {
    /// Bad or missing environment / task specification input.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown environment '{name}' (supported: {supported})")]
    UnknownEnvironment { name: String, supported: String },

    #[error("artifact {repository}:{reference} not found after {attempts} attempt(s)")]
    ArtifactNotFound {
        repository: String,
        reference: String,
        attempts: u32,
    },

    #[error("{failed} of {total} test case(s) failed")]
    TestFailure {
        failed: usize,
        total: usize,
        cases: Vec<TestCase>,
    },

    #[error("{service} did not converge on v{version} within {timeout_secs}s")]
    ConvergenceTimeout {
        service: String,
        version: u64,
        timeout_secs: u64,
    },

    #[error("rollout failed for {service}: {reason}")]
    RolloutFailure { service: String, reason: String },

    #[error("deployment already in progress for {service} (lease held by {owner})")]
    ConcurrentDeployment { service: String, owner: String },

    /// Rollback did not restore the service. Needs an operator.
    #[error("unrecoverable rollout for {service}: {reason}")]
    Unrecoverable { service: String, reason: String },

    #[error("platform error: {0}")]
    Platform(String),

    #[error("state store error: {0}")]
    State(String),
}

/// Serializable classification of a [`DeployError`], recorded on stage results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    UnknownEnvironment,
    ArtifactNotFound,
    TestFailure,
    ConvergenceTimeout,
    RolloutFailure,
    ConcurrentDeployment,
    Unrecoverable,
    Platform,
    State,
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Configuration(_) => ErrorKind::Configuration,
            DeployError::UnknownEnvironment { .. } => ErrorKind::UnknownEnvironment,
            DeployError::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            DeployError::TestFailure { .. } => ErrorKind::TestFailure,
            DeployError::ConvergenceTimeout { .. } => ErrorKind::ConvergenceTimeout,
            DeployError::RolloutFailure { .. } => ErrorKind::RolloutFailure,
            DeployError::ConcurrentDeployment { .. } => ErrorKind::ConcurrentDeployment,
            DeployError::Unrecoverable { .. } => ErrorKind::Unrecoverable,
            DeployError::Platform(_) => ErrorKind::Platform,
            DeployError::State(_) => ErrorKind::State,
        }
    }

    /// Test cases attached to a [`DeployError::TestFailure`], empty otherwise.
    pub fn test_cases(&self) -> &[TestCase] {
        match self {
            DeployError::TestFailure { cases, .. } => cases,
            _ => &[],
        }
    }
}

impl ErrorKind {
    /// Whether this failure needs a human before anything else is attempted.
    pub fn requires_operator(&self) -> bool {
        matches!(self, ErrorKind::Unrecoverable)
    }

    /// Whether a later automatic attempt could succeed without a config change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ArtifactNotFound | ErrorKind::Platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TestOutcome;

    #[test]
    fn kind_matches_variant() {
        let err = DeployError::ConcurrentDeployment {
            service: "dev/api".to_string(),
            owner: "run-1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ConcurrentDeployment);
        assert!(!err.kind().requires_operator());
        assert!(err.to_string().contains("run-1"));
    }

    #[test]
    fn only_unrecoverable_requires_operator() {
        let err = DeployError::Unrecoverable {
            service: "prod/api".to_string(),
            reason: "rollback did not converge".to_string(),
        };
        assert!(err.kind().requires_operator());
        assert!(!ErrorKind::ConvergenceTimeout.requires_operator());
    }

    #[test]
    fn test_failure_exposes_cases() {
        let err = DeployError::TestFailure {
            failed: 1,
            total: 2,
            cases: vec![TestCase {
                name: "test_health".to_string(),
                outcome: TestOutcome::Failed,
                message: Some("expected 200".to_string()),
            }],
        };
        assert_eq!(err.test_cases().len(), 1);
        assert_eq!(err.to_string(), "1 of 2 test case(s) failed");
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ArtifactNotFound).unwrap();
        assert_eq!(json, "\"artifact_not_found\"");
    }
}
