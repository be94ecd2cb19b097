//! Shared types used across Cutover crates.
//!
//! Everything here is serializable so it can be persisted in the state
//! store and attached to pipeline run records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentName;
use crate::error::DeployError;

/// Version number of a task specification within its family.
pub type TaskVersion = u64;

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[0-9a-f]+$").unwrap());

// ── Service identity ───────────────────────────────────────────────

/// Identifies one service in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub environment: EnvironmentName,
    pub cluster: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(environment: EnvironmentName, cluster: &str, service: &str) -> Self {
        Self {
            environment,
            cluster: cluster.to_string(),
            service: service.to_string(),
        }
    }

    /// Composite store key: `{environment}/{cluster}/{service}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.environment, self.cluster, self.service)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_key())
    }
}

// ── Artifacts ──────────────────────────────────────────────────────

/// Content digest of an artifact, `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self, DeployError> {
        if DIGEST_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(DeployError::Configuration(format!(
                "invalid digest '{s}', expected <algorithm>:<hex>"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm prefix, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }
}

impl FromStr for Digest {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DeployError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, content-addressed reference to one build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Registry location, e.g. `123.dkr.ecr.us-east-1.amazonaws.com/app-dev`.
    pub location: String,
    pub digest: Digest,
    /// Human tag the build was pushed under.
    pub tag: String,
}

impl ArtifactReference {
    /// Pull reference pinned to the digest (`location@digest`).
    pub fn image_uri(&self) -> String {
        format!("{}@{}", self.location, self.digest)
    }
}

// ── Task specifications ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A container port exposed by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub name: Option<String>,
}

/// Versioned, immutable description of how to run one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpecification {
    pub family: String,
    pub version: TaskVersion,
    pub container_name: String,
    pub image: String,
    /// CPU units (1024 = one vCPU).
    pub cpu: u32,
    pub memory_mib: u32,
    pub environment: BTreeMap<String, String>,
    /// Environment variable name → secret reference. Values are resolved
    /// by the platform at launch and never stored here.
    pub secrets: BTreeMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
    pub health_check_path: Option<String>,
    /// Unix timestamp (seconds) when this version was built.
    pub created_at: u64,
}

impl TaskSpecification {
    /// Composite store key: `{family}:{version}` with a zero-padded version
    /// so lexical order matches numeric order.
    pub fn table_key(&self) -> String {
        task_spec_key(&self.family, self.version)
    }
}

pub fn task_spec_key(family: &str, version: TaskVersion) -> String {
    format!("{family}:{version:020}")
}

// ── Service state ──────────────────────────────────────────────────

/// Platform-reported status of a service's current rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ServiceStatus {
    Stable,
    InProgress,
    Failed { reason: String },
}

/// Observed state of a running service. Owned by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub key: ServiceKey,
    /// Last version the platform confirmed as fully rolled out.
    pub active_version: Option<TaskVersion>,
    /// Version the platform is currently rolling toward.
    pub target_version: Option<TaskVersion>,
    pub desired_count: u32,
    pub running_count: u32,
    /// Healthy replicas running `target_version`.
    pub healthy_count: u32,
    pub status: ServiceStatus,
}

impl ServiceState {
    /// A service that has never been deployed.
    pub fn empty(key: ServiceKey) -> Self {
        Self {
            key,
            active_version: None,
            target_version: None,
            desired_count: 0,
            running_count: 0,
            healthy_count: 0,
            status: ServiceStatus::Stable,
        }
    }

    /// True when every desired replica is healthy on `version`.
    ///
    /// `required` is the replica count the caller asked for; the larger of
    /// it and the platform's desired count must be healthy.
    pub fn is_converged_on(&self, version: TaskVersion, required: u32) -> bool {
        let needed = self.desired_count.max(required);
        self.target_version == Some(version) && needed > 0 && self.healthy_count >= needed
    }
}

// ── Test reports ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

/// One test case result, in unit-test-report shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub outcome: TestOutcome,
    pub message: Option<String>,
}

/// Structured result of running the test suite against an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub cases: Vec<TestCase>,
}

impl TestReport {
    pub fn failed(&self) -> impl Iterator<Item = &TestCase> {
        self.cases
            .iter()
            .filter(|c| c.outcome == TestOutcome::Failed)
    }

    pub fn passed(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Current wall-clock time as Unix seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current wall-clock time as Unix milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new(EnvironmentName::Dev, "cluster-dev", "api")
    }

    #[test]
    fn digest_accepts_algorithm_and_hex() {
        assert!(Digest::parse("sha256:abc123").is_ok());
        assert!(Digest::parse("sha:abc123").is_ok());
        assert_eq!(Digest::parse("sha256:ff").unwrap().algorithm(), "sha256");
    }

    #[test]
    fn digest_rejects_malformed() {
        assert!(Digest::parse("abc123").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("sha256:XYZ").is_err());
    }

    #[test]
    fn digest_deserialization_validates() {
        let bad: Result<Digest, _> = serde_json::from_str("\"latest\"");
        assert!(bad.is_err());
        let good: Digest = serde_json::from_str("\"sha256:0a\"").unwrap();
        assert_eq!(good.as_str(), "sha256:0a");
    }

    #[test]
    fn image_uri_pins_digest() {
        let artifact = ArtifactReference {
            location: "registry.local/app-dev".to_string(),
            digest: Digest::parse("sha:abc123").unwrap(),
            tag: "abc1234".to_string(),
        };
        assert_eq!(artifact.image_uri(), "registry.local/app-dev@sha:abc123");
    }

    #[test]
    fn task_spec_keys_sort_numerically() {
        assert!(task_spec_key("app", 9) < task_spec_key("app", 10));
    }

    #[test]
    fn service_key_display() {
        assert_eq!(key().to_string(), "dev/cluster-dev/api");
    }

    #[test]
    fn converged_requires_full_healthy_count_on_target() {
        let mut state = ServiceState::empty(key());
        state.target_version = Some(5);
        state.desired_count = 2;
        state.healthy_count = 1;
        assert!(!state.is_converged_on(5, 2));

        state.healthy_count = 2;
        assert!(state.is_converged_on(5, 2));
        assert!(!state.is_converged_on(4, 2));
        // Caller asked for more than the platform currently desires.
        assert!(!state.is_converged_on(5, 3));
    }

    #[test]
    fn zero_desired_never_converges() {
        let mut state = ServiceState::empty(key());
        state.target_version = Some(1);
        assert!(!state.is_converged_on(1, 0));
    }

    #[test]
    fn report_passes_without_failures() {
        let report = TestReport {
            cases: vec![
                TestCase {
                    name: "a".to_string(),
                    outcome: TestOutcome::Passed,
                    message: None,
                },
                TestCase {
                    name: "b".to_string(),
                    outcome: TestOutcome::Skipped,
                    message: None,
                },
            ],
        };
        assert!(report.passed());
    }

    #[test]
    fn service_status_tagged_serialization() {
        let json = serde_json::to_string(&ServiceStatus::InProgress).unwrap();
        assert_eq!(json, r#"{"status":"in-progress"}"#);
    }
}
