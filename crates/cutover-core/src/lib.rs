pub mod config;
pub mod environment;
pub mod error;
pub mod run;
pub mod types;

pub use config::{CutoverConfig, RegistrySettings, RolloutSettings};
pub use environment::{Environment, EnvironmentName, EnvironmentResolver, ScalingBounds, TaskDefaults};
pub use error::{DeployError, DeployResult, ErrorKind};
pub use run::{PipelineRun, RunOutcome, StageError, StageOutcome, StageResult, Trigger};
pub use types::*;
