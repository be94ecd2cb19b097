pub mod inspect;
pub mod release;
pub mod setup;

use std::path::PathBuf;

use anyhow::Context;

use cutover_core::{CutoverConfig, Environment, EnvironmentResolver};
use cutover_state::StateStore;

/// File locations shared by every command.
pub struct Paths {
    pub config: PathBuf,
    pub state: PathBuf,
}

impl Paths {
    pub fn load_config(&self) -> anyhow::Result<CutoverConfig> {
        CutoverConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))
    }

    pub fn resolver(&self) -> anyhow::Result<EnvironmentResolver> {
        Ok(EnvironmentResolver::from_config(&self.load_config()?)?)
    }

    pub fn environment(&self, name: &str) -> anyhow::Result<Environment> {
        Ok(self.resolver()?.resolve(name)?)
    }

    /// Open the state store, creating its directory on first use.
    pub fn open_store(&self) -> anyhow::Result<StateStore> {
        if let Some(dir) = self.state.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(StateStore::open(&self.state)?)
    }
}
