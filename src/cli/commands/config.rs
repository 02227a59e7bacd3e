use anyhow::Result;
use std::path::PathBuf;

use super::Command;
use crate::config::WipRoutingConfig;

/// Show the effective configuration after defaults, file and environment
/// are layered, or write it out as a starting point.
pub struct ConfigCommand {
    pub write: Option<PathBuf>,
    config: WipRoutingConfig,
}

impl ConfigCommand {
    pub fn new(write: Option<PathBuf>, config: WipRoutingConfig) -> Self {
        Self { write, config }
    }
}

impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        match &self.write {
            Some(path) => {
                self.config.save_to_file(path)?;
                println!("✅ Configuration written to {}", path.display());
            }
            None => print!("{}", toml::to_string_pretty(&self.config)?),
        }
        Ok(())
    }
}
