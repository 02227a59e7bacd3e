use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::assembly::IncompleteAssemblyPolicy;
use crate::stage::SimulatedOutcome;

const DEFAULT_CONFIG_FILE: &str = "wip-routing.toml";

/// Main configuration structure for the routing runtime
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WipRoutingConfig {
    /// Stage simulator settings
    pub simulation: SimulationSettings,
    /// Route graph settings
    pub routing: RoutingSettings,
    /// Observability settings
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Seed for delays and assembly outcomes; OS entropy when absent
    pub seed: Option<u64>,
    /// Lower bound of a simulated station delay
    pub min_delay_ms: u64,
    /// Upper bound of a simulated station delay
    pub max_delay_ms: u64,
    /// Chance that a simulated assembly passes
    pub assembly_pass_probability: f64,
    /// Overrides the random assembly outcome
    pub forced_assembly_outcome: Option<SimulatedOutcome>,
    /// Directory of JSON unit records; kept in memory when absent
    pub records_directory: Option<PathBuf>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            seed: None,
            min_delay_ms: 1000,
            max_delay_ms: 3000,
            assembly_pass_probability: 2.0 / 3.0,
            forced_assembly_outcome: None,
            records_directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Route graph TOML file; the built-in demo route when absent
    pub graph_path: Option<PathBuf>,
    /// Used by assembly steps that do not set their own policy
    pub incomplete_assembly_policy: IncompleteAssemblyPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of the compact format
    pub json_logs: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl WipRoutingConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`wip-routing.toml`, or `path` when given)
    /// 3. Environment variables (prefixed with WIP_ROUTING_, sections split by `__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default()).context("Failed to build default configuration")?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("WIP_ROUTING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        let wip_routing_config: WipRoutingConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        let probability = wip_routing_config.simulation.assembly_pass_probability;
        ensure!(
            probability.is_finite(),
            "simulation.assembly_pass_probability must be a finite number, got {probability}"
        );

        Ok(wip_routing_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
