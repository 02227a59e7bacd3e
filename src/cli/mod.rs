use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::stage::SimulatedOutcome;

pub mod commands;

#[derive(Parser)]
#[command(name = "wip-routing")]
#[command(about = "Saga-driven routing of manufacturing work-in-process")]
#[command(long_about = "Moves work-in-process units through a route of operations and through the \
                       assemble, packout and scrap stages. Start with 'wip-routing simulate' to watch \
                       units flow through the simulated stations.")]
pub struct Cli {
    /// Configuration file layered over the defaults
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Release units to the stage simulator and stream viewer notifications as JSON lines
    Simulate {
        /// Number of units to release
        #[arg(long, default_value = "1", help = "Number of units to release at once")]
        units: u32,
        /// Seed for station delays and assembly outcomes
        #[arg(long, help = "Seed the simulation for a reproducible run")]
        seed: Option<u64>,
        /// Force every assembly to pass or fail
        #[arg(long, value_enum, help = "Force the assembly outcome instead of drawing it")]
        outcome: Option<OutcomeArg>,
    },
    /// Validate a route graph and print its steps
    Route {
        /// Route graph file
        #[arg(long, help = "Route graph TOML file; the configured or built-in route when omitted")]
        graph: Option<PathBuf>,
        /// Print the steps as JSON
        #[arg(long, help = "Print the step definitions as JSON")]
        json: bool,
    },
    /// Walk one unit through the route as a scripted operator
    Walk {
        /// Route graph file
        #[arg(long, help = "Route graph TOML file; the configured or built-in route when omitted")]
        graph: Option<PathBuf>,
        /// Material the unit is built from
        #[arg(long, default_value = "M-UNIT", help = "Material id reported at every operation")]
        material: String,
        /// Fail the first operation at this step
        #[arg(long, help = "Report a failure the first time the unit is at this step")]
        fail_at: Option<String>,
    },
    /// Print the effective configuration or write it to a file
    Config {
        /// Destination file
        #[arg(long, help = "Write the configuration as TOML instead of printing it")]
        write: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutcomeArg {
    Pass,
    Fail,
}

impl From<OutcomeArg> for SimulatedOutcome {
    fn from(outcome: OutcomeArg) -> Self {
        match outcome {
            OutcomeArg::Pass => SimulatedOutcome::Pass,
            OutcomeArg::Fail => SimulatedOutcome::Fail,
        }
    }
}
