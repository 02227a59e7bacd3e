use anyhow::Result;
use clap::Parser;

use wip_routing::cli::commands::config::ConfigCommand;
use wip_routing::cli::commands::route::RouteCommand;
use wip_routing::cli::commands::simulate::SimulateCommand;
use wip_routing::cli::commands::walk::WalkCommand;
use wip_routing::cli::commands::Command;
use wip_routing::cli::{Cli, Commands};
use wip_routing::config::WipRoutingConfig;
use wip_routing::telemetry::{init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    WipRoutingConfig::load_env_file()?;
    let config = WipRoutingConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Simulate { units, seed, outcome } => {
                SimulateCommand::new(units, config)
                    .with_seed(seed)
                    .with_outcome(outcome.map(Into::into))
                    .execute()
                    .await
            }
            Commands::Route { graph, json } => RouteCommand::new(graph, config).with_json(json).execute().await,
            Commands::Walk {
                graph,
                material,
                fail_at,
            } => {
                WalkCommand::new(graph, material, config)
                    .with_fail_at(fail_at)
                    .execute()
                    .await
            }
            Commands::Config { write } => ConfigCommand::new(write, config).execute().await,
        }
    });

    shutdown_telemetry();
    result
}
