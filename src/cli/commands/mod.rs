use anyhow::{Context, Result};
use std::path::Path;

use crate::config::WipRoutingConfig;
use crate::routing::RouteGraph;

pub mod config;
pub mod route;
pub mod simulate;
pub mod walk;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// An explicit graph file wins over the configured one; the built-in demo
/// route is used when neither is given.
pub fn load_route_graph(graph: Option<&Path>, config: &WipRoutingConfig) -> Result<RouteGraph> {
    match graph.or(config.routing.graph_path.as_deref()) {
        Some(path) => RouteGraph::load(path)
            .with_context(|| format!("Failed to load route graph from {}", path.display())),
        None => Ok(RouteGraph::demo()),
    }
}
