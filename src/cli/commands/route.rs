use anyhow::Result;
use std::path::PathBuf;

use super::{load_route_graph, Command};
use crate::config::WipRoutingConfig;
use crate::ids::RouteStepId;
use crate::routing::{RouteGraph, RouteResolver, StepDefinition};

pub struct RouteCommand {
    pub graph: Option<PathBuf>,
    pub json: bool,
    config: WipRoutingConfig,
}

impl RouteCommand {
    pub fn new(graph: Option<PathBuf>, config: WipRoutingConfig) -> Self {
        Self {
            graph,
            json: false,
            config,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn print_steps(&self, graph: &RouteGraph) {
        println!("🔀 Route {} (first step {})", graph.route_id(), graph.first_step());
        println!();
        for step in graph.steps() {
            println!("  {}", step.id);
            println!("     pass  → {}", list(&step.on_pass));
            for rule in &step.on_pass_from {
                println!("     pass from {} → {}", rule.previous, list(&rule.next));
            }
            println!("     fail  → {}", list(&step.on_fail));
            println!("     abort → {}", list(&step.on_abort));
            if step.requires_assembly() {
                let materials: Vec<&str> = step.materials_to_assemble.iter().map(|m| m.as_str()).collect();
                let policy = step
                    .incomplete_assembly_policy
                    .unwrap_or(self.config.routing.incomplete_assembly_policy);
                println!("     assembles [{}], incomplete completion {:?}", materials.join(", "), policy);
            }
        }
    }
}

impl Command for RouteCommand {
    async fn execute(&self) -> Result<()> {
        let graph = load_route_graph(self.graph.as_deref(), &self.config)?;

        if self.json {
            let steps: Vec<&StepDefinition> = graph.steps().collect();
            println!("{}", serde_json::to_string_pretty(&steps)?);
        } else {
            self.print_steps(&graph);
        }
        Ok(())
    }
}

fn list(steps: &[RouteStepId]) -> String {
    if steps.is_empty() {
        "end of route".to_string()
    } else {
        steps.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    }
}
