use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::{load_route_graph, Command};
use crate::config::WipRoutingConfig;
use crate::ids::{MaterialId, RouteStepId, WipId};
use crate::messages::{self, Event, Operation};
use crate::observability::OperationTimer;
use crate::runtime::WipRuntime;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on operations, so a route that cycles forever still ends.
const MAX_OPERATIONS: usize = 64;

/// Plays the operator for one unit: starts work at whichever step the unit
/// is queued at, assembles what the step requires and reports a pass,
/// until the route ends.
pub struct WalkCommand {
    pub graph: Option<PathBuf>,
    pub material: MaterialId,
    pub fail_at: Option<RouteStepId>,
    config: WipRoutingConfig,
}

impl WalkCommand {
    pub fn new(graph: Option<PathBuf>, material: impl Into<MaterialId>, config: WipRoutingConfig) -> Self {
        Self {
            graph,
            material: material.into(),
            fail_at: None,
            config,
        }
    }

    pub fn with_fail_at(mut self, step: Option<String>) -> Self {
        self.fail_at = step.map(RouteStepId::from);
        self
    }

    async fn operate(&self, runtime: &WipRuntime, operation: &Operation, fail: bool) -> Result<()> {
        let step = runtime
            .graph()
            .step(&operation.route_step_id)
            .with_context(|| format!("Unit queued at unknown step {}", operation.route_step_id))?;

        if fail {
            runtime.publish(Event::OperationFailedAtRouteStep(operation.clone()))?;
        } else if step.requires_assembly() {
            // The tracker reports the pass once the last part is in.
            for material_id in &step.materials_to_assemble {
                runtime.publish(Event::PartAssembled {
                    wip_id: operation.wip_id.clone(),
                    material_id: material_id.clone(),
                })?;
                runtime.wait_idle(SETTLE_TIMEOUT).await?;
            }
        } else {
            runtime.publish(Event::OperationPassedAtRouteStep(operation.clone()))?;
        }
        runtime.wait_idle(SETTLE_TIMEOUT).await?;
        Ok(())
    }
}

impl Command for WalkCommand {
    async fn execute(&self) -> Result<()> {
        let timer = OperationTimer::new("walk");
        let graph = Arc::new(load_route_graph(self.graph.as_deref(), &self.config)?);
        let route_id = graph.route_id().clone();
        let runtime = WipRuntime::start(graph, &self.config);
        let mut events = runtime.subscribe();
        let wip_id = WipId::generate();

        eprintln!("🚶 Walking unit {} along route {}", wip_id, route_id);
        runtime.release_to_route(&wip_id, &route_id)?;
        runtime.wait_idle(SETTLE_TIMEOUT).await?;
        print_events(&mut events)?;

        let mut failed_once = false;
        for _ in 0..MAX_OPERATIONS {
            let routing = runtime
                .routing_state(&wip_id)
                .await
                .context("Unit was not accepted onto the route")?;
            if routing.completed {
                let end = routing.previous_route_step_id.map(|s| s.to_string()).unwrap_or_default();
                eprintln!("🏁 Unit {} reached the end of route {} at {}", wip_id, route_id, end);
                runtime.shutdown().await;
                timer.finish();
                return Ok(());
            }

            let Some(step) = routing.in_queue_route_steps.first().cloned() else {
                bail!("Unit {} is not queued anywhere", wip_id);
            };
            let operation = Operation::new(
                wip_id.clone(),
                step.clone(),
                format!("RES-{step}"),
                self.material.clone(),
            );

            runtime.send(messages::Command::StartWipAtOperation(operation.clone()))?;
            runtime.wait_idle(SETTLE_TIMEOUT).await?;
            if let Some(fault) = print_events(&mut events)? {
                bail!("Operation at {} was rejected: {}", step, fault);
            }

            let fail = !failed_once && self.fail_at.as_ref() == Some(&step);
            failed_once |= fail;
            self.operate(&runtime, &operation, fail).await?;
            print_events(&mut events)?;
        }

        bail!("Unit {} did not finish the route within {} operations", wip_id, MAX_OPERATIONS)
    }
}

/// Print everything handled since the last call. Returns the name of the
/// last fault seen, if any.
fn print_events(events: &mut broadcast::Receiver<Event>) -> Result<Option<&'static str>> {
    let mut fault = None;
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let Event::Fault(f) = &event {
                    fault = Some(f.name());
                }
                println!("{}", serde_json::to_string(&event)?);
            }
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed events while walking");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(fault),
        }
    }
}
