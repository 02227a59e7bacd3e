//! Precondition check for starting an operation on a unit.
//!
//! The guard never mutates anything and never returns an error: it yields
//! exactly one event, either the started event or a fault.

use crate::messages::{Event, Fault, Operation};
use crate::routing::graph::RouteGraph;
use crate::routing::projection::WipState;

pub struct OperationGuard<'a> {
    graph: &'a RouteGraph,
}

impl<'a> OperationGuard<'a> {
    pub fn new(graph: &'a RouteGraph) -> Self {
        Self { graph }
    }

    /// Checks, in order: the unit is not already in process, then the
    /// material belongs to the route.
    pub fn start_operation(&self, state: Option<&WipState>, operation: &Operation) -> Event {
        if let Some(in_process) = state.and_then(|s| s.current_route_step_id.as_ref()) {
            tracing::warn!(
                wip_id = %operation.wip_id,
                in_process_at = %in_process,
                requested = %operation.route_step_id,
                "Operation rejected: unit already in process"
            );
            return Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess {
                wip_id: operation.wip_id.clone(),
                route_step_id: in_process.clone(),
                material_id: operation.material_id.clone(),
            });
        }

        if !self.graph.is_material_valid(&operation.material_id) {
            tracing::warn!(
                wip_id = %operation.wip_id,
                material_id = %operation.material_id,
                route_id = %self.graph.route_id(),
                "Operation rejected: material not valid for route"
            );
            return Event::Fault(Fault::OperationFailedToStartBecauseMaterialIsNotValidForRoute {
                wip_id: operation.wip_id.clone(),
                route_step_id: operation.route_step_id.clone(),
                resource_id: operation.resource_id.clone(),
                material_id: operation.material_id.clone(),
            });
        }

        Event::OperationStartedAtRouteStep(operation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{RouteStepId, WipId};

    fn in_process_at(step: &str) -> WipState {
        let mut state = WipState::new(WipId::from("W1"));
        state.current_route_step_id = Some(RouteStepId::from(step));
        state
    }

    #[test]
    fn test_idle_unit_with_valid_material_starts() {
        let graph = RouteGraph::demo();
        let op = Operation::new("W1", "KIT", "R1", "M-UNIT");

        let event = OperationGuard::new(&graph).start_operation(Some(&WipState::new(WipId::from("W1"))), &op);

        assert_eq!(event, Event::OperationStartedAtRouteStep(op));
    }

    #[test]
    fn test_unit_in_process_faults_with_existing_step() {
        let graph = RouteGraph::demo();
        let op = Operation::new("W1", "TEST", "R1", "M-UNIT");

        let event = OperationGuard::new(&graph).start_operation(Some(&in_process_at("ASSEMBLE")), &op);

        assert_eq!(
            event,
            Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess {
                wip_id: WipId::from("W1"),
                route_step_id: RouteStepId::from("ASSEMBLE"),
                material_id: op.material_id.clone(),
            })
        );
    }

    #[test]
    fn test_in_process_check_runs_before_material_check() {
        let graph = RouteGraph::demo();
        let op = Operation::new("W1", "TEST", "R1", "M-BOGUS");

        let event = OperationGuard::new(&graph).start_operation(Some(&in_process_at("KIT")), &op);

        assert!(matches!(
            event,
            Event::Fault(Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess { .. })
        ));
    }

    #[test]
    fn test_invalid_material_faults() {
        let graph = RouteGraph::demo();
        let op = Operation::new("W1", "KIT", "R1", "M-BOGUS");

        let event = OperationGuard::new(&graph).start_operation(None, &op);

        assert_eq!(
            event,
            Event::Fault(Fault::OperationFailedToStartBecauseMaterialIsNotValidForRoute {
                wip_id: op.wip_id.clone(),
                route_step_id: op.route_step_id.clone(),
                resource_id: op.resource_id.clone(),
                material_id: op.material_id.clone(),
            })
        );
    }
}
