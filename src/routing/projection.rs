//! Positional state of a unit, rebuilt by folding its events in arrival
//! order, and the unit aggregate that turns queue commands into events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{ResourceId, RouteStepId, WipId};
use crate::messages::{Command, Effect, Event};
use crate::saga::{SagaState, Transition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipState {
    pub wip_id: WipId,
    /// Present only while an operation is in process.
    pub current_route_step_id: Option<RouteStepId>,
    pub last_route_step_id: Option<RouteStepId>,
    pub current_resource_id: Option<ResourceId>,
    pub in_queue_route_steps: BTreeSet<RouteStepId>,
}

impl WipState {
    pub fn new(wip_id: WipId) -> Self {
        Self {
            wip_id,
            current_route_step_id: None,
            last_route_step_id: None,
            current_resource_id: None,
            in_queue_route_steps: BTreeSet::new(),
        }
    }

    /// Rebuild a unit from its history. Nothing before the release event
    /// is applied; `None` if the unit was never released.
    pub fn from_history<'a, I>(events: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        events.into_iter().fold(None, |state, event| match (state, event) {
            (Some(state), event) => Some(state.apply(event)),
            (None, Event::WipReleasedToRoute { wip_id, .. }) => Some(Self::new(wip_id.clone())),
            (None, _) => None,
        })
    }

    pub fn is_in_process(&self) -> bool {
        self.current_route_step_id.is_some()
    }

    pub fn is_in_process_at(&self, route_step_id: &RouteStepId) -> bool {
        self.current_route_step_id.as_ref() == Some(route_step_id)
    }

    pub fn apply(mut self, event: &Event) -> Self {
        match event {
            Event::WipEnqueuedAtRouteStep { route_step_id, .. } => {
                self.in_queue_route_steps.insert(route_step_id.clone());
            }
            Event::WipDequeuedAtRouteStep { route_step_id, .. } => {
                self.in_queue_route_steps.remove(route_step_id);
            }
            Event::OperationStartedAtRouteStep(op) => {
                self.current_route_step_id = Some(op.route_step_id.clone());
                self.current_resource_id = Some(op.resource_id.clone());
                self.in_queue_route_steps.clear();
            }
            Event::OperationPassedAtRouteStep(op)
            | Event::OperationFailedAtRouteStep(op)
            | Event::OperationAbortedAtRouteStep(op) => {
                if !self.is_in_process_at(&op.route_step_id) {
                    tracing::debug!(
                        wip_id = %self.wip_id,
                        route_step_id = %op.route_step_id,
                        event = event.name(),
                        "Ignoring outcome for a step the unit is not in process at"
                    );
                    return self;
                }
                self.last_route_step_id = Some(op.route_step_id.clone());
                self.current_route_step_id = None;
                self.current_resource_id = None;
            }
            Event::WipReleasedToRoute { .. }
            | Event::PartAssembled { .. }
            | Event::PartDisassembled { .. }
            | Event::WipReachedEndOfRoute { .. }
            | Event::WipReleased { .. }
            | Event::WipMovedToAssemble { .. }
            | Event::AssembleStarted { .. }
            | Event::AssemblePassed { .. }
            | Event::AssembleFailed { .. }
            | Event::WipMovedToPackout { .. }
            | Event::WipPacked { .. }
            | Event::WipMovedToScrap { .. }
            | Event::WipScrapped { .. }
            | Event::Fault(_)
            | Event::Anomaly(_) => {}
        }
        self
    }

    /// Unit aggregate: apply the event a queue command produces, then
    /// publish it. Other commands are not addressed to the aggregate.
    pub fn handle_queue_command(self, command: &Command) -> Transition<Self> {
        let event = match command {
            Command::EnqueueWipAtRouteStep { wip_id, route_step_id } => {
                Event::WipEnqueuedAtRouteStep {
                    wip_id: wip_id.clone(),
                    route_step_id: route_step_id.clone(),
                }
            }
            Command::DequeueWipAtRouteStep { wip_id, route_step_id } => {
                Event::WipDequeuedAtRouteStep {
                    wip_id: wip_id.clone(),
                    route_step_id: route_step_id.clone(),
                }
            }
            _ => return Transition::unchanged(self),
        };
        self.apply_and_publish(event)
    }

    pub fn apply_and_publish(self, event: Event) -> Transition<Self> {
        let state = self.apply(&event);
        Transition::new(state, vec![Effect::Publish(event)])
    }
}

impl SagaState for WipState {
    // Unit state lives as long as the unit.
    fn is_complete(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RouteId;
    use crate::messages::Operation;

    fn released() -> Event {
        Event::WipReleasedToRoute {
            wip_id: WipId::from("W1"),
            route_id: RouteId::from("R-100"),
        }
    }

    fn enqueued(step: &str) -> Event {
        Event::WipEnqueuedAtRouteStep {
            wip_id: WipId::from("W1"),
            route_step_id: RouteStepId::from(step),
        }
    }

    fn op(step: &str) -> Operation {
        Operation::new("W1", step, "R1", "M-UNIT")
    }

    #[test]
    fn test_history_before_release_is_ignored() {
        assert!(WipState::from_history(&[enqueued("S1")]).is_none());

        let state = WipState::from_history(&[enqueued("S0"), released(), enqueued("S1")]).unwrap();
        assert_eq!(state.in_queue_route_steps.len(), 1);
        assert!(state.in_queue_route_steps.contains(&RouteStepId::from("S1")));
    }

    #[test]
    fn test_start_sets_current_step_and_clears_queues() {
        let state = WipState::from_history(&[
            released(),
            enqueued("S1"),
            enqueued("S2"),
            Event::OperationStartedAtRouteStep(op("S1")),
        ])
        .unwrap();

        assert!(state.is_in_process());
        assert_eq!(state.current_route_step_id, Some(RouteStepId::from("S1")));
        assert_eq!(state.current_resource_id, Some(ResourceId::from("R1")));
        assert!(state.in_queue_route_steps.is_empty());
    }

    #[test]
    fn test_outcome_clears_current_step_and_records_last() {
        let history = [
            released(),
            enqueued("S1"),
            Event::OperationStartedAtRouteStep(op("S1")),
            Event::OperationAbortedAtRouteStep(op("S1")),
        ];
        let state = WipState::from_history(&history).unwrap();

        assert!(!state.is_in_process());
        assert_eq!(state.current_resource_id, None);
        assert_eq!(state.last_route_step_id, Some(RouteStepId::from("S1")));
    }

    #[test]
    fn test_outcome_for_another_step_leaves_the_unit_in_process() {
        let history = [
            released(),
            Event::OperationStartedAtRouteStep(op("S1")),
            Event::OperationPassedAtRouteStep(op("S1")),
            enqueued("S2"),
            Event::OperationStartedAtRouteStep(op("S2")),
        ];
        let in_process = WipState::from_history(&history).unwrap();

        let state = in_process.clone().apply(&Event::OperationPassedAtRouteStep(op("S1")));
        assert_eq!(state, in_process);
        assert!(state.is_in_process_at(&RouteStepId::from("S2")));

        // Once the step finished, a second outcome for it changes nothing.
        let finished = state.apply(&Event::OperationFailedAtRouteStep(op("S2")));
        let again = finished.clone().apply(&Event::OperationFailedAtRouteStep(op("S2")));
        assert_eq!(again, finished);
        assert_eq!(again.last_route_step_id, Some(RouteStepId::from("S2")));
    }

    #[test]
    fn test_duplicate_enqueue_keeps_set_semantics() {
        let state = WipState::from_history(&[released(), enqueued("S1"), enqueued("S1")]).unwrap();
        assert_eq!(state.in_queue_route_steps.len(), 1);
    }

    #[test]
    fn test_queue_commands_apply_then_publish() {
        let command = Command::EnqueueWipAtRouteStep {
            wip_id: WipId::from("W1"),
            route_step_id: RouteStepId::from("S1"),
        };

        let step = WipState::new(WipId::from("W1")).handle_queue_command(&command);

        assert!(step.state.in_queue_route_steps.contains(&RouteStepId::from("S1")));
        assert_eq!(step.effects, vec![Effect::Publish(enqueued("S1"))]);

        let dequeue = Command::DequeueWipAtRouteStep {
            wip_id: WipId::from("W1"),
            route_step_id: RouteStepId::from("S1"),
        };
        let step = step.state.handle_queue_command(&dequeue);
        assert!(step.state.in_queue_route_steps.is_empty());
        assert_eq!(step.effects.len(), 1);
    }

    #[test]
    fn test_non_queue_command_is_ignored_by_the_aggregate() {
        let state = WipState::new(WipId::from("W1"));
        let step = state.clone().handle_queue_command(&Command::PackWip { wip_id: WipId::from("W1") });
        assert_eq!(step.state, state);
        assert!(step.effects.is_empty());
    }
}
