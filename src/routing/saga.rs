//! Routing orchestrator: one saga per unit, correlated by `WipId`.
//!
//! It mirrors the unit's queue membership, removes the unit from every
//! queue when work starts, and on each operation outcome asks the resolver
//! where the unit goes next. Queue events it did not ask for, starts while
//! in process and outcomes for other steps are redeliveries: they are
//! reported as anomalies and leave the saga as it was.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{RouteId, RouteStepId, WipId};
use crate::messages::{Anomaly, Command, Effect, Event, Operation, OperationOutcome};
use crate::routing::graph::RouteResolver;
use crate::saga::{SagaState, Transition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSagaState {
    pub wip_id: WipId,
    pub route_id: RouteId,
    pub in_queue_route_steps: BTreeSet<RouteStepId>,
    pub current_route_step_id: Option<RouteStepId>,
    /// Last step whose outcome was routed; feeds pass resolution.
    pub previous_route_step_id: Option<RouteStepId>,
    /// Queue changes this saga asked for and has not seen confirmed.
    /// Queue events outside these are redeliveries.
    #[serde(default)]
    pub pending_enqueues: BTreeSet<RouteStepId>,
    #[serde(default)]
    pub pending_dequeues: BTreeSet<RouteStepId>,
    pub completed: bool,
}

impl RoutingSagaState {
    /// Start a saga for a unit released to a route. Releasing to a route
    /// other than the loaded one creates no saga.
    pub fn release(
        wip_id: &WipId,
        route_id: &RouteId,
        resolver: &dyn RouteResolver,
    ) -> Transition<Option<Self>> {
        if route_id != resolver.route_id() {
            let anomaly = Anomaly::UnknownRoute {
                wip_id: wip_id.clone(),
                route_id: route_id.clone(),
            };
            return Transition::anomaly(None, anomaly);
        }

        let state = Self {
            wip_id: wip_id.clone(),
            route_id: route_id.clone(),
            in_queue_route_steps: BTreeSet::new(),
            current_route_step_id: None,
            previous_route_step_id: None,
            pending_enqueues: BTreeSet::from([resolver.first_step().clone()]),
            pending_dequeues: BTreeSet::new(),
            completed: false,
        };
        let enqueue = Command::EnqueueWipAtRouteStep {
            wip_id: wip_id.clone(),
            route_step_id: resolver.first_step().clone(),
        };
        Transition::new(Some(state), vec![Effect::Send(enqueue)])
    }

    pub fn handle(mut self, event: &Event, resolver: &dyn RouteResolver) -> Transition<Self> {
        if self.completed {
            tracing::debug!(wip_id = %self.wip_id, event = event.name(), "Routing saga already complete");
            return Transition::unchanged(self);
        }

        match event {
            Event::WipEnqueuedAtRouteStep { route_step_id, .. } => {
                if !self.pending_enqueues.remove(route_step_id)
                    || !self.in_queue_route_steps.insert(route_step_id.clone())
                {
                    let anomaly = Anomaly::DuplicateEnqueue {
                        wip_id: self.wip_id.clone(),
                        route_step_id: route_step_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                }
                Transition::unchanged(self)
            }
            Event::WipDequeuedAtRouteStep { route_step_id, .. } => {
                if !self.pending_dequeues.remove(route_step_id)
                    || !self.in_queue_route_steps.remove(route_step_id)
                {
                    let anomaly = Anomaly::DequeueMismatch {
                        wip_id: self.wip_id.clone(),
                        route_step_id: route_step_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                }
                Transition::unchanged(self)
            }
            Event::OperationStartedAtRouteStep(op) => {
                if let Some(current) = &self.current_route_step_id {
                    tracing::warn!(
                        wip_id = %self.wip_id,
                        current = %current,
                        route_step_id = %op.route_step_id,
                        "Start while already in process"
                    );
                    let anomaly = Anomaly::DuplicateStart {
                        wip_id: self.wip_id.clone(),
                        route_step_id: op.route_step_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                }

                let effects = self
                    .in_queue_route_steps
                    .iter()
                    .map(|step| {
                        Effect::Send(Command::DequeueWipAtRouteStep {
                            wip_id: self.wip_id.clone(),
                            route_step_id: step.clone(),
                        })
                    })
                    .collect();

                // Enqueues still in flight land after the start cleared the queues.
                self.pending_enqueues.clear();
                self.pending_dequeues = self.in_queue_route_steps.clone();
                self.current_route_step_id = Some(op.route_step_id.clone());
                Transition::new(self, effects)
            }
            Event::OperationPassedAtRouteStep(op)
            | Event::OperationFailedAtRouteStep(op)
            | Event::OperationAbortedAtRouteStep(op)
                if self.current_route_step_id.as_ref() != Some(&op.route_step_id) =>
            {
                tracing::warn!(
                    wip_id = %self.wip_id,
                    route_step_id = %op.route_step_id,
                    event = event.name(),
                    "Outcome for a step the unit is not in process at"
                );
                let anomaly = Anomaly::StaleOutcome {
                    wip_id: self.wip_id.clone(),
                    route_step_id: op.route_step_id.clone(),
                };
                Transition::anomaly(self, anomaly)
            }
            Event::OperationPassedAtRouteStep(op) => {
                let next = resolver.next_on_pass(&op.route_step_id, self.previous_route_step_id.as_ref());
                self.route_onward(op, OperationOutcome::Passed, next)
            }
            Event::OperationFailedAtRouteStep(op) => {
                let next = resolver.next_on_fail(&op.route_step_id);
                self.route_onward(op, OperationOutcome::Failed, next)
            }
            Event::OperationAbortedAtRouteStep(op) => {
                let next = resolver.next_on_abort(&op.route_step_id);
                self.route_onward(op, OperationOutcome::Aborted, next)
            }
            _ => Transition::unchanged(self),
        }
    }

    /// Enqueue at every resolved step; an empty resolution ends the route.
    fn route_onward(
        mut self,
        op: &Operation,
        outcome: OperationOutcome,
        next: &[RouteStepId],
    ) -> Transition<Self> {
        self.previous_route_step_id = self.current_route_step_id.take();
        if next.is_empty() {
            tracing::info!(
                wip_id = %self.wip_id,
                route_id = %self.route_id,
                route_step_id = %op.route_step_id,
                outcome = ?outcome,
                "Unit reached end of route"
            );
            self.completed = true;
            let event = Event::WipReachedEndOfRoute {
                wip_id: self.wip_id.clone(),
                route_id: self.route_id.clone(),
                route_step_id: op.route_step_id.clone(),
                outcome,
            };
            return Transition::new(self, vec![Effect::Publish(event)]);
        }

        let effects = next
            .iter()
            .map(|step| {
                Effect::Send(Command::EnqueueWipAtRouteStep {
                    wip_id: self.wip_id.clone(),
                    route_step_id: step.clone(),
                })
            })
            .collect();
        self.pending_enqueues.extend(next.iter().cloned());
        Transition::new(self, effects)
    }
}

impl SagaState for RoutingSagaState {
    fn is_complete(&self) -> bool {
        self.completed
    }
}
