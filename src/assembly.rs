//! Assembly sub-process tracker.
//!
//! One instance per operation that requires assembly. It tracks which
//! materials are still to be fitted, completes the operation on its own
//! when nothing is left, and applies the step's policy when it is told to
//! complete early.

use serde::{Deserialize, Serialize};

use crate::ids::{MaterialId, ResourceId, RouteStepId, WipId};
use crate::messages::{Anomaly, Command, Effect, Operation, OperationOutcome};
use crate::saga::{SagaState, Transition};

/// Outcome published when assembly is completed with materials still
/// remaining to be assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteAssemblyPolicy {
    #[default]
    Fail,
    Abort,
    Pass,
}

impl IncompleteAssemblyPolicy {
    pub fn outcome(self) -> OperationOutcome {
        match self {
            IncompleteAssemblyPolicy::Fail => OperationOutcome::Failed,
            IncompleteAssemblyPolicy::Abort => OperationOutcome::Aborted,
            IncompleteAssemblyPolicy::Pass => OperationOutcome::Passed,
        }
    }
}

/// Correlation key of a tracker: the unit plus which of its assembly
/// operations this is (the unit may loop back through the same step).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyKey {
    pub wip_id: WipId,
    pub instance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyInput {
    PartAssembled(MaterialId),
    PartDisassembled(MaterialId),
    Complete(Operation),
    OperationEnded(OperationOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembleState {
    pub wip_id: WipId,
    pub target_material_id: MaterialId,
    pub route_step_id: RouteStepId,
    pub resource_id: ResourceId,
    pub materials_to_assemble: Vec<MaterialId>,
    pub assembled_materials: Vec<MaterialId>,
    pub policy: IncompleteAssemblyPolicy,
    /// Set once an outcome has been published for this operation.
    pub decided: Option<OperationOutcome>,
    pub completed: bool,
}

impl AssembleState {
    pub fn start(
        operation: &Operation,
        materials: Vec<MaterialId>,
        policy: IncompleteAssemblyPolicy,
    ) -> Self {
        Self {
            wip_id: operation.wip_id.clone(),
            target_material_id: operation.material_id.clone(),
            route_step_id: operation.route_step_id.clone(),
            resource_id: operation.resource_id.clone(),
            materials_to_assemble: materials,
            assembled_materials: Vec::new(),
            policy,
            decided: None,
            completed: false,
        }
    }

    fn operation(&self) -> Operation {
        Operation {
            wip_id: self.wip_id.clone(),
            route_step_id: self.route_step_id.clone(),
            resource_id: self.resource_id.clone(),
            material_id: self.target_material_id.clone(),
        }
    }

    pub fn handle(mut self, input: &AssemblyInput) -> Transition<Self> {
        if self.completed {
            return Transition::unchanged(self);
        }

        match input {
            AssemblyInput::PartAssembled(material_id) => {
                let Some(index) = self.materials_to_assemble.iter().position(|m| m == material_id)
                else {
                    let anomaly = Anomaly::UnexpectedPartAssembled {
                        wip_id: self.wip_id.clone(),
                        material_id: material_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                };

                let material = self.materials_to_assemble.remove(index);
                self.assembled_materials.push(material);

                if self.materials_to_assemble.is_empty() && self.decided.is_none() {
                    let complete = Command::CompleteAssemble(self.operation());
                    return Transition::new(self, vec![Effect::Send(complete)]);
                }
                Transition::unchanged(self)
            }
            AssemblyInput::PartDisassembled(material_id) => {
                let Some(index) = self.assembled_materials.iter().position(|m| m == material_id)
                else {
                    let anomaly = Anomaly::UnexpectedPartDisassembled {
                        wip_id: self.wip_id.clone(),
                        material_id: material_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                };

                let material = self.assembled_materials.remove(index);
                self.materials_to_assemble.push(material);
                Transition::unchanged(self)
            }
            AssemblyInput::Complete(operation) => {
                if self.decided.is_some() {
                    let anomaly = Anomaly::DuplicateCompletion {
                        wip_id: self.wip_id.clone(),
                        route_step_id: operation.route_step_id.clone(),
                    };
                    return Transition::anomaly(self, anomaly);
                }

                let outcome = if self.materials_to_assemble.is_empty() {
                    OperationOutcome::Passed
                } else {
                    self.policy.outcome()
                };
                tracing::info!(
                    wip_id = %self.wip_id,
                    route_step_id = %operation.route_step_id,
                    remaining = self.materials_to_assemble.len(),
                    outcome = ?outcome,
                    "Assembly completed"
                );

                self.decided = Some(outcome);
                let event = outcome.into_event(operation.clone());
                Transition::new(self, vec![Effect::Publish(event)])
            }
            AssemblyInput::OperationEnded(_) => {
                self.completed = true;
                Transition::unchanged(self)
            }
        }
    }
}

impl SagaState for AssembleState {
    fn is_complete(&self) -> bool {
        self.completed
    }
}
