//! Message contracts exchanged between the sagas, the aggregate and the
//! stage stations.
//!
//! Events are facts, commands are requests addressed to one handler, and
//! continuations are the delayed self-messages of the stage simulator.
//! Faults and anomalies travel as events so that callers can assert on them
//! like any other outcome.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::{MaterialId, ResourceId, RouteId, RouteStepId, WipId};

/// The four values every operation-level message carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub wip_id: WipId,
    pub route_step_id: RouteStepId,
    pub resource_id: ResourceId,
    pub material_id: MaterialId,
}

impl Operation {
    pub fn new(
        wip_id: impl Into<WipId>,
        route_step_id: impl Into<RouteStepId>,
        resource_id: impl Into<ResourceId>,
        material_id: impl Into<MaterialId>,
    ) -> Self {
        Self {
            wip_id: wip_id.into(),
            route_step_id: route_step_id.into(),
            resource_id: resource_id.into(),
            material_id: material_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Passed,
    Failed,
    Aborted,
}

impl OperationOutcome {
    /// Wrap an operation in the matching outcome event.
    pub fn into_event(self, operation: Operation) -> Event {
        match self {
            OperationOutcome::Passed => Event::OperationPassedAtRouteStep(operation),
            OperationOutcome::Failed => Event::OperationFailedAtRouteStep(operation),
            OperationOutcome::Aborted => Event::OperationAbortedAtRouteStep(operation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    EnqueueWipAtRouteStep { wip_id: WipId, route_step_id: RouteStepId },
    DequeueWipAtRouteStep { wip_id: WipId, route_step_id: RouteStepId },
    StartWipAtOperation(Operation),
    CompleteAssemble(Operation),
    MoveWipToAssemble { wip_id: WipId },
    MoveWipToPackout { wip_id: WipId },
    MoveWipToScrap { wip_id: WipId },
    StartAssemble { wip_id: WipId },
    PassAssemble { wip_id: WipId },
    FailAssemble { wip_id: WipId },
    PackWip { wip_id: WipId },
    ScrapWip { wip_id: WipId },
}

impl Command {
    pub fn wip_id(&self) -> &WipId {
        match self {
            Command::EnqueueWipAtRouteStep { wip_id, .. }
            | Command::DequeueWipAtRouteStep { wip_id, .. }
            | Command::MoveWipToAssemble { wip_id }
            | Command::MoveWipToPackout { wip_id }
            | Command::MoveWipToScrap { wip_id }
            | Command::StartAssemble { wip_id }
            | Command::PassAssemble { wip_id }
            | Command::FailAssemble { wip_id }
            | Command::PackWip { wip_id }
            | Command::ScrapWip { wip_id } => wip_id,
            Command::StartWipAtOperation(op) | Command::CompleteAssemble(op) => &op.wip_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::EnqueueWipAtRouteStep { .. } => "EnqueueWipAtRouteStep",
            Command::DequeueWipAtRouteStep { .. } => "DequeueWipAtRouteStep",
            Command::StartWipAtOperation(_) => "StartWipAtOperation",
            Command::CompleteAssemble(_) => "CompleteAssemble",
            Command::MoveWipToAssemble { .. } => "MoveWipToAssemble",
            Command::MoveWipToPackout { .. } => "MoveWipToPackout",
            Command::MoveWipToScrap { .. } => "MoveWipToScrap",
            Command::StartAssemble { .. } => "StartAssemble",
            Command::PassAssemble { .. } => "PassAssemble",
            Command::FailAssemble { .. } => "FailAssemble",
            Command::PackWip { .. } => "PackWip",
            Command::ScrapWip { .. } => "ScrapWip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    // Route level
    WipReleasedToRoute { wip_id: WipId, route_id: RouteId },
    WipEnqueuedAtRouteStep { wip_id: WipId, route_step_id: RouteStepId },
    WipDequeuedAtRouteStep { wip_id: WipId, route_step_id: RouteStepId },
    OperationStartedAtRouteStep(Operation),
    OperationPassedAtRouteStep(Operation),
    OperationFailedAtRouteStep(Operation),
    OperationAbortedAtRouteStep(Operation),
    PartAssembled { wip_id: WipId, material_id: MaterialId },
    PartDisassembled { wip_id: WipId, material_id: MaterialId },
    WipReachedEndOfRoute {
        wip_id: WipId,
        route_id: RouteId,
        route_step_id: RouteStepId,
        outcome: OperationOutcome,
    },

    // Stage level
    WipReleased { wip_id: WipId },
    WipMovedToAssemble { wip_id: WipId },
    AssembleStarted { wip_id: WipId },
    AssemblePassed { wip_id: WipId },
    AssembleFailed { wip_id: WipId },
    WipMovedToPackout { wip_id: WipId },
    WipPacked { wip_id: WipId },
    WipMovedToScrap { wip_id: WipId },
    WipScrapped { wip_id: WipId },

    Fault(Fault),
    Anomaly(Anomaly),
}

impl Event {
    pub fn wip_id(&self) -> &WipId {
        match self {
            Event::WipReleasedToRoute { wip_id, .. }
            | Event::WipEnqueuedAtRouteStep { wip_id, .. }
            | Event::WipDequeuedAtRouteStep { wip_id, .. }
            | Event::PartAssembled { wip_id, .. }
            | Event::PartDisassembled { wip_id, .. }
            | Event::WipReachedEndOfRoute { wip_id, .. }
            | Event::WipReleased { wip_id }
            | Event::WipMovedToAssemble { wip_id }
            | Event::AssembleStarted { wip_id }
            | Event::AssemblePassed { wip_id }
            | Event::AssembleFailed { wip_id }
            | Event::WipMovedToPackout { wip_id }
            | Event::WipPacked { wip_id }
            | Event::WipMovedToScrap { wip_id }
            | Event::WipScrapped { wip_id } => wip_id,
            Event::OperationStartedAtRouteStep(op)
            | Event::OperationPassedAtRouteStep(op)
            | Event::OperationFailedAtRouteStep(op)
            | Event::OperationAbortedAtRouteStep(op) => &op.wip_id,
            Event::Fault(fault) => fault.wip_id(),
            Event::Anomaly(anomaly) => anomaly.wip_id(),
        }
    }

    /// The outcome carried by an operation-outcome event, if this is one.
    pub fn outcome(&self) -> Option<(OperationOutcome, &Operation)> {
        match self {
            Event::OperationPassedAtRouteStep(op) => Some((OperationOutcome::Passed, op)),
            Event::OperationFailedAtRouteStep(op) => Some((OperationOutcome::Failed, op)),
            Event::OperationAbortedAtRouteStep(op) => Some((OperationOutcome::Aborted, op)),
            _ => None,
        }
    }

    /// Stage-level events drive the stage simulator; everything else is
    /// route-level.
    pub fn is_stage_event(&self) -> bool {
        matches!(
            self,
            Event::WipReleased { .. }
                | Event::WipMovedToAssemble { .. }
                | Event::AssembleStarted { .. }
                | Event::AssemblePassed { .. }
                | Event::AssembleFailed { .. }
                | Event::WipMovedToPackout { .. }
                | Event::WipPacked { .. }
                | Event::WipMovedToScrap { .. }
                | Event::WipScrapped { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::WipReleasedToRoute { .. } => "WipReleasedToRoute",
            Event::WipEnqueuedAtRouteStep { .. } => "WipEnqueuedAtRouteStep",
            Event::WipDequeuedAtRouteStep { .. } => "WipDequeuedAtRouteStep",
            Event::OperationStartedAtRouteStep(_) => "OperationStartedAtRouteStep",
            Event::OperationPassedAtRouteStep(_) => "OperationPassedAtRouteStep",
            Event::OperationFailedAtRouteStep(_) => "OperationFailedAtRouteStep",
            Event::OperationAbortedAtRouteStep(_) => "OperationAbortedAtRouteStep",
            Event::PartAssembled { .. } => "PartAssembled",
            Event::PartDisassembled { .. } => "PartDisassembled",
            Event::WipReachedEndOfRoute { .. } => "WipReachedEndOfRoute",
            Event::WipReleased { .. } => "WipReleased",
            Event::WipMovedToAssemble { .. } => "WipMovedToAssemble",
            Event::AssembleStarted { .. } => "AssembleStarted",
            Event::AssemblePassed { .. } => "AssemblePassed",
            Event::AssembleFailed { .. } => "AssembleFailed",
            Event::WipMovedToPackout { .. } => "WipMovedToPackout",
            Event::WipPacked { .. } => "WipPacked",
            Event::WipMovedToScrap { .. } => "WipMovedToScrap",
            Event::WipScrapped { .. } => "WipScrapped",
            Event::Fault(fault) => fault.name(),
            Event::Anomaly(anomaly) => anomaly.name(),
        }
    }
}

/// Business-rule violations raised by the operation guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault")]
pub enum Fault {
    /// `route_step_id` is the step the unit is already in process at.
    OperationFailedToStartBecauseWipIsAlreadyInProcess {
        wip_id: WipId,
        route_step_id: RouteStepId,
        material_id: MaterialId,
    },
    OperationFailedToStartBecauseMaterialIsNotValidForRoute {
        wip_id: WipId,
        route_step_id: RouteStepId,
        resource_id: ResourceId,
        material_id: MaterialId,
    },
}

impl Fault {
    pub fn wip_id(&self) -> &WipId {
        match self {
            Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess { wip_id, .. }
            | Fault::OperationFailedToStartBecauseMaterialIsNotValidForRoute { wip_id, .. } => {
                wip_id
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fault::OperationFailedToStartBecauseWipIsAlreadyInProcess { .. } => {
                "OperationFailedToStartBecauseWipIsAlreadyInProcess"
            }
            Fault::OperationFailedToStartBecauseMaterialIsNotValidForRoute { .. } => {
                "OperationFailedToStartBecauseMaterialIsNotValidForRoute"
            }
        }
    }
}

/// Consistency anomalies. They never halt a saga; they point at a
/// correlation or ordering problem upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "anomaly")]
pub enum Anomaly {
    DuplicateEnqueue { wip_id: WipId, route_step_id: RouteStepId },
    DequeueMismatch { wip_id: WipId, route_step_id: RouteStepId },
    UnexpectedPartAssembled { wip_id: WipId, material_id: MaterialId },
    UnexpectedPartDisassembled { wip_id: WipId, material_id: MaterialId },
    DuplicateCompletion { wip_id: WipId, route_step_id: RouteStepId },
    UnknownRoute { wip_id: WipId, route_id: RouteId },
    /// A start for a unit that is not, or is already, in process there.
    DuplicateStart { wip_id: WipId, route_step_id: RouteStepId },
    /// An outcome for a step the unit is not in process at.
    StaleOutcome { wip_id: WipId, route_step_id: RouteStepId },
}

impl Anomaly {
    pub fn wip_id(&self) -> &WipId {
        match self {
            Anomaly::DuplicateEnqueue { wip_id, .. }
            | Anomaly::DequeueMismatch { wip_id, .. }
            | Anomaly::UnexpectedPartAssembled { wip_id, .. }
            | Anomaly::UnexpectedPartDisassembled { wip_id, .. }
            | Anomaly::DuplicateCompletion { wip_id, .. }
            | Anomaly::UnknownRoute { wip_id, .. }
            | Anomaly::DuplicateStart { wip_id, .. }
            | Anomaly::StaleOutcome { wip_id, .. } => wip_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Anomaly::DuplicateEnqueue { .. } => "DuplicateEnqueue",
            Anomaly::DequeueMismatch { .. } => "DequeueMismatch",
            Anomaly::UnexpectedPartAssembled { .. } => "UnexpectedPartAssembled",
            Anomaly::UnexpectedPartDisassembled { .. } => "UnexpectedPartDisassembled",
            Anomaly::DuplicateCompletion { .. } => "DuplicateCompletion",
            Anomaly::UnknownRoute { .. } => "UnknownRoute",
            Anomaly::DuplicateStart { .. } => "DuplicateStart",
            Anomaly::StaleOutcome { .. } => "StaleOutcome",
        }
    }
}

/// Delayed self-messages of the stage simulator. Each stands in for the
/// latency of a real station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "continuation")]
pub enum Continuation {
    AssembleStartDelayExpired { wip_id: WipId },
    AssembleDelayExpired { wip_id: WipId },
    PackoutDelayExpired { wip_id: WipId },
    ScrapDelayExpired { wip_id: WipId },
}

impl Continuation {
    pub fn wip_id(&self) -> &WipId {
        match self {
            Continuation::AssembleStartDelayExpired { wip_id }
            | Continuation::AssembleDelayExpired { wip_id }
            | Continuation::PackoutDelayExpired { wip_id }
            | Continuation::ScrapDelayExpired { wip_id } => wip_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Continuation::AssembleStartDelayExpired { .. } => "AssembleStartDelayExpired",
            Continuation::AssembleDelayExpired { .. } => "AssembleDelayExpired",
            Continuation::PackoutDelayExpired { .. } => "PackoutDelayExpired",
            Continuation::ScrapDelayExpired { .. } => "ScrapDelayExpired",
        }
    }
}

/// Envelope for everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(Command),
    Event(Event),
    Continuation(Continuation),
}

impl Message {
    /// Correlation key of the message.
    pub fn wip_id(&self) -> &WipId {
        match self {
            Message::Command(command) => command.wip_id(),
            Message::Event(event) => event.wip_id(),
            Message::Continuation(continuation) => continuation.wip_id(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Command(command) => command.name(),
            Message::Event(event) => event.name(),
            Message::Continuation(continuation) => continuation.name(),
        }
    }
}

/// Change requested on the durable unit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordUpdate {
    ClearStation,
    ClearStationAndComplete,
}

/// Side effects requested by a transition. Handlers are pure; the runtime
/// performs these after the new state has been stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Command),
    Publish(Event),
    RequestContinuation { delay: Duration, continuation: Continuation },
    UpdateRecord { wip_id: WipId, update: RecordUpdate },
}
