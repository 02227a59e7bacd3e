//! Message router and saga host.
//!
//! A single dispatcher drains the bus and spawns one task per message. Each
//! task extracts the correlation key, locks that correlation's state, runs
//! the pure transition, stores the result and then performs the effects.

pub mod bus;
pub mod repository;
pub mod stations;
pub mod store;

use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::assembly::{AssembleState, AssemblyInput, AssemblyKey, IncompleteAssemblyPolicy};
use crate::config::WipRoutingConfig;
use crate::ids::{RouteId, WipId};
use crate::messages::{Anomaly, Command, Continuation, Effect, Event, Message, Operation, OperationOutcome};
use crate::observability::{create_saga_span, RuntimeMetrics, RuntimeStats};
use crate::routing::graph::RouteGraph;
use crate::routing::guard::OperationGuard;
use crate::routing::projection::WipState;
use crate::routing::saga::RoutingSagaState;
use crate::saga::{SagaState, Transition};
use crate::stage::{SimulationPlan, SimulationRng, StagePhase, StageSimulator};

use bus::{ChannelBus, MessageBus};
use repository::{
    update_record, InMemoryWipRecordRepository, JsonFileWipRecordRepository, RepositoryError, WipRecord,
    WipRecordRepository,
};
use stations::SimulatedStations;
use store::SagaStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("message bus is closed")]
    BusClosed,
    #[error("runtime still busy after {timeout:?} with {in_flight} messages in flight")]
    DrainTimeout { timeout: Duration, in_flight: usize },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Which assembly instance of a unit is open, and the next instance number.
#[derive(Debug, Clone, Copy, Default)]
struct AssemblyIndex {
    next_instance: u32,
    active: Option<u32>,
}

struct Inner {
    graph: Arc<RouteGraph>,
    default_policy: IncompleteAssemblyPolicy,
    bus: ChannelBus,
    units: SagaStore<WipId, WipState>,
    routing: SagaStore<WipId, RoutingSagaState>,
    assembly_index: SagaStore<WipId, AssemblyIndex>,
    assembly: SagaStore<AssemblyKey, AssembleState>,
    stages: SagaStore<WipId, StageSimulator>,
    rng: Mutex<SimulationRng>,
    stations: SimulatedStations,
    repository: Arc<dyn WipRecordRepository>,
    events: broadcast::Sender<Event>,
    metrics: RuntimeMetrics,
}

pub struct WipRuntime {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
}

impl WipRuntime {
    /// Start the runtime with the configured unit record store: JSON files
    /// when a records directory is set, memory otherwise.
    pub fn start(graph: Arc<RouteGraph>, config: &WipRoutingConfig) -> Self {
        let repository: Arc<dyn WipRecordRepository> = match &config.simulation.records_directory {
            Some(directory) => Arc::new(JsonFileWipRecordRepository::new(directory)),
            None => Arc::new(InMemoryWipRecordRepository::new()),
        };
        Self::start_with_repository(graph, config, repository)
    }

    pub fn start_with_repository(
        graph: Arc<RouteGraph>,
        config: &WipRoutingConfig,
        repository: Arc<dyn WipRecordRepository>,
    ) -> Self {
        let (bus, receiver) = ChannelBus::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            graph,
            default_policy: config.routing.incomplete_assembly_policy,
            bus,
            units: SagaStore::new(),
            routing: SagaStore::new(),
            assembly_index: SagaStore::new(),
            assembly: SagaStore::new(),
            stages: SagaStore::new(),
            rng: Mutex::new(SimulationRng::new(&config.simulation)),
            stations: SimulatedStations::new(repository.clone()),
            repository,
            events,
            metrics: RuntimeMetrics::new(),
        });

        let dispatcher = tokio::spawn(run_dispatcher(inner.clone(), receiver));
        tracing::info!(route_id = %inner.graph.route_id(), "Routing runtime started");
        Self { inner, dispatcher }
    }

    pub fn graph(&self) -> &RouteGraph {
        &self.inner.graph
    }

    /// Release a unit onto a route; the routing saga takes it from there.
    pub fn release_to_route(&self, wip_id: &WipId, route_id: &RouteId) -> Result<(), RuntimeError> {
        self.inner.bus.publish(Event::WipReleasedToRoute {
            wip_id: wip_id.clone(),
            route_id: route_id.clone(),
        })
    }

    /// Release a unit to the stage simulator with a fresh unit record.
    pub async fn release_to_stages(&self, wip_id: &WipId) -> Result<(), RuntimeError> {
        self.inner.repository.save(WipRecord::new(wip_id.clone())).await?;
        self.inner.bus.publish(Event::WipReleased { wip_id: wip_id.clone() })
    }

    pub fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.inner.bus.send(command)
    }

    pub fn publish(&self, event: Event) -> Result<(), RuntimeError> {
        self.inner.bus.publish(event)
    }

    /// Deliver `continuation` to the stage simulator after `delay`.
    pub fn request_continuation(&self, delay: Duration, continuation: Continuation) -> Result<(), RuntimeError> {
        self.inner.bus.request_continuation(delay, continuation)?;
        self.inner.metrics.record_continuation_scheduled();
        Ok(())
    }

    /// Every event handled from now on, in handling order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn wip_state(&self, wip_id: &WipId) -> Option<WipState> {
        self.inner.units.snapshot(wip_id).await
    }

    pub async fn routing_state(&self, wip_id: &WipId) -> Option<RoutingSagaState> {
        self.inner.routing.snapshot(wip_id).await
    }

    /// The unit's most recent assembly tracker.
    pub async fn assembly_state(&self, wip_id: &WipId) -> Option<AssembleState> {
        let index = self.inner.assembly_index.snapshot(wip_id).await?;
        let instance = index.next_instance.checked_sub(1)?;
        let key = AssemblyKey {
            wip_id: wip_id.clone(),
            instance,
        };
        self.inner.assembly.snapshot(&key).await
    }

    pub async fn stage_phase(&self, wip_id: &WipId) -> Option<StagePhase> {
        self.inner.stages.lock(wip_id).await.as_ref().map(StageSimulator::phase)
    }

    pub async fn record(&self, wip_id: &WipId) -> Result<Option<WipRecord>, RuntimeError> {
        Ok(self.inner.repository.get(wip_id).await?)
    }

    pub fn metrics(&self) -> RuntimeStats {
        self.inner.metrics.get_stats()
    }

    /// Wait until no message is queued or being handled and no
    /// continuation is pending.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let in_flight = self.inner.bus.in_flight();
        tokio::time::timeout(timeout, in_flight.wait_idle())
            .await
            .map_err(|_| RuntimeError::DrainTimeout {
                timeout,
                in_flight: in_flight.current(),
            })
    }

    /// Stop dispatching. Continuations still sleeping are dropped.
    pub async fn shutdown(mut self) {
        self.dispatcher.abort();
        if let Err(e) = (&mut self.dispatcher).await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Dispatcher task failed");
            }
        }
        self.inner.metrics.log_stats();
        tracing::info!(
            units = self.inner.units.tracked(),
            stage_sagas = self.inner.stages.tracked(),
            "Routing runtime stopped"
        );
    }
}

impl Drop for WipRuntime {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn run_dispatcher(inner: Arc<Inner>, mut receiver: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = receiver.recv().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            let span = create_saga_span(message.name(), message.wip_id().as_str());
            if let Err(e) = inner.dispatch(&message).instrument(span).await {
                inner.metrics.record_handler_error();
                tracing::error!(
                    wip_id = %message.wip_id(),
                    message = message.name(),
                    error = %e,
                    "Message handler failed"
                );
            }
            inner.bus.message_handled();
        });
    }
}

impl Inner {
    async fn dispatch(&self, message: &Message) -> Result<(), RuntimeError> {
        self.metrics.record_message();
        match message {
            Message::Command(command) => self.handle_command(command).await,
            Message::Event(event) => self.handle_event(event).await,
            Message::Continuation(_) => self.handle_stage_message(message).await,
        }
    }

    async fn handle_command(&self, command: &Command) -> Result<(), RuntimeError> {
        match command {
            Command::EnqueueWipAtRouteStep { wip_id, .. } | Command::DequeueWipAtRouteStep { wip_id, .. } => {
                let mut slot = self.units.lock(wip_id).await;
                let state = slot.take().unwrap_or_else(|| WipState::new(wip_id.clone()));
                let Transition { state, effects } = state.handle_queue_command(command);
                *slot = Some(state);
                drop(slot);
                self.perform(effects).await
            }
            Command::StartWipAtOperation(operation) => self.start_operation(operation).await,
            Command::CompleteAssemble(operation) => {
                self.handle_assembly(&operation.wip_id, AssemblyInput::Complete(operation.clone()))
                    .await
            }
            Command::MoveWipToAssemble { .. }
            | Command::MoveWipToPackout { .. }
            | Command::MoveWipToScrap { .. }
            | Command::StartAssemble { .. }
            | Command::PassAssemble { .. }
            | Command::FailAssemble { .. }
            | Command::PackWip { .. }
            | Command::ScrapWip { .. } => {
                if let Some(event) = self.stations.handle(command).await? {
                    self.bus.publish(event)?;
                }
                Ok(())
            }
        }
    }

    /// The guard's check and the started event's application happen under
    /// the unit's lock, so two concurrent starts cannot both succeed.
    async fn start_operation(&self, operation: &Operation) -> Result<(), RuntimeError> {
        let mut slot = self.units.lock(&operation.wip_id).await;
        let event = OperationGuard::new(&self.graph).start_operation(slot.as_ref(), operation);

        let effects = match event {
            Event::OperationStartedAtRouteStep(_) => {
                let state = slot.take().unwrap_or_else(|| WipState::new(operation.wip_id.clone()));
                let Transition { state, effects } = state.apply_and_publish(event);
                *slot = Some(state);
                effects
            }
            fault => vec![Effect::Publish(fault)],
        };
        drop(slot);
        self.perform(effects).await
    }

    async fn handle_event(&self, event: &Event) -> Result<(), RuntimeError> {
        // No subscribers is fine.
        let _ = self.events.send(event.clone());

        match event {
            Event::WipReleasedToRoute { wip_id, route_id } => {
                self.project_release(wip_id).await;
                self.release_routing(wip_id, route_id).await
            }
            Event::WipEnqueuedAtRouteStep { wip_id, .. } | Event::WipDequeuedAtRouteStep { wip_id, .. } => {
                self.route(wip_id, event).await
            }
            Event::OperationStartedAtRouteStep(operation) => {
                // The aggregate applied a real start before publishing it.
                let applied = self
                    .units
                    .snapshot(&operation.wip_id)
                    .await
                    .is_some_and(|state| state.is_in_process_at(&operation.route_step_id));
                if !applied {
                    let anomaly = Anomaly::DuplicateStart {
                        wip_id: operation.wip_id.clone(),
                        route_step_id: operation.route_step_id.clone(),
                    };
                    return self.perform(vec![Effect::Publish(Event::Anomaly(anomaly))]).await;
                }
                self.route(&operation.wip_id, event).await?;
                self.open_assembly(operation).await
            }
            Event::OperationPassedAtRouteStep(operation)
            | Event::OperationFailedAtRouteStep(operation)
            | Event::OperationAbortedAtRouteStep(operation) => {
                if !self.project_outcome(operation, event).await {
                    let anomaly = Anomaly::StaleOutcome {
                        wip_id: operation.wip_id.clone(),
                        route_step_id: operation.route_step_id.clone(),
                    };
                    return self.perform(vec![Effect::Publish(Event::Anomaly(anomaly))]).await;
                }
                self.route(&operation.wip_id, event).await?;
                if let Some((outcome, _)) = event.outcome() {
                    self.close_assembly(operation, outcome).await?;
                }
                Ok(())
            }
            Event::PartAssembled { wip_id, material_id } => {
                self.handle_assembly(wip_id, AssemblyInput::PartAssembled(material_id.clone()))
                    .await
            }
            Event::PartDisassembled { wip_id, material_id } => {
                self.handle_assembly(wip_id, AssemblyInput::PartDisassembled(material_id.clone()))
                    .await
            }
            Event::WipReleased { .. }
            | Event::WipMovedToAssemble { .. }
            | Event::AssembleStarted { .. }
            | Event::AssemblePassed { .. }
            | Event::AssembleFailed { .. }
            | Event::WipMovedToPackout { .. }
            | Event::WipPacked { .. }
            | Event::WipMovedToScrap { .. }
            | Event::WipScrapped { .. } => self.handle_stage_message(&Message::Event(event.clone())).await,
            Event::Fault(fault) => {
                self.metrics.record_fault(fault);
                Ok(())
            }
            Event::Anomaly(anomaly) => {
                self.metrics.record_anomaly(anomaly);
                Ok(())
            }
            Event::WipReachedEndOfRoute { .. } => Ok(()),
        }
    }

    /// Positional updates the aggregate did not already apply: release and
    /// operation outcomes.
    async fn project_release(&self, wip_id: &WipId) {
        let mut slot = self.units.lock(wip_id).await;
        if slot.is_some() {
            tracing::debug!(wip_id = %wip_id, "Unit already projected");
            return;
        }
        *slot = Some(WipState::new(wip_id.clone()));
    }

    /// Apply an outcome if the unit is in process at its step. Returns
    /// whether it was applied.
    async fn project_outcome(&self, operation: &Operation, event: &Event) -> bool {
        let mut slot = self.units.lock(&operation.wip_id).await;
        let Some(state) = slot.take() else {
            tracing::debug!(wip_id = %operation.wip_id, event = event.name(), "No projection for unreleased unit");
            return false;
        };
        let in_process_here = state.is_in_process_at(&operation.route_step_id);
        *slot = Some(if in_process_here { state.apply(event) } else { state });
        in_process_here
    }

    async fn release_routing(&self, wip_id: &WipId, route_id: &RouteId) -> Result<(), RuntimeError> {
        let mut slot = self.routing.lock(wip_id).await;
        if slot.is_some() {
            tracing::debug!(wip_id = %wip_id, "Routing saga already started");
            return Ok(());
        }
        let Transition { state, effects } = RoutingSagaState::release(wip_id, route_id, self.graph.as_ref());
        if state.is_some() {
            tracing::info!(wip_id = %wip_id, route_id = %route_id, "Unit released to route");
        }
        *slot = state;
        drop(slot);
        self.perform(effects).await
    }

    async fn route(&self, wip_id: &WipId, event: &Event) -> Result<(), RuntimeError> {
        let graph = self.graph.as_ref();
        self.advance(&self.routing, wip_id, "routing", |state| state.handle(event, graph))
            .await
    }

    /// Open a tracker when work starts at a step that assembles parts.
    async fn open_assembly(&self, operation: &Operation) -> Result<(), RuntimeError> {
        let Some(step) = self.graph.step(&operation.route_step_id) else {
            return Ok(());
        };
        if !step.requires_assembly() {
            return Ok(());
        }
        let policy = step.incomplete_assembly_policy.unwrap_or(self.default_policy);

        let mut index_slot = self.assembly_index.lock(&operation.wip_id).await;
        let mut index = (*index_slot).unwrap_or_default();
        if let Some(active) = index.active {
            tracing::debug!(wip_id = %operation.wip_id, instance = active, "Assembly already open");
            return Ok(());
        }
        let instance = index.next_instance;
        index.next_instance += 1;
        index.active = Some(instance);
        *index_slot = Some(index);

        let key = AssemblyKey {
            wip_id: operation.wip_id.clone(),
            instance,
        };
        *self.assembly.lock(&key).await = Some(AssembleState::start(
            operation,
            step.materials_to_assemble.clone(),
            policy,
        ));
        tracing::info!(
            wip_id = %operation.wip_id,
            route_step_id = %operation.route_step_id,
            instance,
            materials = step.materials_to_assemble.len(),
            "Assembly opened"
        );
        Ok(())
    }

    async fn handle_assembly(&self, wip_id: &WipId, input: AssemblyInput) -> Result<(), RuntimeError> {
        let index_slot = self.assembly_index.lock(wip_id).await;
        let Some(instance) = (*index_slot).and_then(|index| index.active) else {
            drop(index_slot);
            let anomaly = match input {
                AssemblyInput::PartAssembled(material_id) => Anomaly::UnexpectedPartAssembled {
                    wip_id: wip_id.clone(),
                    material_id,
                },
                AssemblyInput::PartDisassembled(material_id) => Anomaly::UnexpectedPartDisassembled {
                    wip_id: wip_id.clone(),
                    material_id,
                },
                AssemblyInput::Complete(operation) => Anomaly::DuplicateCompletion {
                    wip_id: wip_id.clone(),
                    route_step_id: operation.route_step_id,
                },
                AssemblyInput::OperationEnded(_) => return Ok(()),
            };
            return self.perform(vec![Effect::Publish(Event::Anomaly(anomaly))]).await;
        };

        let key = AssemblyKey {
            wip_id: wip_id.clone(),
            instance,
        };
        self.advance(&self.assembly, &key, "assembly", |state| state.handle(&input))
            .await
    }

    /// An outcome at the tracker's own step terminates it.
    async fn close_assembly(&self, operation: &Operation, outcome: OperationOutcome) -> Result<(), RuntimeError> {
        let mut index_slot = self.assembly_index.lock(&operation.wip_id).await;
        let Some(mut index) = *index_slot else {
            return Ok(());
        };
        let Some(instance) = index.active else {
            return Ok(());
        };

        let key = AssemblyKey {
            wip_id: operation.wip_id.clone(),
            instance,
        };
        let at_step = self
            .assembly
            .lock(&key)
            .await
            .as_ref()
            .is_some_and(|state| state.route_step_id == operation.route_step_id);
        if !at_step {
            return Ok(());
        }

        self.advance(&self.assembly, &key, "assembly", |state| {
            state.handle(&AssemblyInput::OperationEnded(outcome))
        })
        .await?;
        index.active = None;
        *index_slot = Some(index);
        Ok(())
    }

    async fn handle_stage_message(&self, message: &Message) -> Result<(), RuntimeError> {
        let wip_id = message.wip_id();
        let mut slot = self.stages.lock(wip_id).await;
        if slot.is_none() && matches!(message, Message::Event(Event::WipReleased { .. })) {
            *slot = Some(StageSimulator::new(wip_id.clone()));
        }

        let Some(simulator) = slot.as_mut().filter(|simulator| !simulator.is_complete()) else {
            if let Message::Continuation(continuation) = message {
                self.metrics.record_continuation_dropped();
                tracing::debug!(
                    wip_id = %wip_id,
                    continuation = continuation.name(),
                    "Continuation dropped, stage saga not active"
                );
            } else {
                tracing::debug!(wip_id = %wip_id, message = message.name(), "No active stage saga");
            }
            return Ok(());
        };

        let effects = simulator.handle(message, self.draw_plan());
        if simulator.is_complete() {
            self.metrics.record_saga_completed();
            tracing::info!(wip_id = %wip_id, saga = "stage", "Saga completed");
        }
        drop(slot);
        self.perform(effects).await
    }

    fn draw_plan(&self) -> SimulationPlan {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .draw()
    }

    /// Load, transition and store one saga, then perform its effects.
    /// Messages for sagas that never started or already completed are
    /// dropped.
    async fn advance<K, S, F>(
        &self,
        store: &SagaStore<K, S>,
        key: &K,
        saga: &'static str,
        handle: F,
    ) -> Result<(), RuntimeError>
    where
        K: Eq + Hash + Clone,
        S: SagaState,
        F: FnOnce(S) -> Transition<S>,
    {
        let mut slot = store.lock(key).await;
        let Some(state) = slot.take() else {
            tracing::debug!(saga, "No saga for message");
            return Ok(());
        };
        if state.is_complete() {
            *slot = Some(state);
            tracing::debug!(saga, "Saga already complete, message dropped");
            return Ok(());
        }

        let Transition { state, effects } = handle(state);
        if state.is_complete() {
            self.metrics.record_saga_completed();
            tracing::info!(saga, "Saga completed");
        }
        *slot = Some(state);
        drop(slot);
        self.perform(effects).await
    }

    async fn perform(&self, effects: Vec<Effect>) -> Result<(), RuntimeError> {
        for effect in effects {
            match effect {
                Effect::Send(command) => self.bus.send(command)?,
                Effect::Publish(event) => self.bus.publish(event)?,
                Effect::RequestContinuation { delay, continuation } => {
                    self.bus.request_continuation(delay, continuation)?;
                    self.metrics.record_continuation_scheduled();
                }
                Effect::UpdateRecord { wip_id, update } => {
                    update_record(self.repository.as_ref(), &wip_id, move |record| record.apply(update)).await?;
                }
            }
        }
        Ok(())
    }
}
