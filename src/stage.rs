//! Stage simulator: the top-level per-unit orchestrator.
//!
//! Drives a released unit through assemble, then packout on pass or scrap on
//! fail. Delayed continuations stand in for the latency of real stations.
//! Randomness never happens inside a transition; the runtime draws a
//! [`SimulationPlan`] per message and hands it in through the context.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::time::Duration;

use crate::config::SimulationSettings;
use crate::ids::WipId;
use crate::messages::{Command, Continuation, Effect, Event, Message, RecordUpdate};
use crate::saga::SagaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedOutcome {
    Pass,
    Fail,
}

/// Values a transition may need that would otherwise be random.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationPlan {
    pub delay: Duration,
    pub assembly_passes: bool,
}

impl SimulationPlan {
    pub fn new(delay: Duration, outcome: SimulatedOutcome) -> Self {
        Self {
            delay,
            assembly_passes: outcome == SimulatedOutcome::Pass,
        }
    }
}

/// Seedable source of simulation plans.
#[derive(Debug)]
pub struct SimulationRng {
    rng: StdRng,
    min_delay_ms: u64,
    max_delay_ms: u64,
    pass_probability: f64,
    forced: Option<SimulatedOutcome>,
}

/// `random_bool` panics outside `[0, 1]`; NaN falls back to the default.
fn pass_probability(configured: f64) -> f64 {
    if configured.is_nan() {
        return SimulationSettings::default().assembly_pass_probability;
    }
    configured.clamp(0.0, 1.0)
}

impl SimulationRng {
    pub fn new(settings: &SimulationSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let min_delay_ms = settings.min_delay_ms.min(settings.max_delay_ms);
        Self {
            rng,
            min_delay_ms,
            max_delay_ms: settings.max_delay_ms.max(min_delay_ms),
            pass_probability: pass_probability(settings.assembly_pass_probability),
            forced: settings.forced_assembly_outcome,
        }
    }

    pub fn draw(&mut self) -> SimulationPlan {
        let delay = Duration::from_millis(self.rng.random_range(self.min_delay_ms..=self.max_delay_ms));
        let outcome = match self.forced {
            Some(outcome) => outcome,
            None if self.rng.random_bool(self.pass_probability) => SimulatedOutcome::Pass,
            None => SimulatedOutcome::Fail,
        };
        SimulationPlan::new(delay, outcome)
    }
}

/// Per-message input to the state machine; collects what the transition
/// asks the runtime to do.
#[derive(Debug)]
pub struct StageContext {
    pub plan: SimulationPlan,
    pub effects: Vec<Effect>,
}

impl StageContext {
    pub fn new(plan: SimulationPlan) -> Self {
        Self {
            plan,
            effects: Vec::new(),
        }
    }

    fn send(&mut self, command: Command) {
        self.effects.push(Effect::Send(command));
    }

    fn continue_after_delay(&mut self, continuation: Continuation) {
        self.effects.push(Effect::RequestContinuation {
            delay: self.plan.delay,
            continuation,
        });
    }

    fn update_record(&mut self, wip_id: &WipId, update: RecordUpdate) {
        self.effects.push(Effect::UpdateRecord {
            wip_id: wip_id.clone(),
            update,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    AwaitingRelease,
    MovingToAssemble,
    AwaitingAssembleStart,
    StartingAssemble,
    Assembling,
    AwaitingAssembleResult,
    MovingToPackout,
    Packing,
    AwaitingPacked,
    MovingToScrap,
    Scrapping,
    AwaitingScrapped,
    Completed,
}

#[derive(Debug)]
pub struct StageSaga {
    wip_id: WipId,
}

#[state_machine(initial = "State::awaiting_release()", state(derive(Debug)))]
impl StageSaga {
    #[state]
    fn awaiting_release(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipReleased { .. }) => {
                tracing::info!(wip_id = %self.wip_id, "Unit released to stages");
                context.send(Command::MoveWipToAssemble { wip_id: self.wip_id.clone() });
                Transition(State::moving_to_assemble())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn moving_to_assemble(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipMovedToAssemble { .. }) => {
                tracing::info!(wip_id = %self.wip_id, delay_ms = context.plan.delay.as_millis() as u64, "Moved to assemble");
                context.continue_after_delay(Continuation::AssembleStartDelayExpired { wip_id: self.wip_id.clone() });
                Transition(State::awaiting_assemble_start())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn awaiting_assemble_start(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Continuation(Continuation::AssembleStartDelayExpired { .. }) => {
                context.send(Command::StartAssemble { wip_id: self.wip_id.clone() });
                Transition(State::starting_assemble())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn starting_assemble(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::AssembleStarted { .. }) => {
                tracing::info!(wip_id = %self.wip_id, delay_ms = context.plan.delay.as_millis() as u64, "Assembly started");
                context.continue_after_delay(Continuation::AssembleDelayExpired { wip_id: self.wip_id.clone() });
                Transition(State::assembling())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn assembling(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Continuation(Continuation::AssembleDelayExpired { .. }) => {
                let wip_id = self.wip_id.clone();
                let passes = context.plan.assembly_passes;
                tracing::info!(wip_id = %self.wip_id, passes, "Assembly delay expired");
                if passes {
                    context.send(Command::PassAssemble { wip_id });
                } else {
                    context.send(Command::FailAssemble { wip_id });
                }
                Transition(State::awaiting_assemble_result())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn awaiting_assemble_result(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::AssemblePassed { .. }) => {
                context.update_record(&self.wip_id, RecordUpdate::ClearStation);
                context.send(Command::MoveWipToPackout { wip_id: self.wip_id.clone() });
                Transition(State::moving_to_packout())
            }
            Message::Event(Event::AssembleFailed { .. }) => {
                tracing::info!(wip_id = %self.wip_id, "Assembly failed, routing to scrap");
                context.update_record(&self.wip_id, RecordUpdate::ClearStation);
                context.send(Command::MoveWipToScrap { wip_id: self.wip_id.clone() });
                Transition(State::moving_to_scrap())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn moving_to_packout(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipMovedToPackout { .. }) => {
                context.continue_after_delay(Continuation::PackoutDelayExpired { wip_id: self.wip_id.clone() });
                Transition(State::packing())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn packing(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Continuation(Continuation::PackoutDelayExpired { .. }) => {
                context.send(Command::PackWip { wip_id: self.wip_id.clone() });
                Transition(State::awaiting_packed())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn awaiting_packed(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipPacked { .. }) => {
                tracing::info!(wip_id = %self.wip_id, "Unit packed");
                context.update_record(&self.wip_id, RecordUpdate::ClearStationAndComplete);
                Transition(State::completed())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn moving_to_scrap(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipMovedToScrap { .. }) => {
                context.continue_after_delay(Continuation::ScrapDelayExpired { wip_id: self.wip_id.clone() });
                Transition(State::scrapping())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn scrapping(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Continuation(Continuation::ScrapDelayExpired { .. }) => {
                context.send(Command::ScrapWip { wip_id: self.wip_id.clone() });
                Transition(State::awaiting_scrapped())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn awaiting_scrapped(&mut self, context: &mut StageContext, event: &Message) -> Outcome<State> {
        match event {
            Message::Event(Event::WipScrapped { .. }) => {
                tracing::info!(wip_id = %self.wip_id, "Unit scrapped");
                context.update_record(&self.wip_id, RecordUpdate::ClearStationAndComplete);
                Transition(State::completed())
            }
            _ => self.ignore(event),
        }
    }

    #[state]
    fn completed(&mut self, event: &Message) -> Outcome<State> {
        self.ignore(event)
    }
}

impl StageSaga {
    fn ignore(&self, message: &Message) -> Outcome<State> {
        tracing::debug!(wip_id = %self.wip_id, message = message.name(), "Stage saga ignored message");
        Handled
    }
}

/// Owns one unit's stage state machine.
pub struct StageSimulator {
    wip_id: WipId,
    machine: StateMachine<StageSaga>,
}

impl StageSimulator {
    pub fn new(wip_id: WipId) -> Self {
        Self {
            machine: StageSaga { wip_id: wip_id.clone() }.state_machine(),
            wip_id,
        }
    }

    pub fn wip_id(&self) -> &WipId {
        &self.wip_id
    }

    /// Feed one message through the machine and return the effects it
    /// requested.
    pub fn handle(&mut self, message: &Message, plan: SimulationPlan) -> Vec<Effect> {
        let mut context = StageContext::new(plan);
        self.machine.handle_with_context(message, &mut context);
        context.effects
    }

    pub fn phase(&self) -> StagePhase {
        match self.machine.state() {
            State::AwaitingRelease { .. } => StagePhase::AwaitingRelease,
            State::MovingToAssemble { .. } => StagePhase::MovingToAssemble,
            State::AwaitingAssembleStart { .. } => StagePhase::AwaitingAssembleStart,
            State::StartingAssemble { .. } => StagePhase::StartingAssemble,
            State::Assembling { .. } => StagePhase::Assembling,
            State::AwaitingAssembleResult { .. } => StagePhase::AwaitingAssembleResult,
            State::MovingToPackout { .. } => StagePhase::MovingToPackout,
            State::Packing { .. } => StagePhase::Packing,
            State::AwaitingPacked { .. } => StagePhase::AwaitingPacked,
            State::MovingToScrap { .. } => StagePhase::MovingToScrap,
            State::Scrapping { .. } => StagePhase::Scrapping,
            State::AwaitingScrapped { .. } => StagePhase::AwaitingScrapped,
            State::Completed { .. } => StagePhase::Completed,
        }
    }
}

impl SagaState for StageSimulator {
    fn is_complete(&self) -> bool {
        self.phase() == StagePhase::Completed
    }
}
