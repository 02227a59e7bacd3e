use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::{load_route_graph, Command};
use crate::broadcast::{spawn_viewer_forwarder, JsonLinesSink};
use crate::config::WipRoutingConfig;
use crate::ids::WipId;
use crate::messages::Event;
use crate::observability::OperationTimer;
use crate::runtime::WipRuntime;
use crate::stage::SimulatedOutcome;

/// Continuations a unit sleeps through between release and pack or scrap.
const DELAYS_PER_UNIT: u64 = 3;

pub struct SimulateCommand {
    pub units: u32,
    config: WipRoutingConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct StageTally {
    packed: usize,
    scrapped: usize,
}

impl SimulateCommand {
    pub fn new(units: u32, config: WipRoutingConfig) -> Self {
        Self { units, config }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if seed.is_some() {
            self.config.simulation.seed = seed;
        }
        self
    }

    pub fn with_outcome(mut self, outcome: Option<SimulatedOutcome>) -> Self {
        if outcome.is_some() {
            self.config.simulation.forced_assembly_outcome = outcome;
        }
        self
    }

    /// Units run concurrently, so the budget does not grow with their number.
    fn drain_timeout(&self) -> Duration {
        let slowest = self.config.simulation.max_delay_ms.saturating_mul(DELAYS_PER_UNIT * 2);
        Duration::from_millis(slowest) + Duration::from_secs(5)
    }
}

impl Command for SimulateCommand {
    async fn execute(&self) -> Result<()> {
        let timer = OperationTimer::new("simulate");
        let graph = Arc::new(load_route_graph(None, &self.config)?);
        let runtime = WipRuntime::start(graph, &self.config);
        let forwarder = spawn_viewer_forwarder(runtime.subscribe(), Arc::new(JsonLinesSink::stdout()));
        let mut outcomes = runtime.subscribe();

        for _ in 0..self.units {
            let wip_id = WipId::generate();
            runtime.release_to_stages(&wip_id).await?;
        }
        tracing::info!(units = self.units, "Units released to the stage simulator");

        runtime.wait_idle(self.drain_timeout()).await?;
        let tally = tally(&mut outcomes);
        runtime.shutdown().await;
        let delivered = forwarder.await?;
        timer.finish();

        eprintln!(
            "✅ {} units finished: {} packed, {} scrapped ({} notifications)",
            self.units, tally.packed, tally.scrapped, delivered
        );
        Ok(())
    }
}

fn tally(events: &mut broadcast::Receiver<Event>) -> StageTally {
    let mut tally = StageTally::default();
    loop {
        match events.try_recv() {
            Ok(Event::WipPacked { .. }) => tally.packed += 1,
            Ok(Event::WipScrapped { .. }) => tally.scrapped += 1,
            Ok(_) => {}
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Outcome tally missed events");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_terminal_stage_events() {
        let (sender, mut receiver) = broadcast::channel(8);
        sender.send(Event::WipPacked { wip_id: WipId::from("W1") }).unwrap();
        sender.send(Event::AssembleFailed { wip_id: WipId::from("W2") }).unwrap();
        sender.send(Event::WipScrapped { wip_id: WipId::from("W2") }).unwrap();

        assert_eq!(tally(&mut receiver), StageTally { packed: 1, scrapped: 1 });
    }

    #[test]
    fn test_flags_override_configuration() {
        let command = SimulateCommand::new(2, WipRoutingConfig::default())
            .with_seed(Some(7))
            .with_outcome(Some(SimulatedOutcome::Fail));
        assert_eq!(command.config.simulation.seed, Some(7));
        assert_eq!(command.config.simulation.forced_assembly_outcome, Some(SimulatedOutcome::Fail));

        let untouched = SimulateCommand::new(1, WipRoutingConfig::default()).with_seed(None);
        assert_eq!(untouched.config.simulation.seed, None);
    }
}
