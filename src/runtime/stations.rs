//! Simulated stage stations. Each stage command is acknowledged with the
//! matching stage event; moves also record the unit's new station.

use std::sync::Arc;

use super::repository::{update_record, RepositoryError, Station, WipRecordRepository};
use crate::ids::WipId;
use crate::messages::{Command, Event};

pub struct SimulatedStations {
    repository: Arc<dyn WipRecordRepository>,
}

impl SimulatedStations {
    pub fn new(repository: Arc<dyn WipRecordRepository>) -> Self {
        Self { repository }
    }

    /// `Ok(None)` for commands that are not addressed to a station.
    pub async fn handle(&self, command: &Command) -> Result<Option<Event>, RepositoryError> {
        let event = match command {
            Command::MoveWipToAssemble { wip_id } => {
                self.move_to(wip_id, Station::Assemble).await?;
                Event::WipMovedToAssemble { wip_id: wip_id.clone() }
            }
            Command::MoveWipToPackout { wip_id } => {
                self.move_to(wip_id, Station::Packout).await?;
                Event::WipMovedToPackout { wip_id: wip_id.clone() }
            }
            Command::MoveWipToScrap { wip_id } => {
                self.move_to(wip_id, Station::Scrap).await?;
                Event::WipMovedToScrap { wip_id: wip_id.clone() }
            }
            Command::StartAssemble { wip_id } => Event::AssembleStarted { wip_id: wip_id.clone() },
            Command::PassAssemble { wip_id } => Event::AssemblePassed { wip_id: wip_id.clone() },
            Command::FailAssemble { wip_id } => Event::AssembleFailed { wip_id: wip_id.clone() },
            Command::PackWip { wip_id } => Event::WipPacked { wip_id: wip_id.clone() },
            Command::ScrapWip { wip_id } => Event::WipScrapped { wip_id: wip_id.clone() },
            Command::EnqueueWipAtRouteStep { .. }
            | Command::DequeueWipAtRouteStep { .. }
            | Command::StartWipAtOperation(_)
            | Command::CompleteAssemble(_) => return Ok(None),
        };
        Ok(Some(event))
    }

    async fn move_to(&self, wip_id: &WipId, station: Station) -> Result<(), RepositoryError> {
        update_record(self.repository.as_ref(), wip_id, move |record| record.at_station(station)).await?;
        tracing::debug!(wip_id = %wip_id, ?station, "Unit moved to station");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::repository::InMemoryWipRecordRepository;

    #[tokio::test]
    async fn test_move_records_station_and_acknowledges() {
        let repository = Arc::new(InMemoryWipRecordRepository::new());
        let stations = SimulatedStations::new(repository.clone());
        let wip_id = WipId::from("W1");

        let event = stations
            .handle(&Command::MoveWipToScrap { wip_id: wip_id.clone() })
            .await
            .unwrap();

        assert_eq!(event, Some(Event::WipMovedToScrap { wip_id: wip_id.clone() }));
        let record = repository.get(&wip_id).await.unwrap().unwrap();
        assert_eq!(record.station, Some(Station::Scrap));
    }

    #[tokio::test]
    async fn test_route_commands_are_not_for_stations() {
        let stations = SimulatedStations::new(Arc::new(InMemoryWipRecordRepository::new()));
        let command = Command::EnqueueWipAtRouteStep {
            wip_id: WipId::from("W1"),
            route_step_id: "S1".into(),
        };
        assert_eq!(stations.handle(&command).await.unwrap(), None);
    }
}
