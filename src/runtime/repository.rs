//! Durable unit record store, as seen by the stage simulator and stations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::ids::WipId;
use crate::messages::RecordUpdate;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("unit record I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unit record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Station {
    Assemble,
    Packout,
    Scrap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipRecord {
    pub wip_id: WipId,
    /// Station the unit physically sits at; `None` between stations.
    pub station: Option<Station>,
    pub is_complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl WipRecord {
    pub fn new(wip_id: WipId) -> Self {
        Self {
            wip_id,
            station: None,
            is_complete: false,
            updated_at: Utc::now(),
        }
    }

    pub fn at_station(mut self, station: Station) -> Self {
        self.station = Some(station);
        self.updated_at = Utc::now();
        self
    }

    pub fn apply(mut self, update: RecordUpdate) -> Self {
        self.station = None;
        if update == RecordUpdate::ClearStationAndComplete {
            self.is_complete = true;
        }
        self.updated_at = Utc::now();
        self
    }
}

/// Trait for unit record persistence
#[async_trait]
pub trait WipRecordRepository: Send + Sync {
    async fn get(&self, wip_id: &WipId) -> Result<Option<WipRecord>, RepositoryError>;

    async fn save(&self, record: WipRecord) -> Result<(), RepositoryError>;
}

/// Read-modify-write; a missing record starts from a fresh one.
pub async fn update_record<F>(
    repository: &dyn WipRecordRepository,
    wip_id: &WipId,
    change: F,
) -> Result<WipRecord, RepositoryError>
where
    F: FnOnce(WipRecord) -> WipRecord + Send,
{
    let record = repository
        .get(wip_id)
        .await?
        .unwrap_or_else(|| WipRecord::new(wip_id.clone()));
    let record = change(record);
    repository.save(record.clone()).await?;
    Ok(record)
}

#[derive(Debug, Default)]
pub struct InMemoryWipRecordRepository {
    records: RwLock<HashMap<WipId, WipRecord>>,
}

impl InMemoryWipRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WipRecordRepository for InMemoryWipRecordRepository {
    async fn get(&self, wip_id: &WipId) -> Result<Option<WipRecord>, RepositoryError> {
        Ok(self.records.read().await.get(wip_id).cloned())
    }

    async fn save(&self, record: WipRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.wip_id.clone(), record);
        Ok(())
    }
}

/// One pretty-printed JSON file per unit, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileWipRecordRepository {
    directory: PathBuf,
}

impl JsonFileWipRecordRepository {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, wip_id: &WipId) -> PathBuf {
        self.directory.join(format!("{wip_id}.json"))
    }
}

#[async_trait]
impl WipRecordRepository for JsonFileWipRecordRepository {
    async fn get(&self, wip_id: &WipId) -> Result<Option<WipRecord>, RepositoryError> {
        let contents = match fs::read_to_string(self.record_path(wip_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, record: WipRecord) -> Result<(), RepositoryError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.record_path(&record.wip_id);
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(&record)?).await?;
        fs::rename(&temp, &path).await?;
        tracing::debug!(wip_id = %record.wip_id, path = %path.display(), "Unit record saved");
        Ok(())
    }
}
