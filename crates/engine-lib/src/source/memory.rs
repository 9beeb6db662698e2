//! In-memory time series source

use super::{async_trait, project_drivers, TimeSeriesSource};
use crate::error::{EngineError, Result};
use crate::models::Reading;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Readings held in memory, kept sorted by timestamp per machine
#[derive(Debug, Default)]
pub struct InMemorySource {
    readings: DashMap<String, Vec<Reading>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reading for a machine
    pub fn push(&self, machine_id: &str, reading: Reading) {
        let mut entry = self.readings.entry(machine_id.to_string()).or_default();
        let pos = entry.partition_point(|r| r.timestamp <= reading.timestamp);
        entry.insert(pos, reading);
    }

    pub fn extend(&self, machine_id: &str, readings: impl IntoIterator<Item = Reading>) {
        for reading in readings {
            self.push(machine_id, reading);
        }
    }

    /// Drop all readings for a machine
    pub fn clear(&self, machine_id: &str) {
        self.readings.remove(machine_id);
    }

    pub fn len(&self, machine_id: &str) -> usize {
        self.readings.get(machine_id).map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TimeSeriesSource for InMemorySource {
    async fn read_window(
        &self,
        machine_id: &str,
        driver_names: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        Ok(self
            .readings
            .get(machine_id)
            .map(|readings| {
                readings
                    .iter()
                    .filter(|r| r.timestamp >= start && r.timestamp < end)
                    .map(|r| project_drivers(r, driver_names))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_latest(&self, machine_id: &str) -> Result<Reading> {
        self.readings
            .get(machine_id)
            .and_then(|readings| readings.last().cloned())
            .ok_or_else(|| EngineError::NoData {
                machine_id: machine_id.to_string(),
            })
    }
}
