//! Time series sources for consumption and driver readings
//!
//! The engine only consumes readings. This module provides:
//! - The `TimeSeriesSource` trait the core components depend on
//! - An in-memory source for embedding and tests
//! - A JSON-lines file source used by the daemon
//! - A retrying wrapper with bounded exponential backoff

mod file;
mod memory;
mod retry;

pub use file::JsonLinesSource;
pub use memory::InMemorySource;
pub use retry::{RetryConfig, RetryingSource};

use crate::error::Result;
use crate::models::Reading;
use chrono::{DateTime, Utc};

pub use async_trait::async_trait;

/// Trait for time series source implementations
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    /// Readings for a machine in `[start, end)`, ordered by timestamp.
    ///
    /// Only the requested drivers need to be populated on each reading.
    async fn read_window(
        &self,
        machine_id: &str,
        driver_names: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Most recent reading for a machine, `NoData` if there is none
    async fn read_latest(&self, machine_id: &str) -> Result<Reading>;
}

/// Restrict a reading to the requested drivers, keeping missing ones as `None`
pub(crate) fn project_drivers(reading: &Reading, driver_names: &[String]) -> Reading {
    let drivers = driver_names
        .iter()
        .map(|name| (name.clone(), reading.drivers.get(name).copied().flatten()))
        .collect();
    Reading {
        timestamp: reading.timestamp,
        drivers,
        consumption: reading.consumption,
    }
}
