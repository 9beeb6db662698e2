//! JSON-lines file source
//!
//! Reads `<data_dir>/<machine_id>.jsonl`, one serialized `Reading` per line.
//! Files are appended by the ingestion side; lines that fail to parse are
//! skipped with a warning.

use super::{async_trait, project_drivers, TimeSeriesSource};
use crate::error::{EngineError, Result};
use crate::models::Reading;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File-backed time series source
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    data_dir: PathBuf,
}

impl JsonLinesSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn machine_path(&self, machine_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", machine_id))
    }

    /// Load and parse all readings of a machine, sorted by timestamp
    async fn load(&self, machine_id: &str) -> Result<Vec<Reading>> {
        let path = self.machine_path(machine_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No reading file for machine");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(EngineError::Source {
                    message: format!("failed to read {}: {}", path.display(), e),
                    transient: true,
                })
            }
        };

        let mut readings = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Reading>(line) {
                Ok(r) => readings.push(r),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed reading"
                    );
                }
            }
        }

        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }
}

#[async_trait]
impl TimeSeriesSource for JsonLinesSource {
    async fn read_window(
        &self,
        machine_id: &str,
        driver_names: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let readings = self.load(machine_id).await?;
        Ok(readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .map(|r| project_drivers(r, driver_names))
            .collect())
    }

    async fn read_latest(&self, machine_id: &str) -> Result<Reading> {
        self.load(machine_id)
            .await?
            .pop()
            .ok_or_else(|| EngineError::NoData {
                machine_id: machine_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_and_skips_malformed_lines() {
        let temp_dir = TempDir::new().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let mut lines = Vec::new();
        for i in [2, 0, 1] {
            let reading = Reading::new(t0 + Duration::hours(i), 100.0 + i as f64)
                .with_driver("production", 10.0)
                .with_driver("temperature", 20.0);
            lines.push(serde_json::to_string(&reading).unwrap());
        }
        lines.push("{not json".to_string());
        std::fs::write(temp_dir.path().join("kiln-1.jsonl"), lines.join("\n")).unwrap();

        let source = JsonLinesSource::new(temp_dir.path());
        let drivers = vec!["production".to_string()];
        let window = source
            .read_window("kiln-1", &drivers, t0, t0 + Duration::hours(3))
            .await
            .unwrap();

        assert_eq!(window.len(), 3);
        assert_eq!(window[0].consumption, 100.0);
        assert_eq!(window[0].drivers.len(), 1);

        let latest = source.read_latest("kiln-1").await.unwrap();
        assert_eq!(latest.consumption, 102.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_no_data() {
        let temp_dir = TempDir::new().unwrap();
        let source = JsonLinesSource::new(temp_dir.path());

        let window = source
            .read_window("ghost", &[], Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert!(window.is_empty());

        let err = source.read_latest("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::NoData { .. }));
    }
}
