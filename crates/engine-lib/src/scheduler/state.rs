//! Persisted scheduler run state

use super::JobKind;
use crate::error::{EngineError, Result};
use crate::store::write_atomic;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { summary: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRunState {
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    pub runs: u64,
    pub skips: u64,
}

impl JobRunState {
    /// When this job should next fire after a (re)start
    pub(crate) fn next_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
        stagger: Duration,
    ) -> DateTime<Utc> {
        let earliest = now + stagger;
        // A run cut off by a crash counts from its start
        match self.last_finished.max(self.last_started) {
            Some(last) => (last + interval).max(earliest),
            None => earliest,
        }
    }
}

/// Run state of every job kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub jobs: BTreeMap<JobKind, JobRunState>,
}

impl SchedulerState {
    /// Load from `path`; a missing or unreadable file starts fresh
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable scheduler state");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read scheduler state");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(EngineError::persistence)?;
        write_atomic(path, &data)
    }

    pub fn job_mut(&mut self, kind: JobKind) -> &mut JobRunState {
        self.jobs.entry(kind).or_default()
    }

    pub fn job(&self, kind: JobKind) -> JobRunState {
        self.jobs.get(&kind).cloned().unwrap_or_default()
    }
}
