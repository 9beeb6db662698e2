//! Core data models for the baseline engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Monitored machine, owned by the asset-management collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub machine_type: String,
    pub active: bool,
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `length` ending at `end`
    pub fn trailing(end: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Convert a configured interval into a calendar span, saturating on overflow
pub(crate) fn span(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
}

/// A single bucket of consumption plus driver values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// Driver name to value; `None` marks a missing value
    pub drivers: BTreeMap<String, Option<f64>>,
    pub consumption: f64,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>, consumption: f64) -> Self {
        Self {
            timestamp,
            drivers: BTreeMap::new(),
            consumption,
        }
    }

    /// Builder-style driver value
    pub fn with_driver(mut self, name: impl Into<String>, value: f64) -> Self {
        self.drivers.insert(name.into(), Some(value));
        self
    }

    /// Driver values in the given order, `None` if any is missing or not finite
    pub fn driver_values(&self, names: &[String]) -> Option<Vec<f64>> {
        names
            .iter()
            .map(|name| {
                self.drivers
                    .get(name)
                    .copied()
                    .flatten()
                    .filter(|v| v.is_finite())
            })
            .collect()
    }
}

/// Model family. Linear regression is the only kind in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LinearRegression,
}

/// Lifecycle status of a baseline model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Training,
    Active,
    Challenger,
    Retired,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStatus::Training => write!(f, "training"),
            ModelStatus::Active => write!(f, "active"),
            ModelStatus::Challenger => write!(f, "challenger"),
            ModelStatus::Retired => write!(f, "retired"),
        }
    }
}

/// Versioned baseline regression of consumption on drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    pub id: Uuid,
    pub machine_id: String,
    pub version: u32,
    pub kind: ModelKind,
    pub drivers: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub training_window: TimeWindow,
    pub sample_count: usize,
    pub residual_mean: f64,
    pub residual_std: f64,
    pub training_mae: f64,
    pub training_rmse: f64,
    pub r_squared: f64,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
}

impl BaselineModel {
    /// Predicted consumption for the given driver values (model driver order)
    pub fn predict_values(&self, values: &[f64]) -> f64 {
        match self.kind {
            ModelKind::LinearRegression => {
                self.intercept
                    + self
                        .coefficients
                        .iter()
                        .zip(values)
                        .map(|(c, x)| c * x)
                        .sum::<f64>()
            }
        }
    }

    /// Predicted consumption for a reading, `None` if a driver is missing
    pub fn predict(&self, reading: &Reading) -> Option<f64> {
        reading
            .driver_values(&self.drivers)
            .map(|values| self.predict_values(&values))
    }
}

/// Append-only evaluation record for a model over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub model_id: Uuid,
    pub window: TimeWindow,
    pub sample_count: u64,
    pub mean_absolute_error: f64,
    pub root_mean_squared_error: f64,
    pub r_squared: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome recorded on a drift event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftDecision {
    Ignored,
    RetrainTriggered,
}

/// Immutable record of a degradation observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    pub id: Uuid,
    pub model_id: Uuid,
    pub machine_id: String,
    pub detected_at: DateTime<Utc>,
    pub degradation_ratio: f64,
    pub triggering_metric: String,
    pub consecutive_breaches: u32,
    pub decision: DriftDecision,
}

/// Result of a drift check: an event or a normal negative result
#[derive(Debug, Clone, PartialEq)]
pub enum DriftCheck {
    Event(DriftEvent),
    NoDriftDetected,
}

/// Retrain job state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Forward-only transitions; terminal states accept none
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What caused a retrain job to be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrainTrigger {
    Drift,
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainJob {
    pub id: Uuid,
    pub machine_id: String,
    pub triggering_model_id: Option<Uuid>,
    pub trigger: RetrainTrigger,
    pub driver_override: Option<Vec<String>>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub produced_model_id: Option<Uuid>,
}

/// Running error accumulator for one arm of an A/B test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmMetrics {
    pub sample_count: u64,
    pub sum_abs_error: f64,
    pub sum_sq_error: f64,
    pub sum_actual: f64,
    pub sum_actual_sq: f64,
}

impl ArmMetrics {
    pub fn record(&mut self, actual: f64, predicted: f64) {
        let err = actual - predicted;
        self.sample_count += 1;
        self.sum_abs_error += err.abs();
        self.sum_sq_error += err * err;
        self.sum_actual += actual;
        self.sum_actual_sq += actual * actual;
    }

    pub fn mae(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.sum_abs_error / self.sample_count as f64
    }

    pub fn rmse(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        (self.sum_sq_error / self.sample_count as f64).sqrt()
    }

    pub fn r_squared(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        let n = self.sample_count as f64;
        let ss_tot = self.sum_actual_sq - self.sum_actual * self.sum_actual / n;
        crate::baseline::r_squared_from_sums(self.sum_sq_error, ss_tot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbTestStatus {
    Running,
    Decided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,
    pub machine_id: String,
    pub incumbent_model_id: Uuid,
    pub challenger_model_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Set once the trial window has been extended for lack of samples
    pub extended: bool,
    pub incumbent_metrics: ArmMetrics,
    pub challenger_metrics: ArmMetrics,
    pub winner_model_id: Option<Uuid>,
    pub status: AbTestStatus,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
}

/// Anomaly severity tier, also used for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => write!(f, "normal"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub machine_id: String,
    pub model_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub observed_value: f64,
    pub expected_value: f64,
    pub residual_z_score: f64,
    pub severity: Severity,
    pub confidence_score: f64,
    /// Residual std was floored to epsilon when scoring
    pub degenerate_model: bool,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Drift,
    Anomaly,
}

impl fmt::Display for AlertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSource::Drift => write!(f, "drift"),
            AlertSource::Anomaly => write!(f, "anomaly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub source: AlertSource,
    pub machine_id: String,
    pub reference_id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(
        source: AlertSource,
        machine_id: &str,
        reference_id: Uuid,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            machine_id: machine_id.to_string(),
            reference_id,
            severity,
            message: message.into(),
            created_at: Utc::now(),
            acknowledged: false,
        }
    }
}

/// Filters for listing unacknowledged alerts
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub machine_id: Option<String>,
    pub time_range: Option<TimeWindow>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.severity.map_or(true, |s| alert.severity == s)
            && self
                .machine_id
                .as_ref()
                .map_or(true, |m| &alert.machine_id == m)
            && self
                .time_range
                .map_or(true, |w| w.contains(alert.created_at))
    }
}
