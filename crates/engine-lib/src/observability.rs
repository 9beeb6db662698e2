//! Observability infrastructure for the baseline engine
//!
//! Provides:
//! - Prometheus metrics (training and scoring latency, anomalies, drift,
//!   retrain outcomes, A/B decisions, scheduler skips)
//! - Structured JSON logging with tracing

use crate::models::{Anomaly, DriftDecision, DriftEvent, RetrainJob, Severity};
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for scoring latency (in seconds)
const SCORING_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Histogram buckets for training latency (in seconds)
const TRAINING_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct EngineMetricsInner {
    training_latency_seconds: Histogram,
    scoring_latency_seconds: Histogram,
    anomalies_scored: IntCounterVec,
    drift_events: IntCounterVec,
    drift_check_failures: IntCounterVec,
    retrain_jobs: IntCounterVec,
    ab_decisions: IntCounterVec,
    scheduler_skips: IntCounterVec,
    active_models: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            training_latency_seconds: register_histogram!(
                "baseline_engine_training_latency_seconds",
                "Time spent fitting baseline models",
                TRAINING_BUCKETS.to_vec()
            )
            .expect("Failed to register training_latency_seconds"),

            scoring_latency_seconds: register_histogram!(
                "baseline_engine_scoring_latency_seconds",
                "Time spent scoring a reading against its baseline",
                SCORING_BUCKETS.to_vec()
            )
            .expect("Failed to register scoring_latency_seconds"),

            anomalies_scored: register_int_counter_vec!(
                "baseline_engine_readings_scored_total",
                "Readings scored, by severity",
                &["severity"]
            )
            .expect("Failed to register readings_scored_total"),

            drift_events: register_int_counter_vec!(
                "baseline_engine_drift_events_total",
                "Drift events recorded, by decision",
                &["decision"]
            )
            .expect("Failed to register drift_events_total"),

            drift_check_failures: register_int_counter_vec!(
                "baseline_engine_drift_check_failures_total",
                "Drift evaluations that could not run, by error code",
                &["code"]
            )
            .expect("Failed to register drift_check_failures_total"),

            retrain_jobs: register_int_counter_vec!(
                "baseline_engine_retrain_jobs_total",
                "Retrain jobs reaching a terminal state, by state",
                &["state"]
            )
            .expect("Failed to register retrain_jobs_total"),

            ab_decisions: register_int_counter_vec!(
                "baseline_engine_ab_decisions_total",
                "A/B test decisions, by winning arm",
                &["winner"]
            )
            .expect("Failed to register ab_decisions_total"),

            scheduler_skips: register_int_counter_vec!(
                "baseline_engine_scheduler_skips_total",
                "Scheduled invocations skipped because the previous run was in flight",
                &["job"]
            )
            .expect("Failed to register scheduler_skips_total"),

            active_models: register_int_gauge!(
                "baseline_engine_active_models",
                "Number of machines with an active baseline model"
            )
            .expect("Failed to register active_models"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_training_latency(&self, duration_secs: f64) {
        self.inner().training_latency_seconds.observe(duration_secs);
    }

    pub fn observe_scoring_latency(&self, duration_secs: f64) {
        self.inner().scoring_latency_seconds.observe(duration_secs);
    }

    pub fn inc_anomalies(&self, severity: Severity) {
        self.inner()
            .anomalies_scored
            .with_label_values(&[&severity.to_string()])
            .inc();
    }

    pub fn inc_drift_events(&self, decision: DriftDecision) {
        let label = match decision {
            DriftDecision::Ignored => "ignored",
            DriftDecision::RetrainTriggered => "retrain_triggered",
        };
        self.inner().drift_events.with_label_values(&[label]).inc();
    }

    pub fn inc_drift_check_failures(&self, code: &str) {
        self.inner()
            .drift_check_failures
            .with_label_values(&[code])
            .inc();
    }

    pub fn inc_retrain_jobs(&self, state: &str) {
        self.inner().retrain_jobs.with_label_values(&[state]).inc();
    }

    pub fn inc_ab_decisions(&self, winner: &str) {
        self.inner().ab_decisions.with_label_values(&[winner]).inc();
    }

    pub fn inc_scheduler_skips(&self, job: &str) {
        self.inner().scheduler_skips.with_label_values(&[job]).inc();
    }

    pub fn set_active_models(&self, count: i64) {
        self.inner().active_models.set(count);
    }
}

/// Structured logger for engine events
///
/// Provides consistent JSON-formatted logging for anomalies, drift,
/// retraining and model promotion.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a scored reading; non-normal severities log at a higher level
    pub fn log_anomaly(&self, anomaly: &Anomaly, model_version: u32) {
        match anomaly.severity {
            Severity::Critical => {
                warn!(
                    event = "anomaly_scored",
                    instance = %self.instance,
                    machine_id = %anomaly.machine_id,
                    anomaly_id = %anomaly.id,
                    model_version = model_version,
                    severity = %anomaly.severity,
                    z_score = anomaly.residual_z_score,
                    observed = anomaly.observed_value,
                    expected = anomaly.expected_value,
                    confidence = anomaly.confidence_score,
                    "Critical consumption anomaly"
                );
            }
            Severity::Warning => {
                info!(
                    event = "anomaly_scored",
                    instance = %self.instance,
                    machine_id = %anomaly.machine_id,
                    anomaly_id = %anomaly.id,
                    model_version = model_version,
                    severity = %anomaly.severity,
                    z_score = anomaly.residual_z_score,
                    observed = anomaly.observed_value,
                    expected = anomaly.expected_value,
                    confidence = anomaly.confidence_score,
                    "Consumption anomaly"
                );
            }
            Severity::Normal => {
                tracing::debug!(
                    event = "anomaly_scored",
                    instance = %self.instance,
                    machine_id = %anomaly.machine_id,
                    z_score = anomaly.residual_z_score,
                    "Reading within baseline"
                );
            }
        }
    }

    pub fn log_drift(&self, event: &DriftEvent) {
        match event.decision {
            DriftDecision::RetrainTriggered => {
                warn!(
                    event = "drift_detected",
                    instance = %self.instance,
                    machine_id = %event.machine_id,
                    model_id = %event.model_id,
                    degradation_ratio = event.degradation_ratio,
                    consecutive_breaches = event.consecutive_breaches,
                    "Sustained drift, retrain triggered"
                );
            }
            DriftDecision::Ignored => {
                info!(
                    event = "drift_observed",
                    instance = %self.instance,
                    machine_id = %event.machine_id,
                    model_id = %event.model_id,
                    degradation_ratio = event.degradation_ratio,
                    consecutive_breaches = event.consecutive_breaches,
                    "Degradation observed below consecutive-cycle requirement"
                );
            }
        }
    }

    pub fn log_retrain_job(&self, job: &RetrainJob) {
        if job.failure_reason.is_some() {
            warn!(
                event = "retrain_job_finished",
                instance = %self.instance,
                job_id = %job.id,
                machine_id = %job.machine_id,
                state = %job.state,
                reason = ?job.failure_reason,
                "Retrain job did not produce a model"
            );
        } else {
            info!(
                event = "retrain_job_finished",
                instance = %self.instance,
                job_id = %job.id,
                machine_id = %job.machine_id,
                state = %job.state,
                model_id = ?job.produced_model_id,
                "Retrain job finished"
            );
        }
    }

    pub fn log_promotion(&self, machine_id: &str, winner: &str, loser: &str, reason: &str) {
        info!(
            event = "model_promoted",
            instance = %self.instance,
            machine_id = %machine_id,
            winner_model_id = %winner,
            retired_model_id = %loser,
            reason = %reason,
            "A/B test decided"
        );
    }

    pub fn log_startup(&self, version: &str, machines: usize) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            machines = machines,
            "Baseline engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Baseline engine shutting down"
        );
    }
}
