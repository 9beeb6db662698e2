//! Residual-based anomaly scoring
//!
//! Scores a live reading against the machine's active baseline: the residual
//! is standardized with the model's training-time residual statistics and
//! the resulting z-score is classified into a severity tier.

use crate::error::{EngineError, Result};
use crate::models::{Alert, AlertSource, Anomaly, BaselineModel, Reading, Severity};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::store::Store;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Floor applied to the residual standard deviation
pub const DEFAULT_STD_EPSILON: f64 = 1e-9;

/// Z-score thresholds; each boundary belongs to the higher severity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            warning: 2.0,
            critical: 3.0,
        }
    }
}

impl SeverityThresholds {
    pub fn classify(&self, z_score: f64) -> Severity {
        let magnitude = z_score.abs();
        if magnitude >= self.critical {
            Severity::Critical
        } else if magnitude >= self.warning {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }
}

/// Configuration for the anomaly scorer
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub thresholds: SeverityThresholds,
    /// Scale `k` of the confidence curve `1 - exp(-|z| / k)`
    pub confidence_scale: f64,
    pub std_epsilon: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            thresholds: SeverityThresholds::default(),
            confidence_scale: 2.0,
            std_epsilon: DEFAULT_STD_EPSILON,
        }
    }
}

/// Evaluation of one reading against one model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualScore {
    pub expected: f64,
    pub residual: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub degenerate: bool,
}

/// Scores live readings against active baselines
pub struct AnomalyScorer {
    store: Arc<Store>,
    config: ScorerConfig,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl AnomalyScorer {
    pub fn new(store: Arc<Store>, config: ScorerConfig, logger: StructuredLogger) -> Self {
        Self {
            store,
            config,
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Confidence that a deviation of `z_score` is anomalous, in `[0, 1]`
    pub fn confidence(&self, z_score: f64) -> f64 {
        let k = self.config.confidence_scale.max(f64::EPSILON);
        (1.0 - (-z_score.abs() / k).exp()).clamp(0.0, 1.0)
    }

    /// Pure evaluation of a reading against a model
    pub fn evaluate(&self, model: &BaselineModel, reading: &Reading) -> Result<ResidualScore> {
        if !reading.consumption.is_finite() {
            return Err(EngineError::insufficient_data(
                &model.machine_id,
                "reading has non-finite consumption",
            ));
        }
        let expected = model.predict(reading).ok_or_else(|| {
            EngineError::insufficient_data(
                &model.machine_id,
                format!("reading lacks one of the drivers {:?}", model.drivers),
            )
        })?;

        let residual = reading.consumption - expected;
        let degenerate = model.residual_std < self.config.std_epsilon;
        let std = model.residual_std.max(self.config.std_epsilon);
        let z_score = (residual - model.residual_mean) / std;

        Ok(ResidualScore {
            expected,
            residual,
            z_score,
            severity: self.config.thresholds.classify(z_score),
            confidence: self.confidence(z_score),
            degenerate,
        })
    }

    /// Score a reading against the machine's active model.
    ///
    /// Every scored reading is persisted; an alert is raised only for
    /// non-normal severities.
    pub async fn score(&self, machine_id: &str, reading: &Reading) -> Result<Anomaly> {
        let start = Instant::now();
        let model = self
            .store
            .active_model(machine_id)
            .await
            .ok_or_else(|| EngineError::NoActiveModel {
                machine_id: machine_id.to_string(),
            })?;

        let score = self.evaluate(&model, reading)?;
        if score.degenerate {
            warn!(
                machine_id = %machine_id,
                model_id = %model.id,
                residual_std = model.residual_std,
                "DegenerateModel: residual std below epsilon, z-score uses floor"
            );
        }

        let anomaly = Anomaly {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            model_id: model.id,
            detected_at: reading.timestamp,
            observed_value: reading.consumption,
            expected_value: score.expected,
            residual_z_score: score.z_score,
            severity: score.severity,
            confidence_score: score.confidence,
            degenerate_model: score.degenerate,
            is_resolved: false,
        };

        let alert = (anomaly.severity != Severity::Normal).then(|| {
            Alert::new(
                AlertSource::Anomaly,
                machine_id,
                anomaly.id,
                anomaly.severity,
                format!(
                    "consumption {:.3} vs expected {:.3} (z={:.2}, model v{})",
                    anomaly.observed_value, anomaly.expected_value, anomaly.residual_z_score,
                    model.version
                ),
            )
        });

        self.store.insert_anomaly(anomaly.clone(), alert).await;
        self.metrics.inc_anomalies(anomaly.severity);
        self.metrics
            .observe_scoring_latency(start.elapsed().as_secs_f64());
        self.logger.log_anomaly(&anomaly, model.version);

        Ok(anomaly)
    }
}
