//! Baseline model training
//!
//! Fits consumption against the selected drivers over a training window and
//! records the residual statistics the scorer and drift monitor rely on.

use super::regression::{fit_ols, mean_and_std, ErrorSummary};
use crate::error::{EngineError, Result};
use crate::models::{BaselineModel, ModelKind, ModelStatus, PerformanceMetric, TimeWindow};
use crate::source::TimeSeriesSource;
use crate::store::Store;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Minimum number of drivers a baseline needs
pub const MIN_DRIVERS: usize = 3;

/// Minimum complete buckets required to fit a baseline
pub const MIN_TRAINING_SAMPLES: usize = 20;

/// Configuration for baseline training
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub min_drivers: usize,
    pub min_samples: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            min_drivers: MIN_DRIVERS,
            min_samples: MIN_TRAINING_SAMPLES,
        }
    }
}

/// Design matrix ready for fitting
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    /// Buckets dropped for missing or non-finite values
    pub dropped: usize,
}

/// Fitted parameters and statistics, before the model is persisted
#[derive(Debug, Clone)]
pub struct FittedBaseline {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub sample_count: usize,
    pub residual_mean: f64,
    pub residual_std: f64,
    pub errors: ErrorSummary,
}

/// Trains baseline regression models
pub struct BaselineTrainer {
    source: Arc<dyn TimeSeriesSource>,
    store: Arc<Store>,
    config: TrainerConfig,
}

impl BaselineTrainer {
    pub fn new(source: Arc<dyn TimeSeriesSource>, store: Arc<Store>, config: TrainerConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Deduplicate driver names and enforce the minimum driver count
    pub fn validate_drivers(&self, drivers: &[String]) -> Result<Vec<String>> {
        let mut seen = BTreeSet::new();
        let unique: Vec<String> = drivers
            .iter()
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect();

        if unique.len() < self.config.min_drivers {
            return Err(EngineError::InsufficientDrivers {
                provided: unique.len(),
                required: self.config.min_drivers,
            });
        }
        Ok(unique)
    }

    /// Read the window and build the design matrix
    pub async fn load_training_set(
        &self,
        machine_id: &str,
        window: TimeWindow,
        drivers: &[String],
    ) -> Result<TrainingSet> {
        let readings = self
            .source
            .read_window(machine_id, drivers, window.start, window.end)
            .await?;

        let total = readings.len();
        let mut rows = Vec::with_capacity(total);
        let mut targets = Vec::with_capacity(total);
        for reading in &readings {
            if !reading.consumption.is_finite() {
                continue;
            }
            if let Some(values) = reading.driver_values(drivers) {
                rows.push(values);
                targets.push(reading.consumption);
            }
        }

        let set = TrainingSet {
            dropped: total - rows.len(),
            rows,
            targets,
        };

        if set.rows.len() < self.config.min_samples {
            return Err(EngineError::insufficient_data(
                machine_id,
                format!(
                    "{} complete buckets in training window ({} dropped), need {}",
                    set.rows.len(),
                    set.dropped,
                    self.config.min_samples
                ),
            ));
        }
        Ok(set)
    }

    /// Fit the regression and compute residual statistics.
    ///
    /// CPU-bound; callers on the async runtime should run it on a blocking
    /// thread.
    pub fn fit(machine_id: &str, set: &TrainingSet) -> Result<FittedBaseline> {
        let fit = fit_ols(&set.rows, &set.targets).ok_or_else(|| {
            EngineError::insufficient_data(
                machine_id,
                "driver matrix is rank deficient (collinear or constant drivers)",
            )
        })?;

        let pairs: Vec<(f64, f64)> = set
            .rows
            .iter()
            .zip(&set.targets)
            .map(|(row, y)| (*y, fit.predict(row)))
            .collect();
        let residuals: Vec<f64> = pairs.iter().map(|(y, p)| y - p).collect();
        let (residual_mean, residual_std) = mean_and_std(&residuals);
        let errors = ErrorSummary::from_pairs(&pairs)
            .ok_or_else(|| EngineError::insufficient_data(machine_id, "no samples"))?;

        Ok(FittedBaseline {
            coefficients: fit.coefficients,
            intercept: fit.intercept,
            sample_count: set.rows.len(),
            residual_mean,
            residual_std,
            errors,
        })
    }

    /// Persist a fitted baseline as a new `training` model version
    pub async fn persist(
        &self,
        machine_id: &str,
        window: TimeWindow,
        drivers: Vec<String>,
        fitted: FittedBaseline,
    ) -> BaselineModel {
        let now = Utc::now();
        let model = BaselineModel {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            version: 0,
            kind: ModelKind::LinearRegression,
            drivers,
            coefficients: fitted.coefficients,
            intercept: fitted.intercept,
            training_window: window,
            sample_count: fitted.sample_count,
            residual_mean: fitted.residual_mean,
            residual_std: fitted.residual_std,
            training_mae: fitted.errors.mae,
            training_rmse: fitted.errors.rmse,
            r_squared: fitted.errors.r_squared,
            status: ModelStatus::Training,
            created_at: now,
        };
        let model = self.store.insert_trained_model(model).await;

        self.store
            .append_metric(PerformanceMetric {
                model_id: model.id,
                window,
                sample_count: fitted.sample_count as u64,
                mean_absolute_error: fitted.errors.mae,
                root_mean_squared_error: fitted.errors.rmse,
                r_squared: fitted.errors.r_squared,
                recorded_at: now,
            })
            .await;

        info!(
            machine_id = %machine_id,
            model_id = %model.id,
            version = model.version,
            samples = model.sample_count,
            r_squared = model.r_squared,
            residual_std = model.residual_std,
            "Baseline model trained"
        );
        model
    }

    /// Train a baseline inline: validate, load, fit and persist
    pub async fn train(
        &self,
        machine_id: &str,
        window: TimeWindow,
        drivers: &[String],
    ) -> Result<BaselineModel> {
        let start = Instant::now();
        let drivers = self.validate_drivers(drivers)?;
        let set = self.load_training_set(machine_id, window, &drivers).await?;
        let fitted = Self::fit(machine_id, &set)?;

        debug!(
            machine_id = %machine_id,
            dropped = set.dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Baseline fit completed"
        );
        Ok(self.persist(machine_id, window, drivers, fitted).await)
    }
}
