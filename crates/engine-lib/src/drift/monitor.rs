//! Drift monitor
//!
//! Compares the active model's RMSE over a trailing window against its
//! training RMSE. Drift is declared only after the ratio stays above the
//! threshold for several consecutive checks; a single breach is recorded
//! but ignored.

use crate::baseline::ErrorSummary;
use crate::error::{EngineError, Result};
use crate::locks::MachineLocks;
use crate::models::{
    span, Alert, AlertSource, BaselineModel, DriftCheck, DriftDecision, DriftEvent,
    PerformanceMetric, RetrainTrigger, Severity, TimeWindow,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::retrain::RetrainCoordinator;
use crate::source::TimeSeriesSource;
use crate::store::Store;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub evaluation_window: Duration,
    pub min_evaluation_samples: usize,
    /// Window RMSE over training RMSE above which a check counts as a breach
    pub degradation_ratio: f64,
    pub consecutive_cycles: u32,
    /// Floor for the training RMSE in the ratio
    pub rmse_epsilon: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            evaluation_window: Duration::from_secs(24 * 60 * 60),
            min_evaluation_samples: 10,
            degradation_ratio: 1.5,
            consecutive_cycles: 2,
            rmse_epsilon: 1e-9,
        }
    }
}

/// Outcome of a drift pass over all active machines
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub checked: usize,
    pub events: Vec<DriftEvent>,
    pub no_drift: usize,
    /// Machines skipped for missing data or model, with the error code
    pub skipped: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

impl DriftReport {
    pub fn retrains_triggered(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.decision == DriftDecision::RetrainTriggered)
            .count()
    }
}

pub struct DriftMonitor {
    source: Arc<dyn TimeSeriesSource>,
    store: Arc<Store>,
    coordinator: Arc<RetrainCoordinator>,
    locks: Arc<MachineLocks>,
    config: DriftConfig,
    /// Consecutive breaches per model
    breaches: DashMap<Uuid, u32>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl DriftMonitor {
    pub fn new(
        source: Arc<dyn TimeSeriesSource>,
        store: Arc<Store>,
        coordinator: Arc<RetrainCoordinator>,
        locks: Arc<MachineLocks>,
        config: DriftConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            source,
            store,
            coordinator,
            locks,
            config,
            breaches: DashMap::new(),
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Current consecutive-breach count for a model
    pub fn consecutive_breaches(&self, model_id: Uuid) -> u32 {
        self.breaches.get(&model_id).map(|c| *c).unwrap_or(0)
    }

    /// Evaluate the machine's active model over the window ending at `now`
    pub async fn check(&self, machine_id: &str, now: DateTime<Utc>) -> Result<DriftCheck> {
        let _guard = self.locks.lock(machine_id).await;

        if let Some(test) = self.store.running_ab_test(machine_id).await {
            debug!(machine_id = %machine_id, test_id = %test.id, "A/B trial running, drift check skipped");
            return Ok(DriftCheck::NoDriftDetected);
        }
        let model = self
            .store
            .active_model(machine_id)
            .await
            .ok_or_else(|| EngineError::NoActiveModel {
                machine_id: machine_id.to_string(),
            })?;

        let window = TimeWindow::trailing(now, span(self.config.evaluation_window));
        let summary = self.evaluate(&model, window).await?;
        self.store
            .append_metric(PerformanceMetric {
                model_id: model.id,
                window,
                sample_count: summary.count as u64,
                mean_absolute_error: summary.mae,
                root_mean_squared_error: summary.rmse,
                r_squared: summary.r_squared,
                recorded_at: now,
            })
            .await;

        let ratio = summary.rmse / model.training_rmse.max(self.config.rmse_epsilon);
        if ratio <= self.config.degradation_ratio {
            self.breaches.remove(&model.id);
            debug!(machine_id = %machine_id, ratio, "Model within expected performance");
            return Ok(DriftCheck::NoDriftDetected);
        }

        let consecutive = {
            let mut count = self.breaches.entry(model.id).or_insert(0);
            *count += 1;
            *count
        };
        let decision = if consecutive >= self.config.consecutive_cycles {
            self.breaches.remove(&model.id);
            DriftDecision::RetrainTriggered
        } else {
            DriftDecision::Ignored
        };

        let event = DriftEvent {
            id: Uuid::new_v4(),
            model_id: model.id,
            machine_id: machine_id.to_string(),
            detected_at: now,
            degradation_ratio: ratio,
            triggering_metric: "rmse".to_string(),
            consecutive_breaches: consecutive,
            decision,
        };
        self.store.insert_drift_event(event.clone()).await;
        self.metrics.inc_drift_events(decision);
        self.logger.log_drift(&event);

        if decision == DriftDecision::RetrainTriggered {
            self.store
                .insert_alert(Alert::new(
                    AlertSource::Drift,
                    machine_id,
                    event.id,
                    Severity::Warning,
                    format!(
                        "model v{} RMSE {:.3} is {:.2}x training RMSE for {} consecutive checks",
                        model.version, summary.rmse, ratio, consecutive
                    ),
                ))
                .await;
            if let Err(e) = self
                .coordinator
                .enqueue(machine_id, RetrainTrigger::Drift, Some(model.id), None)
                .await
            {
                warn!(machine_id = %machine_id, error = %e, "Drift retrain could not be queued");
            }
        }

        Ok(DriftCheck::Event(event))
    }

    async fn evaluate(&self, model: &BaselineModel, window: TimeWindow) -> Result<ErrorSummary> {
        let readings = self
            .source
            .read_window(&model.machine_id, &model.drivers, window.start, window.end)
            .await?;
        let pairs: Vec<(f64, f64)> = readings
            .iter()
            .filter(|r| r.consumption.is_finite())
            .filter_map(|r| model.predict(r).map(|p| (r.consumption, p)))
            .collect();

        if pairs.len() < self.config.min_evaluation_samples {
            return Err(EngineError::insufficient_data(
                &model.machine_id,
                format!(
                    "{} complete readings in evaluation window, need {}",
                    pairs.len(),
                    self.config.min_evaluation_samples
                ),
            ));
        }
        ErrorSummary::from_pairs(&pairs)
            .ok_or_else(|| EngineError::insufficient_data(&model.machine_id, "no samples"))
    }

    /// Check every active machine; one machine's failure never stops the pass
    pub async fn check_all(&self, now: DateTime<Utc>) -> DriftReport {
        let mut report = DriftReport::default();
        for machine in self.store.active_machines().await {
            report.checked += 1;
            match self.check(&machine.id, now).await {
                Ok(DriftCheck::Event(event)) => report.events.push(event),
                Ok(DriftCheck::NoDriftDetected) => report.no_drift += 1,
                Err(e) if e.is_data_availability() || matches!(e, EngineError::NoActiveModel { .. }) => {
                    debug!(machine_id = %machine.id, error = %e, "Drift check skipped");
                    report.skipped.push((machine.id.clone(), e.code().to_string()));
                }
                Err(e) => {
                    warn!(machine_id = %machine.id, error = %e, "Drift check failed");
                    self.metrics.inc_drift_check_failures(e.code());
                    report.failed.push((machine.id.clone(), e.code().to_string()));
                }
            }
        }

        info!(
            checked = report.checked,
            events = report.events.len(),
            retrains = report.retrains_triggered(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Drift pass complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abtest::{AbTestConfig, AbTestManager};
    use crate::baseline::{BaselineTrainer, TrainerConfig};
    use crate::models::{AlertFilter, JobState, Machine, ModelKind, ModelStatus, Reading};
    use crate::retrain::RetrainConfig;
    use crate::source::InMemorySource;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        monitor: DriftMonitor,
        source: Arc<InMemorySource>,
        store: Arc<Store>,
        model: BaselineModel,
    }

    fn model(machine_id: &str) -> BaselineModel {
        let now = Utc::now();
        BaselineModel {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            version: 0,
            kind: ModelKind::LinearRegression,
            drivers: vec!["a".into(), "b".into(), "c".into()],
            coefficients: vec![1.0, 1.0, 1.0],
            intercept: 0.0,
            training_window: TimeWindow::trailing(now, ChronoDuration::days(30)),
            sample_count: 720,
            residual_mean: 0.0,
            residual_std: 1.0,
            training_mae: 1.0,
            training_rmse: 1.0,
            r_squared: 0.9,
            status: ModelStatus::Training,
            created_at: now,
        }
    }

    async fn fixture() -> Fixture {
        let source = Arc::new(InMemorySource::new());
        let store = Arc::new(Store::new());
        let logger = StructuredLogger::new("test");
        let locks = Arc::new(MachineLocks::new());
        let trainer = Arc::new(BaselineTrainer::new(
            source.clone(),
            store.clone(),
            TrainerConfig::default(),
        ));
        let abtests = Arc::new(AbTestManager::new(
            store.clone(),
            AbTestConfig::default(),
            logger.clone(),
        ));
        let coordinator = Arc::new(RetrainCoordinator::new(
            store.clone(),
            trainer,
            abtests,
            locks.clone(),
            RetrainConfig::default(),
            logger.clone(),
        ));
        let monitor = DriftMonitor::new(
            source.clone(),
            store.clone(),
            coordinator,
            locks,
            DriftConfig::default(),
            logger,
        );

        store
            .register_machine(Machine {
                id: "m1".into(),
                machine_type: "press".into(),
                active: true,
            })
            .await;
        let model = store.insert_trained_model(model("m1")).await;
        let model = store.activate_initial(model.id).await.unwrap();
        Fixture {
            monitor,
            source,
            store,
            model,
        }
    }

    /// Replace the last day of readings with a constant residual
    fn reseed(source: &InMemorySource, now: DateTime<Utc>, residual: f64, count: i64) {
        source.clear("m1");
        for i in 1..=count {
            let a = (i % 7) as f64;
            let b = (i % 5) as f64 * 2.0;
            let c = 10.0;
            source.push(
                "m1",
                Reading::new(now - ChronoDuration::minutes(i * 30), a + b + c + residual)
                    .with_driver("a", a)
                    .with_driver("b", b)
                    .with_driver("c", c),
            );
        }
    }

    fn decision(check: DriftCheck) -> Option<DriftDecision> {
        match check {
            DriftCheck::Event(e) => Some(e.decision),
            DriftCheck::NoDriftDetected => None,
        }
    }

    #[tokio::test]
    async fn test_single_breach_is_ignored_second_triggers_retrain() {
        let f = fixture().await;
        let now = Utc::now();
        reseed(&f.source, now, 2.0, 24);

        let first = f.monitor.check("m1", now).await.unwrap();
        assert_eq!(decision(first), Some(DriftDecision::Ignored));
        assert_eq!(f.monitor.consecutive_breaches(f.model.id), 1);
        assert!(f.store.jobs_for_machine("m1").await.is_empty());

        let second = f
            .monitor
            .check("m1", now + ChronoDuration::minutes(1))
            .await
            .unwrap();
        let DriftCheck::Event(event) = second else {
            panic!("expected drift event");
        };
        assert_eq!(event.decision, DriftDecision::RetrainTriggered);
        assert_eq!(event.consecutive_breaches, 2);
        assert!((event.degradation_ratio - 2.0).abs() < 1e-9);
        assert_eq!(f.monitor.consecutive_breaches(f.model.id), 0);

        let jobs = f.store.jobs_for_machine("m1").await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Queued);
        assert_eq!(jobs[0].triggering_model_id, Some(f.model.id));

        let alerts = f.store.list_active_alerts(&AlertFilter::default()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source, AlertSource::Drift);
        assert_eq!(alerts[0].reference_id, event.id);
        assert_eq!(f.store.drift_events_for_machine("m1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_resets_consecutive_count() {
        let f = fixture().await;
        let now = Utc::now();

        reseed(&f.source, now, 2.0, 24);
        f.monitor.check("m1", now).await.unwrap();

        reseed(&f.source, now, 0.5, 24);
        let healthy = f.monitor.check("m1", now).await.unwrap();
        assert_eq!(healthy, DriftCheck::NoDriftDetected);

        reseed(&f.source, now, 2.0, 24);
        let again = f.monitor.check("m1", now).await.unwrap();
        assert_eq!(decision(again), Some(DriftDecision::Ignored));
        assert!(f.store.jobs_for_machine("m1").await.is_empty());
    }

    #[tokio::test]
    async fn test_ratio_at_threshold_is_not_a_breach() {
        let f = fixture().await;
        let now = Utc::now();
        reseed(&f.source, now, 1.5, 24);

        assert_eq!(
            f.monitor.check("m1", now).await.unwrap(),
            DriftCheck::NoDriftDetected
        );
        // Every evaluation appends a metric
        assert_eq!(f.store.metrics_for_model(f.model.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_too_few_readings_is_insufficient_data() {
        let f = fixture().await;
        let now = Utc::now();
        reseed(&f.source, now, 2.0, 5);

        let err = f.monitor.check("m1", now).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_data");

        let report = f.monitor.check_all(now).await;
        assert_eq!(report.checked, 1);
        assert_eq!(
            report.skipped,
            vec![("m1".to_string(), "insufficient_data".to_string())]
        );
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_no_active_model_is_skipped_in_batch() {
        let f = fixture().await;
        f.store
            .register_machine(Machine {
                id: "m2".into(),
                machine_type: "press".into(),
                active: true,
            })
            .await;
        let now = Utc::now();
        reseed(&f.source, now, 0.0, 24);

        let report = f.monitor.check_all(now).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.no_drift, 1);
        assert_eq!(
            report.skipped,
            vec![("m2".to_string(), "no_active_model".to_string())]
        );
    }
}
