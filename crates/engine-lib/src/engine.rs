//! Engine facade
//!
//! Wires the lifecycle components together, exposes the operations external
//! collaborators call, and implements the bodies of the scheduled jobs.

use crate::abtest::{AbTestConfig, AbTestManager, ReviewReport};
use crate::anomaly::{AnomalyScorer, ScorerConfig};
use crate::baseline::{BaselineTrainer, TrainerConfig};
use crate::drift::{DriftConfig, DriftMonitor, DriftReport};
use crate::error::{EngineError, Result};
use crate::health::{components, HealthRegistry};
use crate::locks::MachineLocks;
use crate::models::{
    AbTest, Alert, AlertFilter, Anomaly, BaselineModel, DriftCheck, Machine, PerformanceMetric,
    Reading, RetrainJob, RetrainTrigger, Severity, TimeWindow,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::retrain::{RetrainConfig, RetrainCoordinator};
use crate::scheduler::{JobKind, JobRunner, SchedulerConfig};
use crate::source::TimeSeriesSource;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for every engine component
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name attached to structured log records
    pub instance: String,
    pub trainer: TrainerConfig,
    pub scorer: ScorerConfig,
    pub drift: DriftConfig,
    pub retrain: RetrainConfig,
    pub abtest: AbTestConfig,
    pub scheduler: SchedulerConfig,
    /// Machines scored concurrently during an anomaly scan
    pub scan_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance: "baseline-engine".to_string(),
            trainer: TrainerConfig::default(),
            scorer: ScorerConfig::default(),
            drift: DriftConfig::default(),
            retrain: RetrainConfig::default(),
            abtest: AbTestConfig::default(),
            scheduler: SchedulerConfig::default(),
            scan_concurrency: 8,
        }
    }
}

/// Outcome of scoring the latest reading of every active machine
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub scanned: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Latest reading was already scored
    pub unchanged: usize,
    pub no_active_model: Vec<String>,
    pub no_data: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ScanReport {
    pub fn scored(&self) -> usize {
        self.by_severity.values().sum()
    }
}

enum MachineScan {
    Scored(Severity),
    Unchanged,
    Failed(EngineError),
}

/// Scoring path shared by direct calls and scan tasks
#[derive(Clone)]
struct Scanner {
    source: Arc<dyn TimeSeriesSource>,
    scorer: Arc<AnomalyScorer>,
    abtests: Arc<AbTestManager>,
    /// Timestamp of the newest reading scored per machine
    last_scored: Arc<DashMap<String, DateTime<Utc>>>,
}

impl Scanner {
    async fn score(&self, machine_id: &str, reading: &Reading) -> Result<Anomaly> {
        let anomaly = self.scorer.score(machine_id, reading).await?;
        // Trial scoring is evaluation only and never fails the production path
        if let Err(e) = self.abtests.record(machine_id, reading).await {
            warn!(machine_id = %machine_id, error = %e, "Failed to record A/B trial sample");
        }
        self.last_scored
            .entry(machine_id.to_string())
            .and_modify(|ts| *ts = (*ts).max(reading.timestamp))
            .or_insert(reading.timestamp);
        Ok(anomaly)
    }

    async fn scan_machine(&self, machine_id: &str) -> MachineScan {
        let reading = match self.source.read_latest(machine_id).await {
            Ok(reading) => reading,
            Err(e) => return MachineScan::Failed(e),
        };
        let seen = self.last_scored.get(machine_id).map(|ts| *ts);
        if seen.is_some_and(|ts| reading.timestamp <= ts) {
            return MachineScan::Unchanged;
        }
        match self.score(machine_id, &reading).await {
            Ok(anomaly) => MachineScan::Scored(anomaly.severity),
            Err(e) => MachineScan::Failed(e),
        }
    }
}

pub struct Engine {
    store: Arc<Store>,
    trainer: Arc<BaselineTrainer>,
    drift: Arc<DriftMonitor>,
    retrain: Arc<RetrainCoordinator>,
    abtests: Arc<AbTestManager>,
    scanner: Scanner,
    scan_permits: Arc<Semaphore>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        source: Arc<dyn TimeSeriesSource>,
        store: Arc<Store>,
        config: EngineConfig,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(config.instance.clone());
        let locks = Arc::new(MachineLocks::new());

        let trainer = Arc::new(BaselineTrainer::new(
            source.clone(),
            store.clone(),
            config.trainer.clone(),
        ));
        let abtests = Arc::new(AbTestManager::new(
            store.clone(),
            config.abtest.clone(),
            logger.clone(),
        ));
        let retrain = Arc::new(RetrainCoordinator::new(
            store.clone(),
            trainer.clone(),
            abtests.clone(),
            locks.clone(),
            config.retrain.clone(),
            logger.clone(),
        ));
        let drift = Arc::new(DriftMonitor::new(
            source.clone(),
            store.clone(),
            retrain.clone(),
            locks,
            config.drift.clone(),
            logger.clone(),
        ));
        let scorer = Arc::new(AnomalyScorer::new(
            store.clone(),
            config.scorer.clone(),
            logger.clone(),
        ));

        Self {
            scanner: Scanner {
                source,
                scorer,
                abtests: abtests.clone(),
                last_scored: Arc::new(DashMap::new()),
            },
            scan_permits: Arc::new(Semaphore::new(config.scan_concurrency.max(1))),
            store,
            trainer,
            drift,
            retrain,
            abtests,
            health,
            metrics: EngineMetrics::new(),
            logger,
            config,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The retrain coordinator, whose worker loop the host spawns
    pub fn retrain_coordinator(&self) -> Arc<RetrainCoordinator> {
        self.retrain.clone()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Model lifecycle

    /// Fit a new baseline; the model is stored with status `training`
    pub async fn train_baseline(
        &self,
        machine_id: &str,
        window: TimeWindow,
        drivers: &[String],
    ) -> Result<BaselineModel> {
        let start = std::time::Instant::now();
        let model = self.trainer.train(machine_id, window, drivers).await?;
        self.metrics
            .observe_training_latency(start.elapsed().as_secs_f64());
        Ok(model)
    }

    /// Activate the first model of a machine that has none
    pub async fn activate_baseline(&self, model_id: Uuid) -> Result<BaselineModel> {
        let model = self.store.activate_initial(model_id).await?;
        self.publish_store_gauges().await;
        Ok(model)
    }

    /// Bring store-derived gauges in line with the store, e.g. after a restore
    pub async fn publish_store_gauges(&self) -> usize {
        let active = self.store.stats().await.active_models;
        self.metrics.set_active_models(active as i64);
        active
    }

    pub async fn model_history(&self, machine_id: &str) -> Vec<BaselineModel> {
        self.store.models_for_machine(machine_id).await
    }

    pub async fn performance_history(&self, model_id: Uuid) -> Result<Vec<PerformanceMetric>> {
        self.store.model(model_id).await?;
        Ok(self.store.metrics_for_model(model_id).await)
    }

    // Scoring

    /// Score a reading against the active model, feeding any running trial
    pub async fn score_reading(&self, machine_id: &str, reading: &Reading) -> Result<Anomaly> {
        self.scanner.score(machine_id, reading).await
    }

    /// Score the latest reading of every active machine
    pub async fn scan_anomalies(&self) -> ScanReport {
        let machines = self.store.active_machines().await;
        let mut report = ScanReport {
            scanned: machines.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for machine in machines {
            let scanner = self.scanner.clone();
            let permits = self.scan_permits.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => scanner.scan_machine(&machine.id).await,
                    Err(_) => MachineScan::Failed(EngineError::Shutdown),
                };
                (machine.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (machine_id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Scan task aborted");
                    report.failed.push(("unknown".to_string(), "task_aborted".to_string()));
                    continue;
                }
            };
            match outcome {
                MachineScan::Scored(severity) => {
                    *report.by_severity.entry(severity).or_default() += 1;
                }
                MachineScan::Unchanged => report.unchanged += 1,
                MachineScan::Failed(EngineError::NoActiveModel { .. }) => {
                    report.no_active_model.push(machine_id)
                }
                MachineScan::Failed(EngineError::NoData { .. }) => report.no_data.push(machine_id),
                MachineScan::Failed(e) => {
                    warn!(machine_id = %machine_id, error = %e, "Scoring failed");
                    report.failed.push((machine_id, e.code().to_string()));
                }
            }
        }

        self.health
            .report_batch(components::SCORER, report.failed.len(), report.scanned)
            .await;
        debug!(
            scanned = report.scanned,
            scored = report.scored(),
            unchanged = report.unchanged,
            "Anomaly scan complete"
        );
        report
    }

    // Drift and retraining

    pub async fn check_drift(&self, machine_id: &str) -> Result<DriftCheck> {
        self.check_drift_at(machine_id, Utc::now()).await
    }

    pub async fn check_drift_at(&self, machine_id: &str, now: DateTime<Utc>) -> Result<DriftCheck> {
        self.drift.check(machine_id, now).await
    }

    pub async fn check_drift_all(&self, now: DateTime<Utc>) -> DriftReport {
        let report = self.drift.check_all(now).await;
        self.health
            .report_batch(components::DRIFT_MONITOR, report.failed.len(), report.checked)
            .await;
        report
    }

    /// Manually request a retrain with the active model's drivers.
    ///
    /// Returns the outstanding job if one already exists.
    pub async fn trigger_retrain(&self, machine_id: &str) -> Result<RetrainJob> {
        let active = self.store.active_model(machine_id).await;
        self.retrain
            .enqueue(
                machine_id,
                RetrainTrigger::Manual,
                active.map(|m| m.id),
                None,
            )
            .await
    }

    /// Manually request a retrain with an explicit driver set
    pub async fn trigger_retrain_with_drivers(
        &self,
        machine_id: &str,
        drivers: Vec<String>,
    ) -> Result<RetrainJob> {
        let active = self.store.active_model(machine_id).await;
        self.retrain
            .enqueue(
                machine_id,
                RetrainTrigger::Manual,
                active.map(|m| m.id),
                Some(drivers),
            )
            .await
    }

    pub async fn cancel_retrain(&self, job_id: Uuid) -> Result<RetrainJob> {
        self.retrain.cancel(job_id).await
    }

    pub async fn get_retrain_job(&self, job_id: Uuid) -> Result<RetrainJob> {
        self.retrain.job(job_id).await
    }

    // A/B trials

    pub async fn start_ab_test(&self, machine_id: &str, challenger_model_id: Uuid) -> Result<AbTest> {
        self.abtests
            .start(machine_id, challenger_model_id, Utc::now())
            .await
    }

    pub async fn get_ab_test_status(&self, test_id: Uuid) -> Result<AbTest> {
        self.abtests.status(test_id).await
    }

    pub async fn evaluate_ab_test(&self, test_id: Uuid, now: DateTime<Utc>) -> Result<AbTest> {
        self.abtests.evaluate(test_id, now).await
    }

    pub async fn review_ab_tests(&self, now: DateTime<Utc>) -> ReviewReport {
        self.abtests.review(now).await
    }

    // Machines, anomalies and alerts

    pub async fn register_machine(&self, machine: Machine) {
        self.store.register_machine(machine).await;
    }

    pub async fn set_machine_active(&self, machine_id: &str, active: bool) -> Result<()> {
        self.store.set_machine_active(machine_id, active).await
    }

    pub async fn resolve_anomaly(&self, anomaly_id: Uuid) -> Result<Anomaly> {
        self.store.resolve_anomaly(anomaly_id).await
    }

    pub async fn list_active_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.store.list_active_alerts(filter).await
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> Result<Alert> {
        self.store.acknowledge_alert(alert_id).await
    }
}

#[async_trait]
impl JobRunner for Engine {
    async fn run(&self, kind: JobKind) -> Result<String> {
        let now = Utc::now();
        let summary = match kind {
            JobKind::AnomalyScan => {
                let r = self.scan_anomalies().await;
                format!(
                    "scanned {}, scored {}, unchanged {}, no model {}, no data {}, failed {}",
                    r.scanned,
                    r.scored(),
                    r.unchanged,
                    r.no_active_model.len(),
                    r.no_data.len(),
                    r.failed.len()
                )
            }
            JobKind::DriftCheck => {
                let r = self.check_drift_all(now).await;
                format!(
                    "checked {}, events {}, retrains {}, skipped {}, failed {}",
                    r.checked,
                    r.events.len(),
                    r.retrains_triggered(),
                    r.skipped.len(),
                    r.failed.len()
                )
            }
            JobKind::ScheduledRetrain => {
                let jobs = self.retrain.enqueue_stale(now).await;
                self.health.set_healthy(components::RETRAIN).await;
                format!("queued {}", jobs.len())
            }
            JobKind::AbTestReview => {
                let r = self.review_ab_tests(now).await;
                format!(
                    "decided {}, extended {}, pending {}, failed {}",
                    r.decided.len(),
                    r.extended.len(),
                    r.pending,
                    r.failed.len()
                )
            }
        };
        info!(job = %kind, summary = %summary, "Scheduled job complete");
        Ok(summary)
    }
}
