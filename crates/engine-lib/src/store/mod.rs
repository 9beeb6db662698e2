//! Record store for the model lifecycle
//!
//! Holds every lifecycle table behind a single async `RwLock`. The per-machine
//! active-model index lives in the same table set as the model rows, so an
//! activation swap updates both under one write guard and readers never see
//! zero or two active models mid-swap.

mod snapshot;

pub(crate) use snapshot::write_atomic;

use crate::error::{EngineError, Result};
use crate::models::{
    AbTest, AbTestStatus, Alert, AlertFilter, Anomaly, BaselineModel, DriftEvent, JobState,
    Machine, ModelStatus, PerformanceMetric, RetrainJob, TimeWindow,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// All persisted tables
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Tables {
    machines: BTreeMap<String, Machine>,
    models: HashMap<Uuid, BaselineModel>,
    /// Machine id to its single active model id
    active: HashMap<String, Uuid>,
    metrics: Vec<PerformanceMetric>,
    drift_events: Vec<DriftEvent>,
    jobs: HashMap<Uuid, RetrainJob>,
    ab_tests: HashMap<Uuid, AbTest>,
    anomalies: HashMap<Uuid, Anomaly>,
    alerts: HashMap<Uuid, Alert>,
}

impl Tables {
    fn model_mut(&mut self, id: Uuid) -> Result<&mut BaselineModel> {
        self.models.get_mut(&id).ok_or(EngineError::ModelNotFound(id))
    }

    fn running_test_for(&self, machine_id: &str) -> Option<&AbTest> {
        self.ab_tests
            .values()
            .find(|t| t.machine_id == machine_id && t.status == AbTestStatus::Running)
    }
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub machines: usize,
    pub models: usize,
    pub active_models: usize,
    pub anomalies: usize,
    pub unacknowledged_alerts: usize,
    pub outstanding_jobs: usize,
}

/// Lifecycle record store
#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
    dirty: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
            dirty: AtomicBool::new(false),
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether changes happened since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    // Machines

    pub async fn register_machine(&self, machine: Machine) {
        let mut t = self.tables.write().await;
        debug!(machine_id = %machine.id, active = machine.active, "Registering machine");
        t.machines.insert(machine.id.clone(), machine);
        self.mark_dirty();
    }

    pub async fn set_machine_active(&self, machine_id: &str, active: bool) -> Result<()> {
        let mut t = self.tables.write().await;
        let machine = t
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| EngineError::MachineNotFound(machine_id.to_string()))?;
        machine.active = active;
        self.mark_dirty();
        Ok(())
    }

    pub async fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.tables.read().await.machines.get(machine_id).cloned()
    }

    /// Machines flagged active by the asset-management collaborator
    pub async fn active_machines(&self) -> Vec<Machine> {
        self.tables
            .read()
            .await
            .machines
            .values()
            .filter(|m| m.active)
            .cloned()
            .collect()
    }

    // Models

    /// Insert a freshly trained model, assigning the next version for its machine
    pub async fn insert_trained_model(&self, mut model: BaselineModel) -> BaselineModel {
        let mut t = self.tables.write().await;
        let max_version = t
            .models
            .values()
            .filter(|m| m.machine_id == model.machine_id)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);
        model.version = max_version + 1;
        model.status = ModelStatus::Training;
        t.models.insert(model.id, model.clone());
        self.mark_dirty();
        model
    }

    pub async fn model(&self, id: Uuid) -> Result<BaselineModel> {
        self.tables
            .read()
            .await
            .models
            .get(&id)
            .cloned()
            .ok_or(EngineError::ModelNotFound(id))
    }

    /// All models of a machine, oldest version first
    pub async fn models_for_machine(&self, machine_id: &str) -> Vec<BaselineModel> {
        let t = self.tables.read().await;
        let mut models: Vec<BaselineModel> = t
            .models
            .values()
            .filter(|m| m.machine_id == machine_id)
            .cloned()
            .collect();
        models.sort_by_key(|m| m.version);
        models
    }

    /// The machine's active model, read through the active index
    pub async fn active_model(&self, machine_id: &str) -> Option<BaselineModel> {
        let t = self.tables.read().await;
        t.active
            .get(machine_id)
            .and_then(|id| t.models.get(id))
            .cloned()
    }

    /// Number of models flagged `active` for a machine
    pub async fn count_active(&self, machine_id: &str) -> usize {
        self.tables
            .read()
            .await
            .models
            .values()
            .filter(|m| m.machine_id == machine_id && m.status == ModelStatus::Active)
            .count()
    }

    /// Activate a model on a machine that has no active model yet.
    ///
    /// Compare-and-swap against an empty active slot.
    pub async fn activate_initial(&self, model_id: Uuid) -> Result<BaselineModel> {
        let mut t = self.tables.write().await;
        let model = t
            .models
            .get(&model_id)
            .cloned()
            .ok_or(EngineError::ModelNotFound(model_id))?;

        if let Some(current) = t.active.get(&model.machine_id) {
            return Err(EngineError::ActiveModelExists {
                machine_id: model.machine_id.clone(),
                model_id: *current,
            });
        }
        if model.status != ModelStatus::Training {
            return Err(EngineError::InvalidModelState {
                model_id,
                status: model.status.to_string(),
                operation: "activate".into(),
            });
        }

        t.active.insert(model.machine_id.clone(), model_id);
        let model = t.model_mut(model_id)?;
        model.status = ModelStatus::Active;
        let model = model.clone();
        self.mark_dirty();

        info!(
            machine_id = %model.machine_id,
            model_id = %model_id,
            version = model.version,
            "Activated initial baseline model"
        );
        Ok(model)
    }

    /// Retire a model that is neither active nor under trial
    pub async fn retire_model(&self, model_id: Uuid) -> Result<()> {
        let mut t = self.tables.write().await;
        let model = t.model_mut(model_id)?;
        if model.status != ModelStatus::Training {
            return Err(EngineError::InvalidModelState {
                model_id,
                status: model.status.to_string(),
                operation: "retire".into(),
            });
        }
        model.status = ModelStatus::Retired;
        self.mark_dirty();
        Ok(())
    }

    // Metrics and drift events

    pub async fn append_metric(&self, metric: PerformanceMetric) {
        self.tables.write().await.metrics.push(metric);
        self.mark_dirty();
    }

    pub async fn metrics_for_model(&self, model_id: Uuid) -> Vec<PerformanceMetric> {
        self.tables
            .read()
            .await
            .metrics
            .iter()
            .filter(|m| m.model_id == model_id)
            .cloned()
            .collect()
    }

    pub async fn insert_drift_event(&self, event: DriftEvent) {
        self.tables.write().await.drift_events.push(event);
        self.mark_dirty();
    }

    pub async fn drift_events_for_machine(&self, machine_id: &str) -> Vec<DriftEvent> {
        self.tables
            .read()
            .await
            .drift_events
            .iter()
            .filter(|e| e.machine_id == machine_id)
            .cloned()
            .collect()
    }

    // Retrain jobs

    /// Insert a job unless the machine already has an outstanding one.
    ///
    /// Returns the stored job and whether it was newly created.
    pub async fn insert_job_if_idle(&self, job: RetrainJob) -> (RetrainJob, bool) {
        let mut t = self.tables.write().await;
        if let Some(existing) = t
            .jobs
            .values()
            .find(|j| j.machine_id == job.machine_id && j.state.is_outstanding())
        {
            return (existing.clone(), false);
        }
        t.jobs.insert(job.id, job.clone());
        self.mark_dirty();
        (job, true)
    }

    pub async fn job(&self, id: Uuid) -> Result<RetrainJob> {
        self.tables
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(EngineError::JobNotFound(id))
    }

    pub async fn jobs_for_machine(&self, machine_id: &str) -> Vec<RetrainJob> {
        let t = self.tables.read().await;
        let mut jobs: Vec<RetrainJob> = t
            .jobs
            .values()
            .filter(|j| j.machine_id == machine_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs in the given state, oldest first (used to resume after a restart)
    pub async fn jobs_in_state(&self, state: JobState) -> Vec<RetrainJob> {
        let t = self.tables.read().await;
        let mut jobs: Vec<RetrainJob> = t
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Move a job forward, applying `update` only if the transition is allowed
    pub async fn transition_job<F>(&self, id: Uuid, next: JobState, update: F) -> Result<RetrainJob>
    where
        F: FnOnce(&mut RetrainJob),
    {
        let mut t = self.tables.write().await;
        let job = t.jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        if !job.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                job_id: id,
                from: job.state.to_string(),
                to: next.to_string(),
            });
        }
        job.state = next;
        update(job);
        let job = job.clone();
        self.mark_dirty();
        Ok(job)
    }

    // A/B tests

    /// Open a test and flag its challenger, rejecting a second running test
    pub async fn open_ab_test(&self, test: AbTest) -> Result<AbTest> {
        let mut t = self.tables.write().await;
        if let Some(running) = t.running_test_for(&test.machine_id) {
            return Err(EngineError::AbTestInProgress {
                machine_id: test.machine_id.clone(),
                test_id: running.id,
            });
        }
        if t.active.get(&test.machine_id) != Some(&test.incumbent_model_id) {
            return Err(EngineError::NoActiveModel {
                machine_id: test.machine_id.clone(),
            });
        }

        let challenger = t.model_mut(test.challenger_model_id)?;
        if challenger.machine_id != test.machine_id
            || !matches!(
                challenger.status,
                ModelStatus::Training | ModelStatus::Challenger
            )
        {
            return Err(EngineError::InvalidModelState {
                model_id: challenger.id,
                status: challenger.status.to_string(),
                operation: "enter ab test".into(),
            });
        }
        challenger.status = ModelStatus::Challenger;
        t.ab_tests.insert(test.id, test.clone());
        self.mark_dirty();
        Ok(test)
    }

    pub async fn ab_test(&self, id: Uuid) -> Result<AbTest> {
        self.tables
            .read()
            .await
            .ab_tests
            .get(&id)
            .cloned()
            .ok_or(EngineError::AbTestNotFound(id))
    }

    pub async fn running_ab_test(&self, machine_id: &str) -> Option<AbTest> {
        self.tables
            .read()
            .await
            .running_test_for(machine_id)
            .cloned()
    }

    pub async fn running_ab_tests(&self) -> Vec<AbTest> {
        self.tables
            .read()
            .await
            .ab_tests
            .values()
            .filter(|t| t.status == AbTestStatus::Running)
            .cloned()
            .collect()
    }

    /// Mutate a running test in place
    pub async fn update_running_ab_test<F>(&self, id: Uuid, update: F) -> Result<AbTest>
    where
        F: FnOnce(&mut AbTest),
    {
        let mut t = self.tables.write().await;
        let test = t.ab_tests.get_mut(&id).ok_or(EngineError::AbTestNotFound(id))?;
        if test.status != AbTestStatus::Running {
            return Err(EngineError::AbTestDecided(id));
        }
        update(test);
        let test = test.clone();
        self.mark_dirty();
        Ok(test)
    }

    /// Record the winner and swap activation atomically.
    ///
    /// The machine's active slot must still hold the incumbent. The winner
    /// becomes (or stays) active, the loser is retired and each arm gets a
    /// performance record, all under one write guard.
    pub async fn decide_ab_test(
        &self,
        id: Uuid,
        winner_model_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AbTest> {
        let mut t = self.tables.write().await;
        let test = t
            .ab_tests
            .get(&id)
            .cloned()
            .ok_or(EngineError::AbTestNotFound(id))?;
        if test.status == AbTestStatus::Decided {
            return Err(EngineError::AbTestDecided(id));
        }
        let incumbent = test.incumbent_model_id;
        let challenger = test.challenger_model_id;
        if winner_model_id != incumbent && winner_model_id != challenger {
            return Err(EngineError::ModelNotFound(winner_model_id));
        }
        if t.active.get(&test.machine_id) != Some(&incumbent) {
            return Err(EngineError::InvalidModelState {
                model_id: incumbent,
                status: "not active".into(),
                operation: "decide ab test".into(),
            });
        }

        let loser = if winner_model_id == challenger {
            incumbent
        } else {
            challenger
        };
        t.model_mut(winner_model_id)?.status = ModelStatus::Active;
        t.model_mut(loser)?.status = ModelStatus::Retired;
        t.active.insert(test.machine_id.clone(), winner_model_id);

        let window = TimeWindow::new(test.start, now);
        for (model_id, arm) in [
            (incumbent, &test.incumbent_metrics),
            (challenger, &test.challenger_metrics),
        ] {
            t.metrics.push(PerformanceMetric {
                model_id,
                window,
                sample_count: arm.sample_count,
                mean_absolute_error: arm.mae(),
                root_mean_squared_error: arm.rmse(),
                r_squared: arm.r_squared(),
                recorded_at: now,
            });
        }

        let test = t.ab_tests.get_mut(&id).ok_or(EngineError::AbTestNotFound(id))?;
        test.winner_model_id = Some(winner_model_id);
        test.status = AbTestStatus::Decided;
        test.decided_at = Some(now);
        test.decision_reason = Some(reason.to_string());
        let test = test.clone();
        self.mark_dirty();
        Ok(test)
    }

    // Anomalies and alerts

    /// Persist an anomaly together with its alert, if any
    pub async fn insert_anomaly(&self, anomaly: Anomaly, alert: Option<Alert>) {
        let mut t = self.tables.write().await;
        t.anomalies.insert(anomaly.id, anomaly);
        if let Some(alert) = alert {
            t.alerts.insert(alert.id, alert);
        }
        self.mark_dirty();
    }

    pub async fn anomaly(&self, id: Uuid) -> Result<Anomaly> {
        self.tables
            .read()
            .await
            .anomalies
            .get(&id)
            .cloned()
            .ok_or(EngineError::AnomalyNotFound(id))
    }

    /// Anomalies of a machine, newest first
    pub async fn anomalies_for_machine(&self, machine_id: &str) -> Vec<Anomaly> {
        let t = self.tables.read().await;
        let mut anomalies: Vec<Anomaly> = t
            .anomalies
            .values()
            .filter(|a| a.machine_id == machine_id)
            .cloned()
            .collect();
        anomalies.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        anomalies
    }

    /// Operator-facing: mark an anomaly resolved
    pub async fn resolve_anomaly(&self, id: Uuid) -> Result<Anomaly> {
        let mut t = self.tables.write().await;
        let anomaly = t
            .anomalies
            .get_mut(&id)
            .ok_or(EngineError::AnomalyNotFound(id))?;
        anomaly.is_resolved = true;
        let anomaly = anomaly.clone();
        self.mark_dirty();
        Ok(anomaly)
    }

    pub async fn insert_alert(&self, alert: Alert) {
        self.tables.write().await.alerts.insert(alert.id, alert);
        self.mark_dirty();
    }

    /// Notification-facing: acknowledge an alert
    pub async fn acknowledge_alert(&self, id: Uuid) -> Result<Alert> {
        let mut t = self.tables.write().await;
        let alert = t.alerts.get_mut(&id).ok_or(EngineError::AlertNotFound(id))?;
        alert.acknowledged = true;
        let alert = alert.clone();
        self.mark_dirty();
        Ok(alert)
    }

    /// Unacknowledged alerts matching the filter, newest first
    pub async fn list_active_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let t = self.tables.read().await;
        let mut alerts: Vec<Alert> = t
            .alerts
            .values()
            .filter(|a| !a.acknowledged && filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub async fn stats(&self) -> StoreStats {
        let t = self.tables.read().await;
        StoreStats {
            machines: t.machines.len(),
            models: t.models.len(),
            active_models: t.active.len(),
            anomalies: t.anomalies.len(),
            unacknowledged_alerts: t.alerts.values().filter(|a| !a.acknowledged).count(),
            outstanding_jobs: t.jobs.values().filter(|j| j.state.is_outstanding()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSource, ArmMetrics, ModelKind, RetrainTrigger, Severity, TimeWindow};
    use chrono::Duration;

    fn sample_model(machine_id: &str) -> BaselineModel {
        let end = Utc::now();
        BaselineModel {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            version: 0,
            kind: ModelKind::LinearRegression,
            drivers: vec!["a".into(), "b".into(), "c".into()],
            coefficients: vec![1.5, -0.25, 3.0],
            intercept: 12.0,
            training_window: TimeWindow::trailing(end, Duration::days(30)),
            sample_count: 720,
            residual_mean: 0.0,
            residual_std: 1.0,
            training_mae: 0.8,
            training_rmse: 1.0,
            r_squared: 0.93,
            status: ModelStatus::Training,
            created_at: end,
        }
    }

    fn sample_job(machine_id: &str) -> RetrainJob {
        RetrainJob {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            triggering_model_id: None,
            trigger: RetrainTrigger::Manual,
            driver_override: None,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            produced_model_id: None,
        }
    }

    fn sample_test(machine_id: &str, incumbent: Uuid, challenger: Uuid) -> AbTest {
        let now = Utc::now();
        AbTest {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            incumbent_model_id: incumbent,
            challenger_model_id: challenger,
            start: now,
            end: now + Duration::days(7),
            extended: false,
            incumbent_metrics: ArmMetrics::default(),
            challenger_metrics: ArmMetrics::default(),
            winner_model_id: None,
            status: AbTestStatus::Running,
            decided_at: None,
            decision_reason: None,
        }
    }

    #[tokio::test]
    async fn test_versions_are_monotonic_per_machine() {
        let store = Store::new();
        let v1 = store.insert_trained_model(sample_model("m1")).await;
        let v2 = store.insert_trained_model(sample_model("m1")).await;
        let other = store.insert_trained_model(sample_model("m2")).await;

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);
        assert!(store.is_dirty());
    }

    #[tokio::test]
    async fn test_activate_initial_only_once() {
        let store = Store::new();
        let first = store.insert_trained_model(sample_model("m1")).await;
        let second = store.insert_trained_model(sample_model("m1")).await;

        store.activate_initial(first.id).await.unwrap();
        let err = store.activate_initial(second.id).await.unwrap_err();
        assert!(matches!(err, EngineError::ActiveModelExists { .. }));
        assert_eq!(store.count_active("m1").await, 1);
        assert_eq!(store.active_model("m1").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_job_idempotent_insert_and_forward_transitions() {
        let store = Store::new();
        let (job, created) = store.insert_job_if_idle(sample_job("m1")).await;
        assert!(created);
        let (again, created) = store.insert_job_if_idle(sample_job("m1")).await;
        assert!(!created);
        assert_eq!(again.id, job.id);

        store
            .transition_job(job.id, JobState::Running, |_| {})
            .await
            .unwrap();
        store
            .transition_job(job.id, JobState::Completed, |_| {})
            .await
            .unwrap();
        let err = store
            .transition_job(job.id, JobState::Running, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        // Terminal job no longer blocks a new enqueue
        let (_, created) = store.insert_job_if_idle(sample_job("m1")).await;
        assert!(created);
    }

    #[tokio::test]
    async fn test_decide_swaps_active_atomically() {
        let store = Store::new();
        let incumbent = store.insert_trained_model(sample_model("m1")).await;
        let challenger = store.insert_trained_model(sample_model("m1")).await;
        store.activate_initial(incumbent.id).await.unwrap();

        let test = store
            .open_ab_test(sample_test("m1", incumbent.id, challenger.id))
            .await
            .unwrap();
        assert_eq!(
            store.model(challenger.id).await.unwrap().status,
            ModelStatus::Challenger
        );

        let decided = store
            .decide_ab_test(test.id, challenger.id, "lower_mae", Utc::now())
            .await
            .unwrap();
        assert_eq!(decided.winner_model_id, Some(challenger.id));
        assert_eq!(store.count_active("m1").await, 1);
        assert_eq!(store.active_model("m1").await.unwrap().id, challenger.id);
        assert_eq!(
            store.model(incumbent.id).await.unwrap().status,
            ModelStatus::Retired
        );

        let err = store
            .decide_ab_test(test.id, incumbent.id, "again", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AbTestDecided(_)));

        // One trial record per arm, none from the rejected decision
        assert_eq!(store.metrics_for_model(incumbent.id).await.len(), 1);
        let challenger_metrics = store.metrics_for_model(challenger.id).await;
        assert_eq!(challenger_metrics.len(), 1);
        assert_eq!(challenger_metrics[0].window.start, test.start);
    }

    #[tokio::test]
    async fn test_second_running_test_rejected() {
        let store = Store::new();
        let incumbent = store.insert_trained_model(sample_model("m1")).await;
        let c1 = store.insert_trained_model(sample_model("m1")).await;
        let c2 = store.insert_trained_model(sample_model("m1")).await;
        store.activate_initial(incumbent.id).await.unwrap();

        store
            .open_ab_test(sample_test("m1", incumbent.id, c1.id))
            .await
            .unwrap();
        let err = store
            .open_ab_test(sample_test("m1", incumbent.id, c2.id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AbTestInProgress { .. }));
        assert_eq!(store.model(c2.id).await.unwrap().status, ModelStatus::Training);
    }

    #[tokio::test]
    async fn test_alert_listing_and_acknowledgement() {
        let store = Store::new();
        let warning = Alert::new(AlertSource::Anomaly, "m1", Uuid::new_v4(), Severity::Warning, "w");
        let critical = Alert::new(AlertSource::Drift, "m2", Uuid::new_v4(), Severity::Critical, "c");
        store.insert_alert(warning.clone()).await;
        store.insert_alert(critical.clone()).await;

        assert_eq!(store.list_active_alerts(&AlertFilter::default()).await.len(), 2);

        let only_m2 = AlertFilter {
            machine_id: Some("m2".into()),
            ..Default::default()
        };
        let listed = store.list_active_alerts(&only_m2).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, critical.id);

        store.acknowledge_alert(critical.id).await.unwrap();
        assert!(store.list_active_alerts(&only_m2).await.is_empty());
    }
}
