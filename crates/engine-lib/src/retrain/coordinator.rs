//! Retrain job coordinator
//!
//! Jobs move `queued -> running -> completed | failed`, or `queued ->
//! cancelled`. At most one job per machine is outstanding. Training runs on
//! a blocking thread under a global permit and a wall-clock budget; a failed
//! job leaves the active model untouched and raises a drift alert.

use crate::abtest::AbTestManager;
use crate::baseline::{BaselineTrainer, FittedBaseline};
use crate::error::{EngineError, Result};
use crate::locks::MachineLocks;
use crate::models::{
    span, Alert, AlertSource, BaselineModel, JobState, RetrainJob, RetrainTrigger, Severity,
    TimeWindow,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    /// Global cap on concurrently running trainings
    pub max_concurrent_trainings: usize,
    /// Wall-clock budget for loading and fitting one model
    pub training_timeout: Duration,
    /// Trailing window the replacement model is trained on
    pub retrain_window: Duration,
    /// Active models older than this get a scheduled retrain
    pub retrain_max_model_age: Duration,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            max_concurrent_trainings: 2,
            training_timeout: Duration::from_secs(10 * 60),
            retrain_window: Duration::from_secs(30 * 24 * 60 * 60),
            retrain_max_model_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

pub struct RetrainCoordinator {
    store: Arc<Store>,
    trainer: Arc<BaselineTrainer>,
    abtests: Arc<AbTestManager>,
    locks: Arc<MachineLocks>,
    config: RetrainConfig,
    permits: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl RetrainCoordinator {
    pub fn new(
        store: Arc<Store>,
        trainer: Arc<BaselineTrainer>,
        abtests: Arc<AbTestManager>,
        locks: Arc<MachineLocks>,
        config: RetrainConfig,
        logger: StructuredLogger,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            trainer,
            abtests,
            locks,
            permits: Arc::new(Semaphore::new(config.max_concurrent_trainings.max(1))),
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &RetrainConfig {
        &self.config
    }

    /// Queue a retrain for a machine.
    ///
    /// Idempotent: while the machine has a queued or running job, that job
    /// is returned and nothing new is created.
    pub async fn enqueue(
        &self,
        machine_id: &str,
        trigger: RetrainTrigger,
        triggering_model_id: Option<Uuid>,
        driver_override: Option<Vec<String>>,
    ) -> Result<RetrainJob> {
        let driver_override = driver_override
            .map(|drivers| self.trainer.validate_drivers(&drivers))
            .transpose()?;

        let job = RetrainJob {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            triggering_model_id,
            trigger,
            driver_override,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            produced_model_id: None,
        };
        let (job, created) = self.store.insert_job_if_idle(job).await;
        if !created {
            debug!(
                machine_id = %machine_id,
                job_id = %job.id,
                state = %job.state,
                "Retrain already outstanding"
            );
            return Ok(job);
        }

        info!(
            machine_id = %machine_id,
            job_id = %job.id,
            trigger = ?trigger,
            "Retrain job queued"
        );
        if self.queue_tx.send(job.id).is_err() {
            debug!(job_id = %job.id, "Retrain worker not running, job stays queued");
        }
        Ok(job)
    }

    /// Cancel a job that has not started yet
    pub async fn cancel(&self, job_id: Uuid) -> Result<RetrainJob> {
        let job = self
            .store
            .transition_job(job_id, JobState::Cancelled, |j| {
                j.finished_at = Some(Utc::now());
            })
            .await?;
        self.metrics.inc_retrain_jobs("cancelled");
        info!(job_id = %job_id, machine_id = %job.machine_id, "Retrain job cancelled");
        Ok(job)
    }

    pub async fn job(&self, job_id: Uuid) -> Result<RetrainJob> {
        self.store.job(job_id).await
    }

    /// Run one queued job to completion or failure.
    ///
    /// A job that is no longer queued (cancelled, or already picked up) is
    /// returned untouched. Errors are returned only for store-level
    /// failures; a training failure is recorded on the job itself.
    pub async fn run_job(&self, job_id: Uuid) -> Result<RetrainJob> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Shutdown)?;
        let start = Instant::now();

        let job = self.store.job(job_id).await?;
        let (job, drivers) = {
            let _guard = self.locks.lock(&job.machine_id).await;
            let job = self.store.job(job_id).await?;
            if job.state != JobState::Queued {
                debug!(job_id = %job_id, state = %job.state, "Skipping job no longer queued");
                return Ok(job);
            }
            let drivers = match &job.driver_override {
                Some(drivers) => Some(drivers.clone()),
                None => self
                    .store
                    .active_model(&job.machine_id)
                    .await
                    .map(|m| m.drivers),
            };
            let job = self
                .store
                .transition_job(job_id, JobState::Running, |j| {
                    j.started_at = Some(Utc::now());
                })
                .await?;
            (job, drivers)
        };

        let Some(drivers) = drivers else {
            let err = EngineError::NoActiveModel {
                machine_id: job.machine_id.clone(),
            };
            return self.fail_job(&job, err).await;
        };

        let now = Utc::now();
        let window = TimeWindow::trailing(now, span(self.config.retrain_window));
        let budget = self.config.training_timeout;
        let trained = match tokio::time::timeout(budget, self.fit(&job.machine_id, window, drivers))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                seconds: budget.as_secs(),
            }),
        };
        let (drivers, fitted) = match trained {
            Ok(trained) => trained,
            Err(err) => return self.fail_job(&job, err).await,
        };
        self.metrics
            .observe_training_latency(start.elapsed().as_secs_f64());

        let model = self
            .trainer
            .persist(&job.machine_id, window, drivers, fitted)
            .await;
        {
            let _guard = self.locks.lock(&job.machine_id).await;
            if let Err(err) = self.place_model(&model, Utc::now()).await {
                return self.fail_job(&job, err).await;
            }
        }

        let job = self
            .store
            .transition_job(job_id, JobState::Completed, |j| {
                j.finished_at = Some(Utc::now());
                j.produced_model_id = Some(model.id);
            })
            .await?;
        self.metrics.inc_retrain_jobs("completed");
        self.logger.log_retrain_job(&job);
        Ok(job)
    }

    /// Load the training set and fit it on a blocking thread
    async fn fit(
        &self,
        machine_id: &str,
        window: TimeWindow,
        drivers: Vec<String>,
    ) -> Result<(Vec<String>, FittedBaseline)> {
        let drivers = self.trainer.validate_drivers(&drivers)?;
        let set = self
            .trainer
            .load_training_set(machine_id, window, &drivers)
            .await?;
        let machine = machine_id.to_string();
        let fitted = tokio::task::spawn_blocking(move || BaselineTrainer::fit(&machine, &set))
            .await
            .map_err(|e| EngineError::TrainingAborted(e.to_string()))??;
        Ok((drivers, fitted))
    }

    /// Activate a machine's first model, or put a new one on trial.
    ///
    /// A model that cannot enter a trial is retired.
    async fn place_model(&self, model: &BaselineModel, now: DateTime<Utc>) -> Result<()> {
        if self.store.active_model(&model.machine_id).await.is_none() {
            match self.store.activate_initial(model.id).await {
                Ok(_) => {
                    self.metrics
                        .set_active_models(self.store.stats().await.active_models as i64);
                    return Ok(());
                }
                Err(EngineError::ActiveModelExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        match self.abtests.start(&model.machine_id, model.id, now).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Err(retire_err) = self.store.retire_model(model.id).await {
                    warn!(model_id = %model.id, error = %retire_err, "Failed to retire model");
                }
                Err(err)
            }
        }
    }

    async fn fail_job(&self, job: &RetrainJob, err: EngineError) -> Result<RetrainJob> {
        let reason = format!("{}: {}", err.code(), err);
        let job = self
            .store
            .transition_job(job.id, JobState::Failed, |j| {
                j.finished_at = Some(Utc::now());
                j.failure_reason = Some(reason.clone());
            })
            .await?;

        self.store
            .insert_alert(Alert::new(
                AlertSource::Drift,
                &job.machine_id,
                job.id,
                Severity::Critical,
                format!("retraining could not proceed: {reason}"),
            ))
            .await;
        self.metrics.inc_retrain_jobs("failed");
        self.logger.log_retrain_job(&job);
        Ok(job)
    }

    /// Queue scheduled retrains for active models older than the age limit
    pub async fn enqueue_stale(&self, now: DateTime<Utc>) -> Vec<RetrainJob> {
        let max_age = span(self.config.retrain_max_model_age);
        let mut jobs = Vec::new();
        for machine in self.store.active_machines().await {
            let Some(model) = self.store.active_model(&machine.id).await else {
                continue;
            };
            if now - model.created_at < max_age
                || self.store.running_ab_test(&machine.id).await.is_some()
            {
                continue;
            }
            match self
                .enqueue(&machine.id, RetrainTrigger::Scheduled, Some(model.id), None)
                .await
            {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(machine_id = %machine.id, error = %e, "Scheduled retrain rejected"),
            }
        }
        jobs
    }

    /// Settle jobs left over from a previous process.
    ///
    /// Jobs caught `running` are failed; queued jobs are dispatched again.
    pub async fn recover(&self) -> Result<usize> {
        for job in self.store.jobs_in_state(JobState::Running).await {
            warn!(job_id = %job.id, machine_id = %job.machine_id, "Failing job interrupted by restart");
            self.fail_job(&job, EngineError::TrainingAborted("interrupted by restart".into()))
                .await?;
        }
        let queued = self.store.jobs_in_state(JobState::Queued).await;
        for job in &queued {
            // Receiver lives in self, so the channel cannot be closed here
            let _ = self.queue_tx.send(job.id);
        }
        Ok(queued.len())
    }

    /// Worker loop: runs queued jobs until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut queue) = self.queue_rx.lock().await.take() else {
            warn!("Retrain worker already running");
            return;
        };

        match self.recover().await {
            Ok(resumed) if resumed > 0 => info!(resumed, "Resumed queued retrain jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Retrain recovery failed"),
        }

        info!(
            max_concurrent = self.config.max_concurrent_trainings,
            timeout_secs = self.config.training_timeout.as_secs(),
            "Starting retrain worker"
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                Some(job_id) = queue.recv() => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        if let Err(e) = this.run_job(job_id).await {
                            warn!(job_id = %job_id, error = %e, "Retrain job errored");
                        }
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.recv() => {
                    info!(in_flight = tasks.len(), "Shutting down retrain worker");
                    break;
                }
            }
        }
        tasks.shutdown().await;
    }
}
