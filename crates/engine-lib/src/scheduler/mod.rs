//! Periodic job scheduler
//!
//! This module provides:
//! - An owned dispatcher with start/stop lifecycle
//! - Per-job-kind mutual exclusion: an invocation is skipped, never queued,
//!   while the previous one of the same kind is still running
//! - Run state persisted after each run so a restart resumes the schedule

mod state;

pub use state::{JobOutcome, JobRunState, SchedulerState};

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::span;
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kinds of scheduled work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AnomalyScan,
    DriftCheck,
    ScheduledRetrain,
    AbTestReview,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::AnomalyScan,
        JobKind::DriftCheck,
        JobKind::ScheduledRetrain,
        JobKind::AbTestReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AnomalyScan => "anomaly_scan",
            JobKind::DriftCheck => "drift_check",
            JobKind::ScheduledRetrain => "scheduled_retrain",
            JobKind::AbTestReview => "ab_test_review",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of every scheduled job
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one invocation, returning a short summary for the run state
    async fn run(&self, kind: JobKind) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Dispatch loop resolution
    pub tick: Duration,
    pub anomaly_scan_interval: Duration,
    pub drift_check_interval: Duration,
    pub scheduled_retrain_interval: Duration,
    pub ab_review_interval: Duration,
    /// Offset between the first runs of successive job kinds after a start
    pub startup_stagger: Duration,
    /// Where run state is persisted; `None` keeps it in memory only
    pub state_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            anomaly_scan_interval: Duration::from_secs(60),
            drift_check_interval: Duration::from_secs(60 * 60),
            scheduled_retrain_interval: Duration::from_secs(24 * 60 * 60),
            ab_review_interval: Duration::from_secs(60 * 60),
            startup_stagger: Duration::from_secs(5),
            state_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::AnomalyScan => self.anomaly_scan_interval,
            JobKind::DriftCheck => self.drift_check_interval,
            JobKind::ScheduledRetrain => self.scheduled_retrain_interval,
            JobKind::AbTestReview => self.ab_review_interval,
        }
    }
}

/// Shared between the dispatch loop and the job tasks it spawns
struct Shared {
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    in_flight: BTreeMap<JobKind, AtomicBool>,
    health: Option<HealthRegistry>,
    metrics: EngineMetrics,
}

impl Shared {
    async fn persist(&self) {
        let Some(path) = &self.config.state_path else {
            return;
        };
        let state = self.state.lock().await.clone();
        if let Err(e) = state.save(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist scheduler state");
        }
    }

    fn guard(&self, kind: JobKind) -> &AtomicBool {
        // Populated for every kind at construction
        &self.in_flight[&kind]
    }

    async fn execute(self: Arc<Self>, kind: JobKind) {
        // The body runs in its own task so a panic still releases the guard
        let runner = self.runner.clone();
        let result = tokio::spawn(async move { runner.run(kind).await }).await;
        let finished = Utc::now();

        let result = match result {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err("job panicked".to_string()),
            Err(e) => Err(format!("job aborted: {e}")),
        };

        let outcome = match result {
            Ok(summary) => {
                debug!(job = %kind, summary = %summary, "Scheduled job finished");
                JobOutcome::Succeeded { summary }
            }
            Err(error) => {
                warn!(job = %kind, error = %error, "Scheduled job failed");
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::SCHEDULER, format!("{kind} failed: {error}"))
                        .await;
                }
                JobOutcome::Failed { error }
            }
        };

        {
            let mut state = self.state.lock().await;
            let run = state.job_mut(kind);
            run.last_finished = Some(finished);
            run.last_outcome = Some(outcome);
            run.runs += 1;
        }
        self.guard(kind).store(false, Ordering::Release);
        self.persist().await;
    }

    /// Start `kind` unless its previous run is still going
    async fn dispatch(self: &Arc<Self>, kind: JobKind, now: DateTime<Utc>) {
        if self.guard(kind).swap(true, Ordering::AcqRel) {
            self.state.lock().await.job_mut(kind).skips += 1;
            self.metrics.inc_scheduler_skips(kind.as_str());
            debug!(job = %kind, "Previous run still in flight, skipping");
            return;
        }

        self.state.lock().await.job_mut(kind).last_started = Some(now);
        tokio::spawn(self.clone().execute(kind));
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let now = Utc::now();
        let mut next_due: BTreeMap<JobKind, DateTime<Utc>> = {
            let state = self.state.lock().await;
            JobKind::ALL
                .iter()
                .enumerate()
                .map(|(i, kind)| {
                    let stagger = span(self.config.startup_stagger * i as u32);
                    let interval = span(self.config.interval(*kind));
                    (*kind, state.job(*kind).next_due(interval, now, stagger))
                })
                .collect()
        };
        for (kind, due) in &next_due {
            debug!(job = %kind, due = %due, "Scheduled");
        }

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    for (kind, due) in next_due.iter_mut() {
                        if *due <= now {
                            self.dispatch(*kind, now).await;
                            *due = now + span(self.config.interval(*kind));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scheduler");
                    break;
                }
            }
        }
        self.persist().await;
    }
}

/// Owned periodic dispatcher
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler, restoring run state from `config.state_path`
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        let state = config
            .state_path
            .as_deref()
            .map(SchedulerState::load)
            .unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                runner,
                config,
                state: Mutex::new(state),
                in_flight: JobKind::ALL
                    .iter()
                    .map(|k| (*k, AtomicBool::new(false)))
                    .collect(),
                health: None,
                metrics: EngineMetrics::new(),
            }),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Report job failures on the scheduler health component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.health = Some(health);
        }
        self
    }

    /// Spawn the dispatch loop; a second call while running is a no-op
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        info!(
            tick_ms = self.shared.config.tick.as_millis() as u64,
            "Starting scheduler"
        );
        let shutdown = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(self.shared.clone().run_loop(shutdown)));
    }

    /// Stop dispatching and wait for the loop to exit.
    ///
    /// Job runs already in flight finish on their own.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
    }

    /// Snapshot of the run state
    pub async fn state(&self) -> SchedulerState {
        self.shared.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingRunner {
        calls: StdMutex<HashMap<JobKind, usize>>,
        delays: HashMap<JobKind, Duration>,
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingRunner {
        fn calls(&self, kind: JobKind) -> usize {
            self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, kind: JobKind) -> Result<String> {
            *self.calls.lock().unwrap().entry(kind).or_default() += 1;
            if let Some(delay) = self.delays.get(&kind) {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(*delay).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(format!("{kind} done"))
        }
    }

    fn fast_config(state_path: Option<PathBuf>) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(5),
            anomaly_scan_interval: Duration::from_millis(20),
            drift_check_interval: Duration::from_millis(20),
            scheduled_retrain_interval: Duration::from_secs(3600),
            ab_review_interval: Duration::from_secs(3600),
            startup_stagger: Duration::ZERO,
            state_path,
        }
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_skipped_not_queued() {
        let runner = Arc::new(CountingRunner {
            delays: HashMap::from([(JobKind::DriftCheck, Duration::from_millis(300))]),
            ..Default::default()
        });
        let scheduler = Scheduler::new(runner.clone(), fast_config(None));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        assert_eq!(runner.calls(JobKind::DriftCheck), 1);
        assert!(runner.calls(JobKind::AnomalyScan) > 1);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);

        let state = scheduler.state().await;
        assert!(state.job(JobKind::DriftCheck).skips > 0);
        assert_eq!(state.job(JobKind::AnomalyScan).skips, 0);
    }

    struct PanicOnceRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for PanicOnceRunner {
        async fn run(&self, kind: JobKind) -> Result<String> {
            if kind == JobKind::AnomalyScan && self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("scan blew up");
            }
            Ok(format!("{kind} done"))
        }
    }

    #[tokio::test]
    async fn test_panicking_job_runs_again_on_next_interval() {
        let runner = Arc::new(PanicOnceRunner {
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(runner.clone(), fast_config(None));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;

        assert!(runner.calls.load(Ordering::SeqCst) > 1);
        let scan = scheduler.state().await.job(JobKind::AnomalyScan);
        assert!(scan.runs > 1);
        assert_eq!(scan.skips, 0);
        assert!(matches!(
            scan.last_outcome,
            Some(JobOutcome::Succeeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_does_not_fire_everything_at_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.json");

        let mut state = SchedulerState::default();
        for kind in JobKind::ALL {
            state.job_mut(kind).last_finished = Some(Utc::now());
        }
        state.save(&path).unwrap();

        let runner = Arc::new(CountingRunner::default());
        let config = SchedulerConfig {
            anomaly_scan_interval: Duration::from_secs(3600),
            drift_check_interval: Duration::from_secs(3600),
            ..fast_config(Some(path))
        };
        let scheduler = Scheduler::new(runner.clone(), config);
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;

        for kind in JobKind::ALL {
            assert_eq!(runner.calls(kind), 0, "{kind} fired on restart");
        }
    }

    #[tokio::test]
    async fn test_first_start_staggers_job_kinds() {
        let runner = Arc::new(CountingRunner::default());
        let config = SchedulerConfig {
            startup_stagger: Duration::from_secs(3600),
            ..fast_config(None)
        };
        let scheduler = Scheduler::new(runner.clone(), config);
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;

        assert!(runner.calls(JobKind::AnomalyScan) >= 1);
        assert_eq!(runner.calls(JobKind::DriftCheck), 0);
        assert_eq!(runner.calls(JobKind::ScheduledRetrain), 0);
    }

    #[tokio::test]
    async fn test_run_state_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.json");
        let runner = Arc::new(CountingRunner::default());

        let scheduler = Scheduler::new(runner, fast_config(Some(path.clone())));
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;

        let saved = SchedulerState::load(&path);
        let scan = saved.job(JobKind::AnomalyScan);
        assert!(scan.runs >= 1);
        assert!(scan.last_finished.is_some());
        assert_eq!(
            scan.last_outcome,
            Some(JobOutcome::Succeeded {
                summary: "anomaly_scan done".into()
            })
        );
    }
}
