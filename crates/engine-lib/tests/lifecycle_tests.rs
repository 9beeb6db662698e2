//! End-to-end model lifecycle through the engine facade:
//! bootstrap, drift, retrain, A/B trial, promotion and restart.

use chrono::{DateTime, Duration, Utc};
use engine_lib::source::InMemorySource;
use engine_lib::{
    AbTestStatus, AlertFilter, AlertSource, DriftCheck, DriftDecision, Engine, EngineConfig,
    HealthRegistry, JobState, Machine, ModelStatus, Reading, RetrainTrigger, Severity, Store,
    TimeWindow,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const MACHINE: &str = "compressor-7";
const SHIFT: f64 = 40.0;

fn drivers() -> Vec<String> {
    vec!["load".into(), "ambient".into(), "pressure".into()]
}

fn reading(ts: DateTime<Utc>, i: i64, bias: f64) -> Reading {
    let load = 40.0 + ((i * 7) % 13) as f64 * 4.0;
    let ambient = 12.0 + ((i * 5) % 11) as f64;
    let pressure = 6.0 + ((i * 3) % 7) as f64 * 0.5;
    let noise = ((i * 17) % 5) as f64 * 0.1 - 0.2;
    Reading::new(
        ts,
        20.0 + 1.8 * load + 0.6 * ambient + 3.0 * pressure + noise + bias,
    )
    .with_driver("load", load)
    .with_driver("ambient", ambient)
    .with_driver("pressure", pressure)
}

struct Harness {
    engine: Engine,
    source: Arc<InMemorySource>,
    now: DateTime<Utc>,
}

impl Harness {
    async fn new(store: Store) -> Self {
        let source = Arc::new(InMemorySource::new());
        let engine = Engine::new(
            source.clone(),
            Arc::new(store),
            EngineConfig::default(),
            HealthRegistry::with_engine_components().await,
        );
        engine
            .register_machine(Machine {
                id: MACHINE.into(),
                machine_type: "air_compressor".into(),
                active: true,
            })
            .await;
        Self {
            engine,
            source,
            now: Utc::now(),
        }
    }

    /// Two days of normal operation ending a day ago, then a day shifted up
    fn seed_level_shift(&self) {
        for i in 25..=72 {
            self.source
                .push(MACHINE, reading(self.now - Duration::hours(i), i, 0.0));
        }
        for i in 1..=20 {
            self.source
                .push(MACHINE, reading(self.now - Duration::hours(i), i, SHIFT));
        }
    }

    async fn active_count(&self) -> usize {
        self.engine.store().count_active(MACHINE).await
    }
}

#[tokio::test]
async fn test_drift_retrain_trial_and_promotion() {
    let h = Harness::new(Store::new()).await;
    h.seed_level_shift();

    // Bootstrap on the pre-shift history
    let history = TimeWindow::new(h.now - Duration::hours(73), h.now - Duration::hours(24));
    let incumbent = h
        .engine
        .train_baseline(MACHINE, history, &drivers())
        .await
        .unwrap();
    assert_eq!(incumbent.status, ModelStatus::Training);
    assert_eq!(h.active_count().await, 0);
    h.engine.activate_baseline(incumbent.id).await.unwrap();
    assert_eq!(h.active_count().await, 1);

    // First breach is recorded but ignored
    let first = h.engine.check_drift_at(MACHINE, h.now).await.unwrap();
    let DriftCheck::Event(first) = first else {
        panic!("expected a drift event");
    };
    assert_eq!(first.decision, DriftDecision::Ignored);
    assert_eq!(first.consecutive_breaches, 1);
    assert!(first.degradation_ratio > 1.5);
    assert!(h.engine.store().jobs_for_machine(MACHINE).await.is_empty());

    // Second consecutive breach triggers a retrain
    let second = h.engine.check_drift_at(MACHINE, h.now).await.unwrap();
    let DriftCheck::Event(second) = second else {
        panic!("expected a drift event");
    };
    assert_eq!(second.decision, DriftDecision::RetrainTriggered);

    let jobs = h.engine.store().jobs_for_machine(MACHINE).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, RetrainTrigger::Drift);
    assert_eq!(jobs[0].state, JobState::Queued);
    assert_eq!(jobs[0].triggering_model_id, Some(incumbent.id));

    let drift_alerts = h
        .engine
        .list_active_alerts(&AlertFilter {
            machine_id: Some(MACHINE.into()),
            ..Default::default()
        })
        .await
        .into_iter()
        .filter(|a| a.source == AlertSource::Drift)
        .collect::<Vec<_>>();
    assert_eq!(drift_alerts.len(), 1);
    assert_eq!(drift_alerts[0].reference_id, second.id);

    // Retraining puts the new model on trial against the incumbent
    let job = h
        .engine
        .retrain_coordinator()
        .run_job(jobs[0].id)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
    let challenger_id = job.produced_model_id.unwrap();
    let challenger = h.engine.store().model(challenger_id).await.unwrap();
    assert_eq!(challenger.status, ModelStatus::Challenger);
    assert_eq!(challenger.version, incumbent.version + 1);
    assert_eq!(h.active_count().await, 1);

    let test = h.engine.store().running_ab_test(MACHINE).await.unwrap();
    assert_eq!(test.incumbent_model_id, incumbent.id);
    assert_eq!(test.challenger_model_id, challenger_id);

    // Live readings keep the shift; only the challenger absorbed part of it
    for i in 0..40 {
        let ts = test.start + Duration::minutes(i + 1);
        let anomaly = h
            .engine
            .score_reading(MACHINE, &reading(ts, i, SHIFT))
            .await
            .unwrap();
        assert_eq!(anomaly.model_id, incumbent.id);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(h.active_count().await, 1);
    }

    let running = h.engine.get_ab_test_status(test.id).await.unwrap();
    assert_eq!(running.incumbent_metrics.sample_count, 40);
    assert!(running.challenger_metrics.mae() < running.incumbent_metrics.mae());

    // Still inside the trial window: nothing is decided
    let early = h
        .engine
        .evaluate_ab_test(test.id, test.start + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(early.status, AbTestStatus::Running);

    let decided = h
        .engine
        .evaluate_ab_test(test.id, test.end + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(decided.status, AbTestStatus::Decided);
    assert_eq!(decided.winner_model_id, Some(challenger_id));
    assert_eq!(decided.decision_reason.as_deref(), Some("challenger_lower_mae"));

    assert_eq!(h.active_count().await, 1);
    let active = h.engine.store().active_model(MACHINE).await.unwrap();
    assert_eq!(active.id, challenger_id);
    let retired = h.engine.store().model(incumbent.id).await.unwrap();
    assert_eq!(retired.status, ModelStatus::Retired);

    // Each arm gets a performance record for the trial
    let challenger_history = h.engine.performance_history(challenger_id).await.unwrap();
    assert!(!challenger_history.is_empty());

    // Evaluating again is a no-op
    let again = h
        .engine
        .evaluate_ab_test(test.id, test.end + Duration::days(3))
        .await
        .unwrap();
    assert_eq!(again, decided);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_promotion_never_exposes_zero_or_two_active_models() {
    let h = Harness::new(Store::new()).await;
    h.seed_level_shift();

    let history = TimeWindow::new(h.now - Duration::hours(73), h.now - Duration::hours(24));
    let incumbent = h
        .engine
        .train_baseline(MACHINE, history, &drivers())
        .await
        .unwrap();
    h.engine.activate_baseline(incumbent.id).await.unwrap();
    let challenger = h
        .engine
        .train_baseline(MACHINE, TimeWindow::trailing(h.now, Duration::days(30)), &drivers())
        .await
        .unwrap();
    let test = h.engine.start_ab_test(MACHINE, challenger.id).await.unwrap();
    for i in 0..40 {
        let ts = test.start + Duration::minutes(i + 1);
        h.engine
            .score_reading(MACHINE, &reading(ts, i, SHIFT))
            .await
            .unwrap();
    }

    let store = h.engine.store().clone();
    let stop = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicUsize::new(0));
    let arms = [incumbent.id, challenger.id];
    let reader = tokio::spawn({
        let stop = stop.clone();
        let seen = seen.clone();
        async move {
            while !stop.load(Ordering::Acquire) {
                assert_eq!(store.count_active(MACHINE).await, 1);
                let active = store.active_model(MACHINE).await.expect("no active model");
                assert_eq!(active.status, ModelStatus::Active);
                assert!(arms.contains(&active.id));
                seen.fetch_add(1, Ordering::AcqRel);
                tokio::task::yield_now().await;
            }
        }
    });

    while seen.load(Ordering::Acquire) == 0 {
        tokio::task::yield_now().await;
    }
    let decided = h
        .engine
        .evaluate_ab_test(test.id, test.end + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(decided.winner_model_id, Some(challenger.id));

    let after = seen.load(Ordering::Acquire);
    while seen.load(Ordering::Acquire) < after + 50 {
        tokio::task::yield_now().await;
    }
    stop.store(true, Ordering::Release);
    reader.await.unwrap();

    let active = h.engine.store().active_model(MACHINE).await.unwrap();
    assert_eq!(active.id, challenger.id);
}

#[tokio::test]
async fn test_recovered_breach_resets_consecutive_count() {
    let h = Harness::new(Store::new()).await;
    for i in 1..=72 {
        h.source
            .push(MACHINE, reading(h.now - Duration::hours(i), i, 0.0));
    }
    let model = h
        .engine
        .train_baseline(MACHINE, TimeWindow::trailing(h.now, Duration::hours(73)), &drivers())
        .await
        .unwrap();
    h.engine.activate_baseline(model.id).await.unwrap();

    // Healthy model: no event and no job
    let check = h.engine.check_drift_at(MACHINE, h.now).await.unwrap();
    assert_eq!(check, DriftCheck::NoDriftDetected);

    // A shifted hour later breaches once
    let later = h.now + Duration::hours(12);
    for i in 0..12 {
        h.source.push(
            MACHINE,
            reading(h.now + Duration::minutes(i * 60 + 1), i, SHIFT),
        );
    }
    let DriftCheck::Event(event) = h.engine.check_drift_at(MACHINE, later).await.unwrap() else {
        panic!("expected a drift event");
    };
    assert_eq!(event.decision, DriftDecision::Ignored);

    // Evaluating a clean window clears the streak
    let check = h.engine.check_drift_at(MACHINE, h.now).await.unwrap();
    assert_eq!(check, DriftCheck::NoDriftDetected);

    let DriftCheck::Event(event) = h.engine.check_drift_at(MACHINE, later).await.unwrap() else {
        panic!("expected a drift event");
    };
    assert_eq!(event.decision, DriftDecision::Ignored);
    assert_eq!(event.consecutive_breaches, 1);
    assert!(h.engine.store().jobs_for_machine(MACHINE).await.is_empty());
}

#[tokio::test]
async fn test_snapshot_restores_lifecycle_state_exactly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");

    let h = Harness::new(Store::new()).await;
    h.seed_level_shift();
    let history = TimeWindow::new(h.now - Duration::hours(73), h.now - Duration::hours(24));
    let model = h
        .engine
        .train_baseline(MACHINE, history, &drivers())
        .await
        .unwrap();
    h.engine.activate_baseline(model.id).await.unwrap();
    h.engine
        .score_reading(MACHINE, &reading(h.now, 3, SHIFT))
        .await
        .unwrap();
    h.engine.check_drift_at(MACHINE, h.now).await.unwrap();
    let job = h.engine.trigger_retrain(MACHINE).await.unwrap();

    assert!(h.engine.store().flush(&path).await.unwrap());
    assert!(!h.engine.store().flush(&path).await.unwrap());

    let restored = Harness::new(Store::load_snapshot(&path).unwrap()).await;
    let store = restored.engine.store();
    assert_eq!(restored.engine.publish_store_gauges().await, 1);

    assert_eq!(
        store.models_for_machine(MACHINE).await,
        h.engine.store().models_for_machine(MACHINE).await
    );
    assert_eq!(store.active_model(MACHINE).await.unwrap(), model);
    assert_eq!(
        store.anomalies_for_machine(MACHINE).await,
        h.engine.store().anomalies_for_machine(MACHINE).await
    );
    assert_eq!(
        store.drift_events_for_machine(MACHINE).await,
        h.engine.store().drift_events_for_machine(MACHINE).await
    );
    assert_eq!(store.job(job.id).await.unwrap(), job);
    assert_eq!(
        store.metrics_for_model(model.id).await,
        h.engine.store().metrics_for_model(model.id).await
    );

    // Queued work survives the restart and is still idempotent
    let again = restored.engine.trigger_retrain(MACHINE).await.unwrap();
    assert_eq!(again.id, job.id);
}

#[tokio::test]
async fn test_corrupted_snapshot_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");

    let h = Harness::new(Store::new()).await;
    h.engine.store().save_snapshot(&path).await.unwrap();

    let mut data = std::fs::read(&path).unwrap();
    data.extend_from_slice(b" ");
    std::fs::write(&path, data).unwrap();

    let err = Store::load_snapshot(&path).unwrap_err();
    assert_eq!(err.code(), "persistence_error");
}
