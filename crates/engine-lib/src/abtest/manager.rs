//! A/B trial management
//!
//! While a trial runs, every live reading for the machine is scored by both
//! arms for evaluation only. At the end of the trial window the arm with the
//! lower mean absolute error wins; ties keep the incumbent.

use crate::error::{EngineError, Result};
use crate::models::{
    span, AbTest, AbTestStatus, ArmMetrics, Reading, TimeWindow,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default trial length (7 days)
pub const DEFAULT_TRIAL_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Minimum samples per arm before a trial can be decided
pub const DEFAULT_MIN_TRIAL_SAMPLES: u64 = 30;

#[derive(Debug, Clone)]
pub struct AbTestConfig {
    pub trial_window: Duration,
    pub min_trial_samples: u64,
    /// MAE improvements at or below this margin count as a tie
    pub tie_epsilon: f64,
}

impl Default for AbTestConfig {
    fn default() -> Self {
        Self {
            trial_window: DEFAULT_TRIAL_WINDOW,
            min_trial_samples: DEFAULT_MIN_TRIAL_SAMPLES,
            tie_epsilon: 1e-9,
        }
    }
}

/// Outcome of reviewing every running trial
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewReport {
    pub decided: Vec<Uuid>,
    pub extended: Vec<Uuid>,
    pub pending: usize,
    pub failed: Vec<(Uuid, String)>,
}

pub struct AbTestManager {
    store: Arc<Store>,
    config: AbTestConfig,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl AbTestManager {
    pub fn new(store: Arc<Store>, config: AbTestConfig, logger: StructuredLogger) -> Self {
        Self {
            store,
            config,
            metrics: EngineMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &AbTestConfig {
        &self.config
    }

    /// Open a trial of `challenger_model_id` against the machine's active model
    pub async fn start(
        &self,
        machine_id: &str,
        challenger_model_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AbTest> {
        let challenger = self.store.model(challenger_model_id).await?;
        if challenger.machine_id != machine_id {
            return Err(EngineError::InvalidModelState {
                model_id: challenger_model_id,
                status: format!("owned by machine {}", challenger.machine_id),
                operation: format!("challenge on machine {machine_id}"),
            });
        }
        let incumbent =
            self.store
                .active_model(machine_id)
                .await
                .ok_or_else(|| EngineError::NoActiveModel {
                    machine_id: machine_id.to_string(),
                })?;

        let test = AbTest {
            id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            incumbent_model_id: incumbent.id,
            challenger_model_id,
            start: now,
            end: now + span(self.config.trial_window),
            extended: false,
            incumbent_metrics: ArmMetrics::default(),
            challenger_metrics: ArmMetrics::default(),
            winner_model_id: None,
            status: AbTestStatus::Running,
            decided_at: None,
            decision_reason: None,
        };
        let test = self.store.open_ab_test(test).await?;

        info!(
            machine_id = %machine_id,
            test_id = %test.id,
            incumbent_version = incumbent.version,
            challenger_version = challenger.version,
            ends_at = %test.end,
            "A/B trial opened"
        );
        Ok(test)
    }

    /// Score a live reading with both arms of the machine's running trial.
    ///
    /// Returns `None` when no trial is running, the reading falls outside the
    /// trial window or either arm cannot predict it.
    pub async fn record(&self, machine_id: &str, reading: &Reading) -> Result<Option<AbTest>> {
        let Some(test) = self.store.running_ab_test(machine_id).await else {
            return Ok(None);
        };
        if !TimeWindow::new(test.start, test.end).contains(reading.timestamp)
            || !reading.consumption.is_finite()
        {
            return Ok(None);
        }

        let incumbent = self.store.model(test.incumbent_model_id).await?;
        let challenger = self.store.model(test.challenger_model_id).await?;
        let (Some(incumbent_pred), Some(challenger_pred)) =
            (incumbent.predict(reading), challenger.predict(reading))
        else {
            debug!(machine_id = %machine_id, test_id = %test.id, "Reading lacks trial drivers");
            return Ok(None);
        };

        let actual = reading.consumption;
        match self
            .store
            .update_running_ab_test(test.id, |t| {
                t.incumbent_metrics.record(actual, incumbent_pred);
                t.challenger_metrics.record(actual, challenger_pred);
            })
            .await
        {
            Ok(test) => Ok(Some(test)),
            // Decided between the lookup and the update
            Err(EngineError::AbTestDecided(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decide the trial if its window has elapsed.
    ///
    /// A trial short of samples is extended once by a full window and
    /// reported as `InsufficientTrialData`; the second time it is decided for
    /// the incumbent.
    pub async fn evaluate(&self, test_id: Uuid, now: DateTime<Utc>) -> Result<AbTest> {
        let test = self.store.ab_test(test_id).await?;
        if test.status == AbTestStatus::Decided || now < test.end {
            return Ok(test);
        }

        let required = self.config.min_trial_samples;
        let incumbent_samples = test.incumbent_metrics.sample_count;
        let challenger_samples = test.challenger_metrics.sample_count;

        if incumbent_samples < required || challenger_samples < required {
            if test.extended {
                warn!(
                    test_id = %test_id,
                    incumbent_samples,
                    challenger_samples,
                    "Trial still short of samples after extension, keeping incumbent"
                );
                let incumbent = test.incumbent_model_id;
                return self
                    .decide(&test, incumbent, "insufficient_trial_data", now)
                    .await;
            }

            let extension = span(self.config.trial_window);
            let extended = self
                .store
                .update_running_ab_test(test_id, |t| {
                    t.end += extension;
                    t.extended = true;
                })
                .await?;
            info!(
                test_id = %test_id,
                incumbent_samples,
                challenger_samples,
                required,
                ends_at = %extended.end,
                "Trial extended for lack of samples"
            );
            return Err(EngineError::InsufficientTrialData {
                test_id,
                incumbent_samples,
                challenger_samples,
                required,
            });
        }

        let incumbent_mae = test.incumbent_metrics.mae();
        let challenger_mae = test.challenger_metrics.mae();
        let (winner, reason) = if incumbent_mae - challenger_mae > self.config.tie_epsilon {
            (test.challenger_model_id, "challenger_lower_mae")
        } else {
            (test.incumbent_model_id, "incumbent_retained")
        };
        debug!(
            test_id = %test_id,
            incumbent_mae,
            challenger_mae,
            "Trial compared"
        );
        self.decide(&test, winner, reason, now).await
    }

    async fn decide(
        &self,
        test: &AbTest,
        winner: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AbTest> {
        let decided = self.store.decide_ab_test(test.id, winner, reason, now).await?;
        let loser = if winner == test.challenger_model_id {
            test.incumbent_model_id
        } else {
            test.challenger_model_id
        };

        let arm = if winner == test.challenger_model_id {
            "challenger"
        } else {
            "incumbent"
        };
        self.metrics.inc_ab_decisions(arm);
        self.logger.log_promotion(
            &test.machine_id,
            &winner.to_string(),
            &loser.to_string(),
            reason,
        );
        Ok(decided)
    }

    pub async fn status(&self, test_id: Uuid) -> Result<AbTest> {
        self.store.ab_test(test_id).await
    }

    /// Evaluate every running trial whose window has elapsed
    pub async fn review(&self, now: DateTime<Utc>) -> ReviewReport {
        let mut report = ReviewReport::default();
        for test in self.store.running_ab_tests().await {
            if now < test.end {
                report.pending += 1;
                continue;
            }
            match self.evaluate(test.id, now).await {
                Ok(t) if t.status == AbTestStatus::Decided => report.decided.push(t.id),
                Ok(_) => report.pending += 1,
                Err(EngineError::InsufficientTrialData { .. }) => report.extended.push(test.id),
                Err(e) => {
                    warn!(test_id = %test.id, error = %e, "Trial review failed");
                    report.failed.push((test.id, e.code().to_string()));
                }
            }
        }
        report
    }

}
