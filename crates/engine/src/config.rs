//! Daemon configuration
//!
//! Loaded from an optional TOML file, then `ENGINE_*` environment variables
//! (nested keys separated by `__`, e.g. `ENGINE_API__PORT=9090`). Every
//! field has a default matching the library defaults.

use anyhow::{ensure, Context, Result};
use engine_lib::abtest::AbTestConfig;
use engine_lib::anomaly::{ScorerConfig, SeverityThresholds};
use engine_lib::baseline::TrainerConfig;
use engine_lib::drift::DriftConfig;
use engine_lib::retrain::RetrainConfig;
use engine_lib::source::RetryConfig;
use engine_lib::{EngineConfig, Machine, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "baseline-engine.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Instance name attached to structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    #[serde(default)]
    pub api: ApiSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub source: SourceSection,

    #[serde(default)]
    pub training: TrainingSection,

    #[serde(default)]
    pub scoring: ScoringSection,

    #[serde(default)]
    pub drift: DriftSection,

    #[serde(default)]
    pub retrain: RetrainSection,

    #[serde(default)]
    pub abtest: AbTestSection,

    #[serde(default)]
    pub schedule: ScheduleSection,

    /// Machines to register at startup
    #[serde(default)]
    pub machines: Vec<MachineEntry>,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "baseline-engine".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory holding the store snapshot and scheduler state
    pub state_dir: PathBuf,
    pub snapshot_interval_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            snapshot_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// Directory of `<machine_id>.jsonl` reading files
    pub data_dir: PathBuf,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            data_dir: PathBuf::from("./data"),
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    pub min_drivers: usize,
    pub min_samples: usize,
}

impl Default for TrainingSection {
    fn default() -> Self {
        let trainer = TrainerConfig::default();
        Self {
            min_drivers: trainer.min_drivers,
            min_samples: trainer.min_samples,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSection {
    pub warning_z: f64,
    pub critical_z: f64,
    pub confidence_scale: f64,
    pub scan_concurrency: usize,
}

impl Default for ScoringSection {
    fn default() -> Self {
        let scorer = ScorerConfig::default();
        Self {
            warning_z: scorer.thresholds.warning,
            critical_z: scorer.thresholds.critical,
            confidence_scale: scorer.confidence_scale,
            scan_concurrency: EngineConfig::default().scan_concurrency,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriftSection {
    pub evaluation_window_secs: u64,
    pub min_evaluation_samples: usize,
    pub degradation_ratio: f64,
    pub consecutive_cycles: u32,
}

impl Default for DriftSection {
    fn default() -> Self {
        let drift = DriftConfig::default();
        Self {
            evaluation_window_secs: drift.evaluation_window.as_secs(),
            min_evaluation_samples: drift.min_evaluation_samples,
            degradation_ratio: drift.degradation_ratio,
            consecutive_cycles: drift.consecutive_cycles,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrainSection {
    pub max_concurrent_trainings: usize,
    pub training_timeout_secs: u64,
    pub retrain_window_secs: u64,
    pub max_model_age_secs: u64,
}

impl Default for RetrainSection {
    fn default() -> Self {
        let retrain = RetrainConfig::default();
        Self {
            max_concurrent_trainings: retrain.max_concurrent_trainings,
            training_timeout_secs: retrain.training_timeout.as_secs(),
            retrain_window_secs: retrain.retrain_window.as_secs(),
            max_model_age_secs: retrain.retrain_max_model_age.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbTestSection {
    pub trial_window_secs: u64,
    pub min_trial_samples: u64,
    pub tie_epsilon: f64,
}

impl Default for AbTestSection {
    fn default() -> Self {
        let abtest = AbTestConfig::default();
        Self {
            trial_window_secs: abtest.trial_window.as_secs(),
            min_trial_samples: abtest.min_trial_samples,
            tie_epsilon: abtest.tie_epsilon,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub tick_ms: u64,
    pub anomaly_scan_interval_secs: u64,
    pub drift_check_interval_secs: u64,
    pub scheduled_retrain_interval_secs: u64,
    pub ab_review_interval_secs: u64,
    pub startup_stagger_secs: u64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        let schedule = SchedulerConfig::default();
        Self {
            tick_ms: schedule.tick.as_millis() as u64,
            anomaly_scan_interval_secs: schedule.anomaly_scan_interval.as_secs(),
            drift_check_interval_secs: schedule.drift_check_interval.as_secs(),
            scheduled_retrain_interval_secs: schedule.scheduled_retrain_interval.as_secs(),
            ab_review_interval_secs: schedule.ab_review_interval.as_secs(),
            startup_stagger_secs: schedule.startup_stagger.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEntry {
    pub id: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_machine_type() -> String {
    "generic".to_string()
}

fn default_true() -> bool {
    true
}

impl From<&MachineEntry> for Machine {
    fn from(entry: &MachineEntry) -> Self {
        Machine {
            id: entry.id.clone(),
            machine_type: entry.machine_type.clone(),
            active: entry.active,
        }
    }
}

impl DaemonConfig {
    /// Load from `path` (or the default file if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring;
        ensure!(
            scoring.warning_z > 0.0 && scoring.warning_z < scoring.critical_z,
            "scoring.warning_z ({}) must be positive and below scoring.critical_z ({})",
            scoring.warning_z,
            scoring.critical_z
        );
        ensure!(scoring.confidence_scale > 0.0, "scoring.confidence_scale must be positive");
        ensure!(scoring.scan_concurrency >= 1, "scoring.scan_concurrency must be at least 1");

        ensure!(self.training.min_drivers >= 1, "training.min_drivers must be at least 1");
        ensure!(self.training.min_samples >= 1, "training.min_samples must be at least 1");

        ensure!(self.drift.degradation_ratio > 0.0, "drift.degradation_ratio must be positive");
        ensure!(self.drift.consecutive_cycles >= 1, "drift.consecutive_cycles must be at least 1");
        ensure!(
            self.retrain.max_concurrent_trainings >= 1,
            "retrain.max_concurrent_trainings must be at least 1"
        );
        ensure!(self.abtest.tie_epsilon >= 0.0, "abtest.tie_epsilon must not be negative");

        let durations = [
            ("storage.snapshot_interval_secs", self.storage.snapshot_interval_secs),
            ("drift.evaluation_window_secs", self.drift.evaluation_window_secs),
            ("retrain.training_timeout_secs", self.retrain.training_timeout_secs),
            ("retrain.retrain_window_secs", self.retrain.retrain_window_secs),
            ("retrain.max_model_age_secs", self.retrain.max_model_age_secs),
            ("abtest.trial_window_secs", self.abtest.trial_window_secs),
            ("schedule.tick_ms", self.schedule.tick_ms),
            ("schedule.anomaly_scan_interval_secs", self.schedule.anomaly_scan_interval_secs),
            ("schedule.drift_check_interval_secs", self.schedule.drift_check_interval_secs),
            (
                "schedule.scheduled_retrain_interval_secs",
                self.schedule.scheduled_retrain_interval_secs,
            ),
            ("schedule.ab_review_interval_secs", self.schedule.ab_review_interval_secs),
        ];
        for (name, value) in durations {
            ensure!(value > 0, "{name} must be non-zero");
        }

        let mut seen = std::collections::HashSet::new();
        for machine in &self.machines {
            ensure!(!machine.id.is_empty(), "machine ids must not be empty");
            ensure!(seen.insert(&machine.id), "machine {} is listed twice", machine.id);
        }
        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.storage.state_dir.join("store.json")
    }

    pub fn scheduler_state_path(&self) -> PathBuf {
        self.storage.state_dir.join("scheduler.json")
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.storage.snapshot_interval_secs.max(1))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.source.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.source.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.source.max_backoff_ms),
        }
    }

    /// Library configuration built from the daemon sections
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            instance: self.instance.clone(),
            trainer: TrainerConfig {
                min_drivers: self.training.min_drivers,
                min_samples: self.training.min_samples,
            },
            scorer: ScorerConfig {
                thresholds: SeverityThresholds {
                    warning: self.scoring.warning_z,
                    critical: self.scoring.critical_z,
                },
                confidence_scale: self.scoring.confidence_scale,
                ..ScorerConfig::default()
            },
            drift: DriftConfig {
                evaluation_window: Duration::from_secs(self.drift.evaluation_window_secs),
                min_evaluation_samples: self.drift.min_evaluation_samples,
                degradation_ratio: self.drift.degradation_ratio,
                consecutive_cycles: self.drift.consecutive_cycles,
                ..DriftConfig::default()
            },
            retrain: RetrainConfig {
                max_concurrent_trainings: self.retrain.max_concurrent_trainings,
                training_timeout: Duration::from_secs(self.retrain.training_timeout_secs),
                retrain_window: Duration::from_secs(self.retrain.retrain_window_secs),
                retrain_max_model_age: Duration::from_secs(self.retrain.max_model_age_secs),
            },
            abtest: AbTestConfig {
                trial_window: Duration::from_secs(self.abtest.trial_window_secs),
                min_trial_samples: self.abtest.min_trial_samples,
                tie_epsilon: self.abtest.tie_epsilon,
            },
            scheduler: SchedulerConfig {
                tick: Duration::from_millis(self.schedule.tick_ms.max(1)),
                anomaly_scan_interval: Duration::from_secs(self.schedule.anomaly_scan_interval_secs),
                drift_check_interval: Duration::from_secs(self.schedule.drift_check_interval_secs),
                scheduled_retrain_interval: Duration::from_secs(
                    self.schedule.scheduled_retrain_interval_secs,
                ),
                ab_review_interval: Duration::from_secs(self.schedule.ab_review_interval_secs),
                startup_stagger: Duration::from_secs(self.schedule.startup_stagger_secs),
                state_path: Some(self.scheduler_state_path()),
            },
            scan_concurrency: self.scoring.scan_concurrency,
        }
    }
}
