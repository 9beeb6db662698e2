//! Error taxonomy for the model lifecycle engine
//!
//! Every variant maps to a stable code so that an operator-facing layer can
//! surface failures without parsing messages.

use thiserror::Error;
use uuid::Uuid;

/// Result type used across the engine library
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine components
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Fewer drivers than the trainer requires
    #[error("insufficient drivers: got {provided}, need at least {required}")]
    InsufficientDrivers { provided: usize, required: usize },

    /// Not enough usable samples for the requested operation
    #[error("insufficient data for machine {machine_id}: {reason}")]
    InsufficientData { machine_id: String, reason: String },

    /// The machine has no model in `active` status
    #[error("no active model for machine {machine_id}")]
    NoActiveModel { machine_id: String },

    /// The time series source has no readings in range
    #[error("no data for machine {machine_id}")]
    NoData { machine_id: String },

    /// One arm of an A/B test is below the sample guard
    #[error(
        "insufficient trial data for test {test_id}: incumbent {incumbent_samples}, \
         challenger {challenger_samples}, need {required}"
    )]
    InsufficientTrialData {
        test_id: Uuid,
        incumbent_samples: u64,
        challenger_samples: u64,
        required: u64,
    },

    /// Training exceeded its wall-clock budget
    #[error("training timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("model not found: {0}")]
    ModelNotFound(Uuid),

    #[error("retrain job not found: {0}")]
    JobNotFound(Uuid),

    #[error("ab test not found: {0}")]
    AbTestNotFound(Uuid),

    #[error("anomaly not found: {0}")]
    AnomalyNotFound(Uuid),

    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),

    /// A model is not in a status that allows the requested operation
    #[error("model {model_id} is {status}, cannot {operation}")]
    InvalidModelState {
        model_id: Uuid,
        status: String,
        operation: String,
    },

    /// A retrain job state transition that would move backwards or leave a
    /// terminal state
    #[error("invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    /// An A/B test is already running for the machine
    #[error("ab test {test_id} already running for machine {machine_id}")]
    AbTestInProgress { machine_id: String, test_id: Uuid },

    /// The A/B test already has a winner
    #[error("ab test {0} already decided")]
    AbTestDecided(Uuid),

    /// Bootstrap activation requested while a model is already active
    #[error("machine {machine_id} already has active model {model_id}")]
    ActiveModelExists { machine_id: String, model_id: Uuid },

    /// Failure reported by the time series source
    #[error("time series source error: {message}")]
    Source { message: String, transient: bool },

    /// Snapshot read/write failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The training task panicked or was aborted
    #[error("training aborted: {0}")]
    TrainingAborted(String),

    /// The component is shutting down
    #[error("engine is shutting down")]
    Shutdown,
}

impl EngineError {
    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientDrivers { .. } => "insufficient_drivers",
            EngineError::InsufficientData { .. } => "insufficient_data",
            EngineError::NoActiveModel { .. } => "no_active_model",
            EngineError::NoData { .. } => "no_data",
            EngineError::InsufficientTrialData { .. } => "insufficient_trial_data",
            EngineError::Timeout { .. } => "timeout",
            EngineError::MachineNotFound(_) => "machine_not_found",
            EngineError::ModelNotFound(_) => "model_not_found",
            EngineError::JobNotFound(_) => "job_not_found",
            EngineError::AbTestNotFound(_) => "ab_test_not_found",
            EngineError::AnomalyNotFound(_) => "anomaly_not_found",
            EngineError::AlertNotFound(_) => "alert_not_found",
            EngineError::InvalidModelState { .. } => "invalid_model_state",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AbTestInProgress { .. } => "ab_test_in_progress",
            EngineError::AbTestDecided(_) => "ab_test_decided",
            EngineError::ActiveModelExists { .. } => "active_model_exists",
            EngineError::Source { .. } => "source_error",
            EngineError::Persistence(_) => "persistence_error",
            EngineError::TrainingAborted(_) => "training_aborted",
            EngineError::Shutdown => "shutdown",
        }
    }

    /// Whether a retry at the source boundary may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Source { transient: true, .. })
    }

    /// Data-availability failures are recovered locally by the caller
    pub fn is_data_availability(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. }
                | EngineError::NoData { .. }
                | EngineError::InsufficientTrialData { .. }
        )
    }

    pub(crate) fn insufficient_data(machine_id: &str, reason: impl Into<String>) -> Self {
        EngineError::InsufficientData {
            machine_id: machine_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = vec![
            EngineError::InsufficientDrivers {
                provided: 2,
                required: 3,
            },
            EngineError::insufficient_data("m1", "too few"),
            EngineError::NoActiveModel {
                machine_id: "m1".into(),
            },
            EngineError::NoData {
                machine_id: "m1".into(),
            },
            EngineError::InsufficientTrialData {
                test_id: Uuid::nil(),
                incumbent_samples: 1,
                challenger_samples: 1,
                required: 30,
            },
            EngineError::Timeout { seconds: 5 },
        ];

        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_transient_classification() {
        let transient = EngineError::Source {
            message: "connection reset".into(),
            transient: true,
        };
        let permanent = EngineError::Source {
            message: "bad machine id".into(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!EngineError::NoData {
            machine_id: "m1".into()
        }
        .is_transient());
    }

    #[test]
    fn test_data_availability() {
        assert!(EngineError::insufficient_data("m1", "x").is_data_availability());
        assert!(!EngineError::Timeout { seconds: 1 }.is_data_availability());
    }
}
