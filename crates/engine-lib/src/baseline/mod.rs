//! Baseline regression models
//!
//! This module provides:
//! - Ordinary least squares fitting with residual statistics
//! - The trainer that turns a window of readings into a versioned model

mod regression;
mod trainer;

pub use regression::{fit_ols, mean_and_std, r_squared_from_sums, ErrorSummary, OlsFit};
pub use trainer::{
    BaselineTrainer, FittedBaseline, TrainerConfig, TrainingSet, MIN_DRIVERS,
    MIN_TRAINING_SAMPLES,
};
