//! Anomaly detection against baseline models
//!
//! This module provides:
//! - Residual z-scoring against the active baseline
//! - Severity classification with configurable thresholds
//! - Anomaly persistence and alert emission

mod scorer;

pub use scorer::{
    AnomalyScorer, ResidualScore, ScorerConfig, SeverityThresholds, DEFAULT_STD_EPSILON,
};
