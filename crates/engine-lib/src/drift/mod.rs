//! Drift detection for active baselines
//!
//! This module provides:
//! - Trailing-window evaluation of the active model
//! - Consecutive-cycle degradation tracking per model
//! - Drift events, alerts and retrain requests on sustained degradation

mod monitor;

pub use monitor::{DriftConfig, DriftMonitor, DriftReport};
