//! Retraining orchestration
//!
//! This module provides:
//! - An idempotent per-machine job queue with a forward-only state machine
//! - A bounded worker that trains replacement baselines under a timeout
//! - Hand-off of new models to bootstrap activation or an A/B trial

mod coordinator;

pub use coordinator::{RetrainConfig, RetrainCoordinator};
