//! Baseline model lifecycle engine for industrial energy monitoring
//!
//! This crate provides the core functionality for:
//! - Fitting per-machine regression baselines of consumption on drivers
//! - Scoring live readings and raising anomaly alerts
//! - Detecting drift and orchestrating retraining
//! - A/B trials that decide model promotion
//! - Periodic scheduling, health checks and observability

pub mod abtest;
pub mod anomaly;
pub mod baseline;
pub mod drift;
pub mod engine;
pub mod error;
pub mod health;
pub mod locks;
pub mod models;
pub mod observability;
pub mod retrain;
pub mod scheduler;
pub mod source;
pub mod store;

pub use engine::{Engine, EngineConfig, ScanReport};
pub use error::{EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use scheduler::{JobKind, JobRunner, Scheduler, SchedulerConfig};
pub use store::Store;
