//! Daemon support for the baseline engine: configuration and the
//! health/metrics HTTP surface.

pub mod api;
pub mod config;
