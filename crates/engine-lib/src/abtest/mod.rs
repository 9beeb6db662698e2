//! A/B comparison between an incumbent and a challenger baseline
//!
//! This module provides:
//! - Trial lifecycle (open, accumulate per-arm errors, extend once, decide)
//! - Promotion through the store's atomic activation swap

mod manager;

pub use manager::{AbTestConfig, AbTestManager, ReviewReport};
