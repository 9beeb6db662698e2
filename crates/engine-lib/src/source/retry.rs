//! Bounded exponential backoff at the source boundary
//!
//! Transient source failures are retried here so that trainer, scorer and
//! drift monitor never see connection-level hiccups. Non-transient errors
//! (including `NoData`) pass straight through.

use super::{async_trait, TimeSeriesSource};
use crate::error::Result;
use crate::models::Reading;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Configuration for source retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Initial backoff between attempts
    pub initial_backoff: Duration,
    /// Maximum backoff between attempts
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.initial_backoff.saturating_mul(factor), self.max_backoff)
    }
}

/// Source wrapper that retries transient failures
pub struct RetryingSource {
    inner: Arc<dyn TimeSeriesSource>,
    config: RetryConfig,
}

impl RetryingSource {
    pub fn new(inner: Arc<dyn TimeSeriesSource>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, machine_id: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff_for(attempt);
                    warn!(
                        operation = op,
                        machine_id = %machine_id,
                        attempt = attempt,
                        next_backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient source failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl TimeSeriesSource for RetryingSource {
    async fn read_window(
        &self,
        machine_id: &str,
        driver_names: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        self.with_retry("read_window", machine_id, || {
            self.inner.read_window(machine_id, driver_names, start, end)
        })
        .await
    }

    async fn read_latest(&self, machine_id: &str) -> Result<Reading> {
        self.with_retry("read_latest", machine_id, || {
            self.inner.read_latest(machine_id)
        })
        .await
    }
}
