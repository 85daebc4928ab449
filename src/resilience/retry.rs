// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two failure profiles exist in the sync pipeline: opening the durable
//! outbox at startup (a bad path or locked file should fail fast and
//! loudly), and reaching the broker at runtime (an outage should never kill
//! the engine; events wait in the outbox however long it lasts).
//!
//! # Example
//!
//! ```
//! use catalog_sync::RetryConfig;
//!
//! // Startup: surface configuration errors quickly
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Runtime delivery: never give up, the outbox holds the backlog
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail profile for opening the outbox (or any startup resource):
    /// 5 attempts over a few seconds, then the error surfaces to the caller.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite-retry profile for runtime broker delivery. Backoff caps at
    /// 5 minutes; undelivered events sit in the outbox meanwhile, so giving
    /// up would only trade a delay for data loss.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Minimal delays for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        operation = operation_name,
                        attempts, "Operation succeeded after retries"
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, retrying"
                    );
                } else {
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_retry = ?delay,
                        "Operation failed, will retry indefinitely"
                    );
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}
