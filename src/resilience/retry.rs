// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides the backoff schedule used by the connection manager and a
//! generic retry loop for transient failures.
//!
//! # Example
//!
//! ```
//! use cache_router::resilience::retry::RetryConfig;
//! use std::time::Duration;
//!
//! // Reconnect: 1s, 2s, 4s ... capped at 30s, degraded after 10
//! let reconnect = RetryConfig::reconnect();
//! assert_eq!(reconnect.max_retries, Some(10));
//! assert_eq!(reconnect.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(reconnect.delay_for_attempt(4), Duration::from_secs(8));
//! assert_eq!(reconnect.delay_for_attempt(9), Duration::from_secs(30));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RouterConfig;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::reconnect()`] - Remote reconnection schedule
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl RetryConfig {
    /// Reconnection schedule: `min(1s * 2^(n-1), 30s)`, 10 attempts.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            max_retries: Some(10),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Reconnection schedule from router settings.
    #[must_use]
    pub fn from_router_config(config: &RouterConfig) -> Self {
        Self {
            max_retries: Some(config.max_reconnect_attempts as usize),
            initial_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(initial * factor^(attempt-1), max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        if self.factor.fract() == 0.0 && self.factor >= 1.0 {
            // Integral factors stay exact in nanoseconds
            let scaled = (self.factor as u128)
                .checked_pow(exponent)
                .and_then(|m| self.initial_delay.as_nanos().checked_mul(m));
            return match scaled {
                Some(nanos) if nanos < self.max_delay.as_nanos() => Duration::from_nanos(nanos as u64),
                _ => self.max_delay,
            };
        }
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
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
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts as usize >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
            }
        }
    }
}
