// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for backend calls.
//!
//! Connections opened while the engine starts use [`RetryConfig::startup`]
//! so that a wrong Redis address or SQL URL fails within seconds instead of
//! hanging the process. Single authoritative-store queries use
//! [`RetryConfig::query`]; whatever still fails after that is the caller's
//! to absorb (sync reports it, the decision path never calls the store).
//!
//! ```
//! use firewall_engine::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert_eq!(startup.delays().count(), 4);
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total calls, including the first. Zero behaves like one.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 5 attempts, 200ms doubling to 2s.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// 3 quick attempts.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Sleeps between consecutive attempts: one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let gaps = self.max_attempts.max(1) - 1;
        std::iter::successors(Some(self.initial_delay), move |d| {
            Some(d.mul_f64(self.factor).min(self.max_delay))
        })
        .take(gaps)
    }
}

/// Run `operation` until it succeeds or the attempts run out, returning the
/// last error in the latter case.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = config.delays();
    let mut attempt = 1usize;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        let Some(delay) = delays.next() else {
            warn!(operation = operation_name, attempts = attempt, error = %err, "Giving up");
            return Err(err);
        };
        warn!(operation = operation_name, attempt, error = %err, ?delay, "Backend call failed, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
