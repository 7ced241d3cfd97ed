// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Retry
//!
//! Every handler invocation is retried a fixed number of times with an
//! exponentially growing delay. Shutdown interrupts the wait between attempts.

use crate::{
    errors::{AmqpError, HandlerError},
    shutdown::Shutdown,
};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Default number of attempts, the first call included
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Default delay before the second attempt
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);
/// Default growth factor of the delay
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Retry policy applied to each handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
    multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `attempts` is clamped to at least one call.
    pub fn new(attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }

    /// Sets the backoff multiplier; values below 1 keep the delay constant.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        self.delay.mul_f64(self.multiplier.powi(exponent))
    }

    /// Runs `operation` until it succeeds, attempts run out or shutdown fires.
    ///
    /// The operation receives the 1-based attempt number. The first attempt always
    /// runs; shutdown is only checked while waiting between attempts.
    pub async fn run<T, F, Fut>(&self, shutdown: &Shutdown, mut operation: F) -> Result<T, HandlerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let mut shutdown = shutdown.clone();
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.attempts {
                return Err(err);
            }

            let delay = self.delay_after(attempt);
            warn!(
                attempt,
                error = err.to_string(),
                delay_ms = delay.as_millis() as u64,
                "handler failed, retrying"
            );

            tokio::select! {
                _ = shutdown.triggered() => return Err(Box::new(AmqpError::RetryCancelled)),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
