// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::app::errors::AppResult;
use crate::app::ports::ClockPort;
use crate::app::types::RetryPolicy;

/// Re-runs a fallible operation with a uniformly random pause between attempts.
///
/// Only errors reporting `is_retryable()` are repeated; authentication and
/// transport failures are returned from the first attempt.
#[derive(Clone)]
pub struct Retry {
    policy: RetryPolicy,
    clock: Arc<dyn ClockPort>,
}

impl Retry {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn ClockPort>) -> Self {
        Self { policy, clock }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let wait = self.backoff();
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "attempt failed: {err}"
                    );
                    self.clock.sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(op = label, attempt, "giving up: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn backoff(&self) -> Duration {
        let RetryPolicy {
            min_wait, max_wait, ..
        } = self.policy;
        if max_wait <= min_wait {
            return min_wait;
        }
        rand::rng().random_range(min_wait..=max_wait)
    }
}
