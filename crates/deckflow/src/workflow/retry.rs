//! Uniform retry policy with exponential backoff and jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::providers::{ErrorKind, SourceError};

/// Retry policy for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Same attempt budget with no waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based): 1s, 2s, 4s, ... capped, then jittered
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_millis((capped * factor).round() as u64)
    }
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub retried: bool,
}

#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Succeeded(T),
    Failed(SourceError),
    Cancelled,
}

/// Result of running one unit under a policy
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: AttemptOutcome<T>,
    pub failures: Vec<AttemptFailure>,
    /// Retries consumed, never above the policy's `max_retries`
    pub retries: u32,
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or the token fires.
///
/// Only transient kinds are retried. The token is checked before every attempt; an attempt or
/// backoff still in flight when it fires is abandoned and its result discarded.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut failures: Vec<AttemptFailure> = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let retries = attempt - 1;

        if cancel.is_cancelled() {
            return Attempted {
                outcome: AttemptOutcome::Cancelled,
                failures,
                retries,
            };
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = op(attempt) => Some(result),
        };
        let Some(result) = result else {
            return Attempted {
                outcome: AttemptOutcome::Cancelled,
                failures,
                retries,
            };
        };

        match result {
            Ok(value) => {
                return Attempted {
                    outcome: AttemptOutcome::Succeeded(value),
                    failures,
                    retries,
                };
            }
            Err(error) => {
                let retry = error.is_transient() && retries < policy.max_retries;
                failures.push(AttemptFailure {
                    kind: error.kind,
                    message: error.message.clone(),
                    attempt,
                    retried: retry,
                });

                if !retry {
                    return Attempted {
                        outcome: AttemptOutcome::Failed(error),
                        failures,
                        retries,
                    };
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "[RETRY] {} on attempt {}/{}, retrying in {}ms",
                    error.kind,
                    attempt,
                    policy.max_attempts(),
                    delay.as_millis()
                );
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Attempted {
                                outcome: AttemptOutcome::Cancelled,
                                failures,
                                retries,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
