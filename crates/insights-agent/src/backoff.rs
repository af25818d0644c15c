// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff shared by the uploader, the report retriever and the pullers.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub duration: Duration,
    /// Multiplier applied to the delay after every attempt.
    pub factor: f64,
    /// Random extra delay, as a fraction of the current delay. Zero disables jitter.
    pub jitter: f64,
    /// Maximum number of attempts.
    pub steps: u32,
    /// Upper bound of a single delay.
    pub cap: Option<Duration>,
}

impl Backoff {
    pub fn new(duration: Duration, factor: f64, steps: u32) -> Self {
        Self {
            duration,
            factor,
            jitter: 0.0,
            steps,
            cap: None,
        }
    }

    #[must_use]
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the next delay and advances the state.
    pub fn step(&mut self) -> Duration {
        let mut current = self.duration;
        if let Some(cap) = self.cap {
            current = current.min(cap);
        }
        if self.steps > 0 {
            self.steps -= 1;
            if self.factor > 0.0 {
                let next = self.duration.mul_f64(self.factor);
                self.duration = match self.cap {
                    Some(cap) => next.min(cap),
                    None => next,
                };
            }
        }
        if self.jitter > 0.0 {
            current = jitter(current, self.jitter);
        }
        current
    }
}

/// Returns a duration between `duration` and `duration + max_factor * duration`. A non
/// positive factor behaves as `1.0`.
pub fn jitter(duration: Duration, max_factor: f64) -> Duration {
    let max_factor = if max_factor <= 0.0 { 1.0 } else { max_factor };
    duration + duration.mul_f64(fastrand::f64() * max_factor)
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Try again after the next delay.
    Retry(E),
    /// Stop retrying.
    Fail(E),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("timed out waiting for the condition: {0}")]
    Exhausted(E),
    #[error("{0}")]
    Failed(E),
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The error of the last attempt, unless the loop was cancelled.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted(e) | RetryError::Failed(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or `backoff.steps` attempts were made.
/// Sleeps between attempts honor `cancel`.
pub async fn retry<T, E, F, Fut>(
    mut backoff: Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let attempts = backoff.steps.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fail(e)) => return Err(RetryError::Failed(e)),
            Err(Attempt::Retry(e)) if attempt >= attempts => {
                return Err(RetryError::Exhausted(e))
            }
            Err(Attempt::Retry(_)) => {}
        }
        attempt += 1;
        let delay = backoff.step();
        tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_step_grows_by_factor_until_cap() {
        let mut backoff =
            Backoff::new(Duration::from_secs(1), 2.0, 5).with_cap(Duration::from_secs(5));
        let delays: Vec<u64> = (0..6).map(|_| backoff.step().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5, 5]);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(10), 0.2);
            assert!(d >= Duration::from_secs(10));
            assert!(d <= Duration::from_secs(12));
        }
        let d = jitter(Duration::from_secs(10), 0.0);
        assert!(d <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_steps() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            Backoff::new(Duration::from_secs(1), 2.0, 4),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Retry("unavailable"))
            },
        )
        .await;
        assert_eq!(result, Err(RetryError::Exhausted("unavailable")));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            Backoff::new(Duration::from_secs(1), 2.0, 4),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Fail("unauthorized"))
            },
        )
        .await;
        assert_eq!(result, Err(RetryError::Failed("unauthorized")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry(
            Backoff::new(Duration::from_secs(1), 1.5, 4),
            &CancellationToken::new(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Attempt::Retry(()))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<()>> =
            retry(Backoff::new(Duration::from_secs(60), 2.0, 4), &cancel, || async {
                Err(Attempt::Retry(()))
            })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
