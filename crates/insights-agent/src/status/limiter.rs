// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token bucket refilled with one token every `period`, holding at most `burst` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    period: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(period: Duration, burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            burst: f64::from(burst),
            period,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if self.period.is_zero() {
            self.tokens = self.burst;
        } else {
            self.tokens =
                (self.tokens + elapsed.as_secs_f64() / self.period.as_secs_f64()).min(self.burst);
        }
        self.last_refill = now;
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return true;
        }
        false
    }

    /// Waits for a token. Returns `false` when cancelled first.
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            let wait = self.period.mul_f64(1.0 - self.tokens);
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_one_per_period() {
        let mut bucket = TokenBucket::new(Duration::from_secs(30), 2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!bucket.try_acquire());
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let mut bucket = TokenBucket::new(Duration::from_secs(30), 1);
        let start = Instant::now();
        assert!(bucket.acquire(&CancellationToken::new()).await);
        assert!(bucket.acquire(&CancellationToken::new()).await);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let mut bucket = TokenBucket::new(Duration::from_secs(3600), 1);
        assert!(bucket.try_acquire());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!bucket.acquire(&cancel).await);
    }
}
