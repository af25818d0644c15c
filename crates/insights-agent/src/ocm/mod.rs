// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pullers of data published for this cluster by the OpenShift Cluster Manager API.

pub mod sca;
pub mod transfer;

use crate::backoff::{self, Attempt, Backoff, RetryError};
use crate::insights::InsightsError;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempts made by one pull before giving up.
pub const FAILURE_COUNT_THRESHOLD: u32 = 5;

/// Backoff of a puller running every `interval`: the first retry comes after
/// `interval / divisor` and no delay exceeds `interval`.
pub fn pull_backoff(interval: Duration, divisor: u32) -> Backoff {
    Backoff::new(interval / divisor.max(1), 2.0, FAILURE_COUNT_THRESHOLD).with_cap(interval)
}

/// Runs `request` under `backoff`, retrying only server side HTTP errors.
pub async fn pull_with_backoff<F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    mut request: F,
) -> Result<Bytes, InsightsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Bytes, InsightsError>>,
{
    let result = backoff::retry(backoff, cancel, || {
        let attempt = request();
        async move {
            attempt.await.map_err(|e| match e.status_code() {
                Some(code) if code >= 500 => Attempt::Retry(e),
                _ => Attempt::Fail(e),
            })
        }
    })
    .await;

    match result {
        Ok(body) => Ok(body),
        Err(RetryError::Exhausted(e) | RetryError::Failed(e)) => Err(e),
        Err(RetryError::Cancelled) => Err(InsightsError::Request("pull cancelled".to_string())),
    }
}

/// Reason derived from an HTTP status, e.g. `ServiceUnavailable` for 503.
pub fn status_reason(code: u16) -> String {
    reqwest::StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
        .replace(' ', "")
}
