// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polling of the processing status of an uploaded archive.

use crate::insights::client::InsightsClient;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Attempts allowed per failure class before polling stops.
pub const STATUS_QUERY_RETRIES: u32 = 3;

const PROCESSED: &str = "processed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("failed to check processing status after {retries} retries: {message}")]
    Network { retries: u32, message: String },
    #[error("HTTP status message: {0}")]
    Request(String),
    #[error("data processing status is {status:?} after {retries} retries, stopping poll")]
    Status { status: String, retries: u32 },
    #[error("unable to read the processing status: {0}")]
    Body(String),
    #[error("processing status polling cancelled")]
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct DataStatus {
    #[serde(default, rename = "cluster")]
    _cluster: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default)]
struct RetryCounter {
    network: u32,
    request: u32,
    status: u32,
}

/// Polls `endpoint` (cluster id and request id placeholders) every `delay` until the archive of
/// `request_id` is reported as processed. The first query happens after one `delay`.
pub async fn wait_for_processing(
    client: &InsightsClient,
    endpoint: &str,
    request_id: &str,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProcessingError> {
    info!("Initial delay when checking processing status: {}s", delay.as_secs());
    let mut counter = RetryCounter::default();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }

        let response = match client.get_with_path_param(endpoint, request_id, true).await {
            Ok(response) => response,
            Err(e) => {
                if counter.network >= STATUS_QUERY_RETRIES {
                    return Err(ProcessingError::Network {
                        retries: counter.network,
                        message: e.to_string(),
                    });
                }
                counter.network += 1;
                info!(
                    "Network error when checking processing status: {e}, retry {}/{STATUS_QUERY_RETRIES} in {}s",
                    counter.network,
                    delay.as_secs()
                );
                continue;
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            if counter.request >= STATUS_QUERY_RETRIES {
                return Err(ProcessingError::Request(
                    status.canonical_reason().unwrap_or_default().to_string(),
                ));
            }
            counter.request += 1;
            info!(
                "Received HTTP status code {}, retry {}/{STATUS_QUERY_RETRIES} in {}s",
                status.as_u16(),
                counter.request,
                delay.as_secs()
            );
            continue;
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProcessingError::Body(e.to_string()))?;
        if body.is_empty() {
            continue;
        }
        let data: DataStatus =
            serde_json::from_slice(&body).map_err(|e| ProcessingError::Body(e.to_string()))?;
        if data.status == PROCESSED {
            return Ok(());
        }

        if counter.status >= STATUS_QUERY_RETRIES {
            info!(
                "Data status is {:?} after {} retries, stopping poll",
                data.status, counter.status
            );
            return Err(ProcessingError::Status {
                status: data.status,
                retries: counter.status,
            });
        }
        counter.status += 1;
        info!(
            "Data status is {:?}, retry {}/{STATUS_QUERY_RETRIES} in {}s",
            data.status,
            counter.status,
            delay.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::client::test_support::{client, configurator, CLUSTER_ID};
    use mockito::Server;

    const DELAY: Duration = Duration::from_millis(5);

    fn path() -> String {
        format!("/cluster/{CLUSTER_ID}/request/abc/status")
    }

    #[tokio::test]
    async fn test_processed() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path().as_str())
            .with_status(200)
            .with_body(r#"{"cluster":"x","status":"processed"}"#)
            .expect(1)
            .create_async()
            .await;
        let client = client(configurator(&server.url()));
        let endpoint = format!("{}/cluster/%s/request/%s/status", server.url());

        let result =
            wait_for_processing(&client, &endpoint, "abc", DELAY, &CancellationToken::new()).await;

        mock.assert_async().await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_status_retries_are_bounded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path().as_str())
            .with_status(200)
            .with_body(r#"{"cluster":"x","status":"processing"}"#)
            .expect(4)
            .create_async()
            .await;
        let client = client(configurator(&server.url()));
        let endpoint = format!("{}/cluster/%s/request/%s/status", server.url());

        let result =
            wait_for_processing(&client, &endpoint, "abc", DELAY, &CancellationToken::new()).await;

        mock.assert_async().await;
        assert_eq!(
            result,
            Err(ProcessingError::Status {
                status: "processing".to_string(),
                retries: 3
            })
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            r#"data processing status is "processing" after 3 retries, stopping poll"#
        );
    }

    #[tokio::test]
    async fn test_http_errors_are_bounded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path().as_str())
            .with_status(503)
            .expect(4)
            .create_async()
            .await;
        let client = client(configurator(&server.url()));
        let endpoint = format!("{}/cluster/%s/request/%s/status", server.url());

        let result =
            wait_for_processing(&client, &endpoint, "abc", DELAY, &CancellationToken::new()).await;

        mock.assert_async().await;
        assert_eq!(
            result,
            Err(ProcessingError::Request("Service Unavailable".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cancelled() {
        let client = client(configurator("http://127.0.0.1:9"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_processing(
            &client,
            "http://127.0.0.1:9/%s/%s",
            "abc",
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert_eq!(result, Err(ProcessingError::Cancelled));
    }
}
