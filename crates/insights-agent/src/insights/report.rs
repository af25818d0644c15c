// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retrieval of the analysis report after each upload.
//!
//! One retrieval is a small state machine: wait the jittered pulling delay, pull, and on a
//! retryable outcome wait the jittered minimum retry time before pulling again. The whole
//! retrieval is bounded by the pulling timeout. A configuration change moves the pending
//! deadline relative to the start of the current wait.

use crate::backoff::jitter;
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, Simple, Summary};
use crate::insights::client::{InsightsClient, InsightsError};
use crate::metrics::HealthStatusCounts;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const STATUS_NAME: &str = "insightsreport";

/// Failed pulls tolerated before the report is declared unavailable.
pub const RETRY_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMeta {
    pub count: i64,
    pub last_checked_at: String,
    pub gathered_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleResponse {
    pub rule_id: String,
    pub description: String,
    pub total_risk: i32,
    pub disabled: bool,
    pub template_data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartProxyReport {
    pub meta: ReportMeta,
    pub data: Vec<RuleResponse>,
}

impl SmartProxyReport {
    /// Enabled rules by total risk. The total is `meta.count` without the disabled rules.
    pub fn health_status_counts(&self) -> HealthStatusCounts {
        let mut counts = HealthStatusCounts {
            total: self.meta.count,
            ..HealthStatusCounts::default()
        };
        for rule in &self.data {
            if rule.disabled {
                counts.total -= 1;
                continue;
            }
            match rule.total_risk {
                1 => counts.low += 1,
                2 => counts.moderate += 1,
                3 => counts.important += 1,
                4 => counts.critical += 1,
                _ => {}
            }
        }
        counts
    }
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    report: SmartProxyReport,
}

/// Result of one pull.
#[derive(Debug)]
pub enum PullOutcome {
    /// A new report was stored, or pulling is not configured.
    Done,
    /// Pulling stops without a new report.
    Failed(String),
    /// Pull again after the retry delay.
    Retry(String),
}

enum State {
    Delaying { started: Instant, deadline: Instant },
    Retrying { started: Instant, deadline: Instant },
}

pub struct ReportRetriever {
    client: Arc<InsightsClient>,
    configurator: Arc<ConfigAggregator>,
    status: Arc<Simple>,
    last_report: Mutex<Option<SmartProxyReport>>,
}

impl ReportRetriever {
    pub fn new(client: Arc<InsightsClient>, configurator: Arc<ConfigAggregator>) -> Self {
        Self {
            client,
            configurator,
            status: Arc::new(Simple::new(STATUS_NAME)),
            last_report: Mutex::new(None),
        }
    }

    pub fn status(&self) -> Arc<Simple> {
        Arc::clone(&self.status)
    }

    /// The last accepted report.
    pub fn last_report(&self) -> Option<SmartProxyReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retrieves a report after every upload signal until cancelled.
    pub async fn run(&self, cancel: CancellationToken, mut archive_uploaded: mpsc::Receiver<()>) {
        self.status
            .update_status(Summary::healthy(Operation::Unknown, "AsExpected", ""));
        let config = self.configurator.config();
        info!(
            "Report | Insights analysis reports will be downloaded from the {} endpoint with a delay of {}s",
            config.data_reporting.download_endpoint,
            config.data_reporting.report_pulling_delay.as_secs()
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                uploaded = archive_uploaded.recv() => {
                    if uploaded.is_none() {
                        return;
                    }
                    info!("Report | Archive uploaded, starting pulling report...");
                    self.retrieve_report(&cancel).await;
                }
            }
        }
    }

    /// Pulls until a new report is accepted, pulling fails for good, the retries run out or
    /// the pulling timeout expires.
    pub async fn retrieve_report(&self, cancel: &CancellationToken) {
        let config = self.configurator.config();
        let mut config_changed = self.configurator.config_changed();
        let timeout = tokio::time::sleep(config.data_reporting.report_pulling_timeout);
        tokio::pin!(timeout);

        let delay = config.data_reporting.report_pulling_delay;
        info!("Report | Initial delay for pulling: {}s", delay.as_secs());
        let now = Instant::now();
        let mut state = State::Delaying {
            started: now,
            deadline: now + jitter(delay, 0.1),
        };
        let mut retries = 0;

        loop {
            let deadline = match &state {
                State::Delaying { deadline, .. } | State::Retrying { deadline, .. } => *deadline,
            };
            tokio::select! {
                () = cancel.cancelled() => return,
                () = &mut timeout => {
                    info!("Report | Pulling timeout reached, stopping");
                    return;
                }
                Some(()) = config_changed.changed() => {
                    let config = self.configurator.config();
                    state = match state {
                        State::Delaying { started, .. } => State::Delaying {
                            started,
                            deadline: rejittered(started, config.data_reporting.report_pulling_delay, 0.1),
                        },
                        State::Retrying { started, .. } => State::Retrying {
                            started,
                            deadline: rejittered(started, config.data_reporting.report_min_retry_time, 0.3),
                        },
                    };
                }
                () = tokio::time::sleep_until(deadline) => {
                    match self.pull_report().await {
                        PullOutcome::Done => {
                            info!("Report | Report retrieved correctly");
                            return;
                        }
                        PullOutcome::Failed(e) => {
                            error!("Report | Unrecoverable problem retrieving the report: {e}");
                            return;
                        }
                        PullOutcome::Retry(e) => {
                            if retries >= RETRY_THRESHOLD {
                                self.status.update_status(Summary::unhealthy(
                                    Operation::DownloadingReport,
                                    "NotAvailable",
                                    format!("Couldn't download the latest report: {e}"),
                                ));
                                return;
                            }
                            retries += 1;
                            let retry = self.configurator.config().data_reporting.report_min_retry_time;
                            let wait = jitter(retry, 0.3);
                            info!("Report | Resetting the delay timer to retry in {}s again", wait.as_secs());
                            let now = Instant::now();
                            state = State::Retrying { started: now, deadline: now + wait };
                        }
                    }
                }
            }
        }
    }

    /// Downloads the report once and classifies the result.
    pub async fn pull_report(&self) -> PullOutcome {
        info!("Report | Pulling report from smart-proxy");
        let endpoint = self.configurator.config().data_reporting.download_endpoint;
        if endpoint.is_empty() {
            info!("Report | Not downloading report because the report endpoint is not configured");
            return PullOutcome::Done;
        }

        let body = match self.client.recv_report(&endpoint).await {
            Ok(body) => body,
            Err(e) => return self.pull_error(e),
        };

        let response: ReportResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(e) => {
                error!("Report | The report response cannot be parsed: {e}");
                return PullOutcome::Failed(e.to_string());
            }
        };
        debug!("Report | Smart Proxy report correctly parsed");
        let report = response.report;

        let mut last_report = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = last_report.as_ref() {
            if previous.meta.last_checked_at == report.meta.last_checked_at {
                info!("Report | Retrieved report is equal to previous one. Retrying...");
                return PullOutcome::Retry("report not updated".to_string());
            }
        }

        let counts = report.health_status_counts();
        let metrics = self.client.metrics();
        metrics.set_health_statuses(counts);
        metrics.increment_recv_report(StatusCode::OK.as_u16());
        *last_report = Some(report);
        drop(last_report);

        self.status
            .update_status(Summary::healthy(Operation::DownloadingReport, "AsExpected", ""));
        PullOutcome::Done
    }

    fn pull_error(&self, e: InsightsError) -> PullOutcome {
        if e.is_authorization() {
            let mut summary = Summary::unhealthy(
                Operation::DownloadingReport,
                e.authorization_reason(),
                format!("Auth rejected for downloading latest report: {e}"),
            );
            if let Some(code) = e.status_code() {
                summary = summary.with_status_code(code);
            }
            self.status.update_status(summary);
            return PullOutcome::Failed(e.to_string());
        }
        if matches!(e, InsightsError::WaitingForVersion) || e.is_not_found() || e.is_retryable() {
            error!("Report | Unable to retrieve the report: {e}");
            return PullOutcome::Retry(e.to_string());
        }

        error!("Report | Unexpected error retrieving the report: {e}");
        let mut summary = Summary::unhealthy(
            Operation::DownloadingReport,
            "UnexpectedError",
            format!("Failed to download the latest report: {e}"),
        );
        if let Some(code) = e.status_code() {
            summary = summary.with_status_code(code);
        }
        self.status.update_status(summary);
        PullOutcome::Failed(e.to_string())
    }
}

/// A new deadline `base` (jittered) after `started`, never in the past.
fn rejittered(started: Instant, base: Duration, factor: f64) -> Instant {
    let deadline = started + base;
    let now = Instant::now();
    now + jitter(deadline.saturating_duration_since(now), factor)
}
