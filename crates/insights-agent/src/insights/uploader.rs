// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic upload of the newest archive.

use crate::archive::{read_archive_file, ArchiveError, ArchiveFile, DiskStorage};
use crate::backoff::{self, Attempt, Backoff, RetryError};
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, Simple, Summary};
use crate::insights::client::{InsightsClient, InsightsError, Source, UploadResponse};
use crate::recorder::LastReported;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const STATUS_NAME: &str = "insightsuploader";

/// Added to the initial delay before the first upload.
pub const UPLOAD_DELAY: Duration = Duration::from_secs(90);

/// Keeps the time of the last successful upload.
pub trait StatusReporter: LastReported {
    fn set_last_reported_time(&self, at: DateTime<Utc>);
}

/// In-process last report time, for the one-shot commands.
#[derive(Debug, Default)]
pub struct ReportedTime(Mutex<Option<DateTime<Utc>>>);

impl LastReported for ReportedTime {
    fn last_reported_time(&self) -> Option<DateTime<Utc>> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusReporter for ReportedTime {
    fn set_last_reported_time(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }
}

/// Finds the archive to upload.
pub trait Summarizer: Send + Sync {
    fn summary(&self, since: DateTime<Utc>) -> Result<Option<ArchiveFile>, ArchiveError>;
}

impl Summarizer for DiskStorage {
    fn summary(&self, since: DateTime<Utc>) -> Result<Option<ArchiveFile>, ArchiveError> {
        DiskStorage::summary(self, since)
    }
}

pub struct Uploader {
    summarizer: Arc<dyn Summarizer>,
    client: Arc<InsightsClient>,
    configurator: Arc<ConfigAggregator>,
    reporter: Arc<dyn StatusReporter>,
    status: Arc<Simple>,
    backoff: Option<Backoff>,
    archive_uploaded_tx: mpsc::Sender<()>,
    archive_uploaded_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Uploader {
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        client: Arc<InsightsClient>,
        configurator: Arc<ConfigAggregator>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        let (archive_uploaded_tx, archive_uploaded_rx) = mpsc::channel(1);
        Self {
            summarizer,
            client,
            configurator,
            reporter,
            status: Arc::new(Simple::new(STATUS_NAME)),
            backoff: None,
            archive_uploaded_tx,
            archive_uploaded_rx: Mutex::new(Some(archive_uploaded_rx)),
        }
    }

    /// Overrides the retry policy derived from the reporting interval.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn status(&self) -> Arc<Simple> {
        Arc::clone(&self.status)
    }

    /// Receiver woken once per successful upload. Can be taken once.
    pub fn take_archive_uploaded(&self) -> Option<mpsc::Receiver<()>> {
        self.archive_uploaded_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn upload_backoff(&self) -> Backoff {
        self.backoff.clone().unwrap_or_else(|| {
            Backoff::new(self.configurator.config().data_reporting.interval / 4, 2.0, 4)
        })
    }

    /// Uploads `source`, retrying server errors and transport failures.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        source: &Source,
    ) -> Result<UploadResponse, InsightsError> {
        let endpoint = self.configurator.config().data_reporting.upload_endpoint;
        let start = Instant::now();
        let result = backoff::retry(self.upload_backoff(), cancel, || async {
            self.client.send(&endpoint, source).await.map_err(|e| {
                if e.is_retryable() {
                    info!(
                        "Uploader | Unable to upload report after {:.2}s: {e}",
                        start.elapsed().as_secs_f64()
                    );
                    Attempt::Retry(e)
                } else {
                    Attempt::Fail(e)
                }
            })
        })
        .await;

        match result {
            Ok(response) => {
                info!(
                    "Uploader | Uploaded report successfully in {:.2}s",
                    start.elapsed().as_secs_f64()
                );
                Ok(response)
            }
            Err(RetryError::Exhausted(e) | RetryError::Failed(e)) => Err(e),
            Err(RetryError::Cancelled) => Err(InsightsError::Request(
                "upload cancelled before completion".to_string(),
            )),
        }
    }

    /// Uploads the newest archive every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken, initial_delay: Duration) {
        self.status
            .update_status(Summary::healthy(Operation::Unknown, "AsExpected", ""));

        let config = self.configurator.config();
        let mut interval = config.data_reporting.interval;
        let mut upload_delay = initial_delay + UPLOAD_DELAY;
        info!(
            "Uploader | Reporting status periodically to {} every {}s, starting in {}s",
            config.data_reporting.upload_endpoint,
            interval.as_secs(),
            upload_delay.as_secs()
        );

        let mut config_changed = self.configurator.config_changed();
        loop {
            let sleep = tokio::time::sleep(upload_delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = &mut sleep => {
                        upload_delay = self.check_summary_and_send(&cancel).await;
                        break;
                    }
                    Some(()) = config_changed.changed() => {
                        let config = self.configurator.config();
                        if !config.data_reporting.enabled {
                            info!("Uploader | Reporting was disabled");
                        }
                        if config.data_reporting.interval != interval {
                            interval = config.data_reporting.interval;
                            upload_delay = backoff::jitter(interval / 8, 0.1);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Uploads the newest archive gathered after the last report, or logs its content when
    /// reporting is disabled. Returns the delay before the next attempt.
    pub async fn check_summary_and_send(&self, cancel: &CancellationToken) -> Duration {
        let config = self.configurator.config();
        let interval = config.data_reporting.interval;
        let endpoint = &config.data_reporting.upload_endpoint;
        let last_reported = self.reporter.last_reported_time();
        let since = last_reported.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let default_delay = backoff::jitter(interval / 8, 0.1);

        let summarizer = Arc::clone(&self.summarizer);
        let summary = tokio::task::spawn_blocking(move || summarizer.summary(since))
            .await
            .unwrap_or_else(|e| Err(ArchiveError::Task(e.to_string())));
        let archive = match summary {
            Ok(Some(archive)) => archive,
            Ok(None) => {
                info!(
                    "Uploader | Nothing to report since {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                );
                return default_delay;
            }
            Err(e) => {
                self.status.update_status(Summary::unhealthy(
                    Operation::Unknown,
                    "SummaryFailed",
                    format!("Unable to retrieve local insights data: {e}"),
                ));
                return default_delay;
            }
        };

        if !config.data_reporting.enabled || endpoint.is_empty() {
            info!("Uploader | Display report that would be sent");
            if let Err(e) = report_to_logs(&archive.path) {
                error!("Uploader | Unable to log upload: {e}");
            }
            return default_delay;
        }

        let start = Utc::now();
        info!(
            "Uploader | Uploading latest report since {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let mut source = Source::archive(&archive.path);
        source.id = start.to_rfc3339_opts(SecondsFormat::Secs, true);

        match self.upload(cancel, &source).await {
            Ok(response) => {
                debug!("Uploader | Insights request id {}", response.request_id);
                let _ = self.archive_uploaded_tx.try_send(());
                self.reporter.set_last_reported_time(start);
                self.status
                    .update_status(Summary::healthy(Operation::Uploading, "AsExpected", ""));
                backoff::jitter(interval, 1.2)
            }
            Err(InsightsError::WaitingForVersion) => {
                info!("Uploader | Waiting for the cluster version to be loaded");
                backoff::jitter(Duration::from_secs(15), 1.0)
            }
            Err(e) if e.is_authorization() => {
                let mut summary = Summary::unhealthy(
                    Operation::Uploading,
                    e.authorization_reason(),
                    format!("Reporting was not allowed: {e}"),
                );
                if let Some(code) = e.status_code() {
                    summary = summary.with_status_code(code);
                }
                self.status.update_status(summary);
                backoff::jitter(interval / 2, 2.0)
            }
            Err(e) => {
                let mut summary = Summary::unhealthy(
                    Operation::Uploading,
                    "UploadFailed",
                    format!("Unable to report: {e}"),
                );
                if let Some(code) = e.status_code() {
                    summary = summary.with_status_code(code);
                }
                self.status.update_status(summary);
                backoff::jitter(interval / 8, 1.2)
            }
        }
    }
}

/// Logs every entry of the archive at `path`.
pub fn report_to_logs(path: &Path) -> Result<(), ArchiveError> {
    for record in read_archive_file(path)? {
        info!(
            "Dry-run: {} {:7} {}",
            record.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            record.data.len(),
            record.name
        );
    }
    Ok(())
}
