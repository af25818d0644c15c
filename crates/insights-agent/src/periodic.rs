// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic gathering: runs every gatherer into the recorder on the configured interval and
//! writes one archive per cycle.

use crate::anonymization::Anonymizer;
use crate::archive::SavedArchive;
use crate::cluster::{ConfigResources, SecretStore};
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, Simple, StatusSource, Summary};
use crate::gather::{
    collect_and_record_gatherer, record_archive_metadata, GatherSelection, Gatherer,
    GathererFunctionReport, DEFAULT_WORKERS,
};
use crate::recorder::{Recorder, RecorderError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const GATHER_FAILED_REASON: &str = "PeriodicGatherFailed";
/// Prefix of the per-gatherer status sources.
pub const STATUS_PREFIX: &str = "periodic-";

/// Short classification of one function report, as shown in the gathering logs and the
/// on-demand gathering status.
pub fn function_reason(report: &GathererFunctionReport) -> &'static str {
    if report.panic.is_some() {
        "GatherPanic"
    } else if !report.errors.is_empty() {
        "GatheredWithError"
    } else if report.records_count == 0 {
        "NoData"
    } else {
        "GatheredOK"
    }
}

/// Result of one gathering cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub reports: Vec<GathererFunctionReport>,
    /// Gatherers that failed, with the error.
    pub failed: BTreeMap<String, String>,
    pub archive: Option<SavedArchive>,
}

pub struct PeriodicController {
    configurator: Arc<ConfigAggregator>,
    recorder: Arc<Recorder>,
    resources: Arc<dyn ConfigResources>,
    secrets: Option<Arc<dyn SecretStore>>,
    gatherers: Vec<Arc<dyn Gatherer>>,
    statuses: BTreeMap<String, Arc<Simple>>,
    selection: GatherSelection,
    workers: usize,
    started: Instant,
    obfuscate_networking: bool,
}

impl PeriodicController {
    pub fn new(
        configurator: Arc<ConfigAggregator>,
        recorder: Arc<Recorder>,
        resources: Arc<dyn ConfigResources>,
        gatherers: Vec<Arc<dyn Gatherer>>,
    ) -> Self {
        let statuses = gatherers
            .iter()
            .map(|g| {
                let name = g.name().to_string();
                let status = Arc::new(Simple::new(format!("{STATUS_PREFIX}{name}")));
                (name, status)
            })
            .collect();
        Self {
            configurator,
            recorder,
            resources,
            secrets: None,
            gatherers,
            statuses,
            selection: GatherSelection::all(),
            workers: DEFAULT_WORKERS,
            started: Instant::now(),
            obfuscate_networking: false,
        }
    }

    #[must_use]
    pub fn with_selection(mut self, selection: GatherSelection) -> Self {
        self.selection = selection;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Process start, the origin of the uptime written into the archive metadata.
    #[must_use]
    pub fn with_start_time(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Obfuscates networking data even when the configuration does not ask for it.
    #[must_use]
    pub fn with_networking_obfuscation(mut self, enabled: bool) -> Self {
        self.obfuscate_networking = enabled;
        self
    }

    /// Store for the anonymizer translation table.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// One status source per gatherer.
    pub fn sources(&self) -> Vec<Arc<dyn StatusSource>> {
        self.statuses
            .values()
            .map(|s| Arc::clone(s) as Arc<dyn StatusSource>)
            .collect()
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Runs a cycle if reporting is enabled.
    pub async fn gather(&self, cancel: &CancellationToken) {
        if !self.configurator.config().data_reporting.enabled {
            debug!("Gather is disabled by configuration.");
            return;
        }
        if let Err(e) = self.run_cycle(cancel, &self.selection).await {
            error!("Unable to flush the recorder: {e}");
        }
    }

    /// Gathers with `selection`, records the archive metadata and flushes the recorder. A
    /// failing gatherer never fails the cycle; only the flush error is returned.
    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        selection: &GatherSelection,
    ) -> Result<CycleReport, RecorderError> {
        let config = self.configurator.config();
        let anonymizer = match Anonymizer::from_cluster(
            self.resources.as_ref(),
            self.obfuscate_networking || config.is_networking_obfuscated(),
        )
        .await
        {
            Ok(anonymizer) => Arc::new(anonymizer),
            Err(e) => {
                error!("Cannot create the anonymizer, skipping the gathering: {e}");
                return Ok(CycleReport::default());
            }
        };
        self.recorder.set_anonymizer(Arc::clone(&anonymizer)).await;

        let cycle = cancel.child_token();
        let timeout = config.data_reporting.interval / 2;
        let deadline = {
            let cycle = cycle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(
                    "Gathering cycle exceeded {}s, cancelling",
                    timeout.as_secs()
                );
                cycle.cancel();
            })
        };

        let mut report = CycleReport::default();
        for gatherer in &self.gatherers {
            let name = gatherer.name();
            if let Some(custom) = gatherer.custom_period() {
                if !custom.should_be_processed_now() {
                    info!("Skipping {name} gatherer, it is not due yet");
                    continue;
                }
                custom.update_last_processing_time();
            }

            let run = collect_and_record_gatherer(
                &cycle,
                gatherer.as_ref(),
                &self.recorder,
                selection,
                self.workers,
            )
            .await;
            for function in &run.reports {
                info!(
                    "Gathering {}: {} ({} records in {}ms)",
                    function.name,
                    function_reason(function),
                    function.records_count,
                    function.duration_in_ms
                );
            }
            report.reports.extend(run.reports);

            let summary = match run.error {
                Some(e) => {
                    let message = format!("Source {name} could not be retrieved: {e}");
                    error!("{message}");
                    report.failed.insert(name.to_string(), e.to_string());
                    Summary::unhealthy(Operation::GatheringReport, GATHER_FAILED_REASON, message)
                }
                None => Summary::healthy(Operation::GatheringReport, "", ""),
            };
            if let Some(status) = self.statuses.get(name) {
                status.update_status(summary);
            }
        }
        deadline.abort();

        if let Err(e) = record_archive_metadata(
            report.reports.clone(),
            &self.recorder,
            self.started.elapsed(),
            anonymizer.is_obfuscation_enabled(),
        )
        .await
        {
            error!("Unable to record the archive metadata: {e}");
        }

        report.archive = self.recorder.flush().await?;

        if let Some(secrets) = &self.secrets {
            if let Err(e) = anonymizer.store_translation_table(secrets.as_ref()).await {
                error!("Unable to store the anonymizer translation table: {e}");
            }
        }
        anonymizer.reset_translation_table();
        Ok(report)
    }

    /// Waits out `initial_delay`, then gathers on every interval. A configuration change resets
    /// the timer when the interval changes. An oversized recorder is flushed in between.
    pub async fn run(&self, cancel: CancellationToken, initial_delay: Duration) {
        let mut listener = self.configurator.config_changed();
        let mut flush_signal = self.recorder.take_flush_signal();

        if !initial_delay.is_zero() {
            info!(
                "Delaying the first gathering by {}s",
                initial_delay.as_secs()
            );
            let delay = tokio::time::sleep(initial_delay);
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = &mut delay => break,
                    Some(()) = listener.changed() => {
                        debug!("Configuration changed during the initial delay");
                    }
                }
            }
        }
        self.gather(&cancel).await;

        let mut interval = self.configurator.config().data_reporting.interval;
        let mut next = tokio::time::Instant::now() + interval;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep_until(next) => {
                    self.gather(&cancel).await;
                    next = tokio::time::Instant::now() + interval;
                }
                Some(()) = listener.changed() => {
                    let updated = self.configurator.config().data_reporting.interval;
                    if updated != interval {
                        interval = updated;
                        next = tokio::time::Instant::now() + interval;
                        info!(
                            "Gathering cycle interval changed to {}",
                            humantime::format_duration(interval)
                        );
                    }
                }
                Some(()) = recv_flush(&mut flush_signal) => {
                    if let Err(e) = self.recorder.flush().await {
                        error!("Unable to flush the recorder: {e}");
                    }
                }
            }
        }
    }
}

async fn recv_flush(signal: &mut Option<tokio::sync::mpsc::Receiver<()>>) -> Option<()> {
    match signal {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
