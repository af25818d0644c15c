// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Job side of the on-demand gathering: gather, record, upload and wait for processing, with
//! every step reported on the request.

use super::{
    gatherer_status, modify_status, set_phase, update_conditions, GatheringPhase, JobError,
    DATA_PROCESSED, DATA_RECORDED, DATA_UPLOADED, FAILED_REASON, MAX_GATHER_JOB_ARCHIVES,
    PROCESSED_REASON, RECORDING_FAILED_REASON, REMOTE_CONFIGURATION_AVAILABLE,
    REMOTE_CONFIGURATION_VALID, REMOTE_CONFIG_NOT_REQUESTED_YET_REASON,
    REMOTE_CONFIG_NOT_VALIDATED_YET_REASON, SUCCEEDED_REASON,
};
use crate::archive::DiskStorage;
use crate::cluster::datagather::{DataGather, DataGatherStore};
use crate::cluster::{Condition, ConditionStatus};
use crate::config::aggregator::ConfigAggregator;
use crate::gather::GatherSelection;
use crate::insights::client::{InsightsClient, Source};
use crate::insights::processing::wait_for_processing;
use crate::insights::uploader::Uploader;
use crate::periodic::PeriodicController;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Data policy asking for networking obfuscation.
pub const OBFUSCATE_NETWORKING_POLICY: &str = "ObfuscateNetworking";

pub fn obfuscates_networking(data_gather: &DataGather) -> bool {
    data_gather
        .spec
        .data_policy
        .iter()
        .any(|p| p == OBFUSCATE_NETWORKING_POLICY)
}

pub struct GatherJob {
    requests: Arc<dyn DataGatherStore>,
    periodic: PeriodicController,
    storage: Arc<DiskStorage>,
    uploader: Uploader,
    client: Arc<InsightsClient>,
    configurator: Arc<ConfigAggregator>,
}

impl GatherJob {
    pub fn new(
        requests: Arc<dyn DataGatherStore>,
        periodic: PeriodicController,
        storage: Arc<DiskStorage>,
        uploader: Uploader,
        client: Arc<InsightsClient>,
        configurator: Arc<ConfigAggregator>,
    ) -> Self {
        Self {
            requests,
            periodic,
            storage,
            uploader,
            client,
            configurator,
        }
    }

    /// Serves request `name`, giving up after four reporting intervals.
    pub async fn gather_and_upload(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DataGather, JobError> {
        let timeout = self.configurator.config().data_reporting.interval * 4;
        let job = cancel.child_token();
        match tokio::time::timeout(timeout, self.run(name, &job)).await {
            Ok(result) => result,
            Err(_) => {
                job.cancel();
                Err(JobError::Cancelled)
            }
        }
    }

    async fn run(&self, name: &str, cancel: &CancellationToken) -> Result<DataGather, JobError> {
        info!("Starting data gathering");
        let data_gather = modify_status(self.requests.as_ref(), name, |dg| {
            set_phase(dg, GatheringPhase::Gathering);
        })
        .await
        .map_err(|e| {
            error!("failed to update corresponding DataGather custom resource: {e}");
            e
        })?;

        let selection = GatherSelection::all().with_disabled(data_gather.spec.disabled_gatherers());
        let cycle = self.periodic.run_cycle(cancel, &selection).await;
        let gatherers: Vec<_> = cycle
            .as_ref()
            .map(|c| {
                c.reports
                    .iter()
                    // function reports only, the per-gatherer aggregates are left out
                    .filter(|r| r.name.contains('/'))
                    .map(gatherer_status)
                    .collect()
            })
            .unwrap_or_default();

        let archive = match cycle {
            Ok(report) => report.archive,
            Err(e) => {
                error!("Failed to record data archive: {e}");
                let message = format!("Failed to record data: {e}");
                self.fail(name, recorded_failure(&message)).await;
                return Err(JobError::Recording(e.to_string()));
            }
        };
        let Some(archive) = archive else {
            let message = "Failed to record data: no archive was written".to_string();
            self.fail(name, recorded_failure(&message)).await;
            return Err(JobError::Recording("no archive was written".to_string()));
        };

        self.update(name, |dg| {
            dg.status.gatherers.clone_from(&gatherers);
            update_conditions(
                dg,
                [
                    Condition::new(
                        REMOTE_CONFIGURATION_AVAILABLE,
                        ConditionStatus::Unknown,
                        REMOTE_CONFIG_NOT_REQUESTED_YET_REASON,
                        "",
                    ),
                    Condition::new(
                        REMOTE_CONFIGURATION_VALID,
                        ConditionStatus::Unknown,
                        REMOTE_CONFIG_NOT_VALIDATED_YET_REASON,
                        "",
                    ),
                    Condition::new(DATA_RECORDED, ConditionStatus::True, SUCCEEDED_REASON, ""),
                ],
            );
        })
        .await;

        let response = match self
            .uploader
            .upload(cancel, &Source::archive(&archive.path))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to upload data archive: {e}");
                let code = e.status_code().unwrap_or(0);
                self.fail(
                    name,
                    Condition::new(
                        DATA_UPLOADED,
                        ConditionStatus::False,
                        FAILED_REASON,
                        format!("Failed to upload data err: {e} with http status code: {code}"),
                    ),
                )
                .await;
                return Err(JobError::Upload(e.to_string()));
            }
        };
        let request_id = response.request_id;
        info!("Insights archive successfully uploaded with InsightsRequestID: {request_id}");
        self.update(name, |dg| {
            dg.status.insights_request_id.clone_from(&request_id);
            update_conditions(
                dg,
                [Condition::new(
                    DATA_UPLOADED,
                    ConditionStatus::True,
                    SUCCEEDED_REASON,
                    format!("Succeeded with http status code: {}", response.status),
                )],
            );
        })
        .await;

        let config = self.configurator.config();
        if let Err(e) = wait_for_processing(
            &self.client,
            &config.data_reporting.processing_status_endpoint,
            &request_id,
            config.data_reporting.report_pulling_delay,
            cancel,
        )
        .await
        {
            info!("Data was not processed in the console.redhat.com pipeline for the request {request_id}: {e}");
            self.fail(
                name,
                Condition::new(
                    DATA_PROCESSED,
                    ConditionStatus::False,
                    FAILED_REASON,
                    format!("failed to process data in the given time: {e}"),
                ),
            )
            .await;
            return Err(JobError::Processing(e.to_string()));
        }

        let finished = modify_status(self.requests.as_ref(), name, |dg| {
            update_conditions(
                dg,
                [Condition::new(DATA_PROCESSED, ConditionStatus::True, PROCESSED_REASON, "")],
            );
            set_phase(dg, GatheringPhase::Succeeded);
        })
        .await?;
        info!(
            "Data was successfully processed. New Insights analysis for the request ID {request_id} will be downloaded by the operator"
        );

        if let Err(e) = self.storage.prune_by_count(MAX_GATHER_JOB_ARCHIVES) {
            error!("Failed to prune archives: {e}");
        }
        Ok(finished)
    }

    /// Best-effort status update; a failure is only logged.
    async fn update<F: FnMut(&mut DataGather)>(&self, name: &str, change: F) {
        if let Err(e) = modify_status(self.requests.as_ref(), name, change).await {
            error!("Failed to update DataGather resource {name} conditions: {e}");
        }
    }

    async fn fail(&self, name: &str, condition: Condition) {
        self.update(name, |dg| {
            update_conditions(dg, [condition.clone()]);
            set_phase(dg, GatheringPhase::Failed);
        })
        .await;
    }
}

fn recorded_failure(message: &str) -> Condition {
    Condition::new(
        DATA_RECORDED,
        ConditionStatus::False,
        RECORDING_FAILED_REASON,
        message,
    )
}
