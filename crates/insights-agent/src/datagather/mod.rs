// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-demand gathering driven by data-gather requests.
//!
//! The operator side ([`controller::OnDemandController`]) turns every new request into a
//! single-shot job and follows it to completion. The job side ([`gather_job::GatherJob`]) runs
//! inside that job: it gathers, uploads, waits for the remote processing and reports every step
//! through the request conditions.

pub mod controller;
pub mod gather_job;
pub mod job;

use crate::cluster::datagather::{DataGather, DataGatherState, DataGatherStore, GathererStatus};
use crate::cluster::{set_condition, ClusterError, Condition, ConditionStatus};
use crate::gather::GathererFunctionReport;
use chrono::Utc;
use tracing::debug;

/// Requests created by the operator itself carry this prefix and are not picked up on demand.
pub const PERIODIC_GATHERING_PREFIX: &str = "periodic-gathering-";
/// Archives kept after an on-demand gathering.
pub const MAX_GATHER_JOB_ARCHIVES: usize = 5;

pub const DATA_UPLOADED: &str = "DataUploaded";
pub const DATA_RECORDED: &str = "DataRecorded";
pub const DATA_PROCESSED: &str = "DataProcessed";
pub const REMOTE_CONFIGURATION_AVAILABLE: &str = "RemoteConfigurationAvailable";
pub const REMOTE_CONFIGURATION_VALID: &str = "RemoteConfigurationValid";
pub const PROGRESSING: &str = "Progressing";
pub const DATA_GATHERED: &str = "DataGathered";

pub const SUCCEEDED_REASON: &str = "Succeeded";
pub const FAILED_REASON: &str = "Failed";
pub const NO_UPLOAD_YET_REASON: &str = "NoUploadYet";
pub const NO_DATA_GATHERING_YET_REASON: &str = "NoDataGatheringYet";
pub const RECORDING_FAILED_REASON: &str = "RecordingFailed";
pub const NOTHING_TO_PROCESS_YET_REASON: &str = "NothingToProcessYet";
pub const PROCESSED_REASON: &str = "Processed";
pub const REMOTE_CONFIG_NOT_REQUESTED_YET_REASON: &str = "RemoteConfigNotRequestedYet";
pub const REMOTE_CONFIG_NOT_VALIDATED_YET_REASON: &str = "NoValidationYet";
pub const UNKNOWN_REASON: &str = "Unknown";

/// Reasons of the `Progressing` condition, one per phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringPhase {
    Pending,
    Gathering,
    Succeeded,
    Failed,
}

impl GatheringPhase {
    pub fn reason(self) -> &'static str {
        match self {
            GatheringPhase::Pending => "DataGatherPending",
            GatheringPhase::Gathering => "Gathering",
            GatheringPhase::Succeeded => "GatheringSucceeded",
            GatheringPhase::Failed => "GatheringFailed",
        }
    }

    fn message(self) -> &'static str {
        match self {
            GatheringPhase::Pending => "The gathering has not started yet",
            GatheringPhase::Gathering => "The gathering is running",
            GatheringPhase::Succeeded => "The gathering successfully finished.",
            GatheringPhase::Failed => "The gathering failed.",
        }
    }

    fn state(self) -> DataGatherState {
        match self {
            GatheringPhase::Pending => DataGatherState::Pending,
            GatheringPhase::Gathering => DataGatherState::Running,
            GatheringPhase::Succeeded => DataGatherState::Completed,
            GatheringPhase::Failed => DataGatherState::Failed,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, GatheringPhase::Succeeded | GatheringPhase::Failed)
    }
}

pub fn progressing_condition(phase: GatheringPhase) -> Condition {
    let status = if phase == GatheringPhase::Gathering {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    Condition::new(PROGRESSING, status, phase.reason(), phase.message())
}

/// Sets or replaces `conditions` on the request.
pub fn update_conditions<I>(data_gather: &mut DataGather, conditions: I)
where
    I: IntoIterator<Item = Condition>,
{
    let now = Utc::now();
    for condition in conditions {
        set_condition(&mut data_gather.status.conditions, condition, now);
    }
}

/// Moves the request into `phase`: state, `Progressing` condition and start or finish time.
pub fn set_phase(data_gather: &mut DataGather, phase: GatheringPhase) {
    let now = Utc::now();
    match phase {
        GatheringPhase::Gathering => {
            data_gather.status.start_time.get_or_insert(now);
        }
        GatheringPhase::Succeeded | GatheringPhase::Failed => {
            data_gather.status.finish_time.get_or_insert(now);
        }
        GatheringPhase::Pending => {}
    }
    data_gather.status.state = Some(phase.state());
    update_conditions(data_gather, [progressing_condition(phase)]);
}

/// The phase recorded in the `Progressing` condition, if any.
pub fn current_phase(data_gather: &DataGather) -> Option<GatheringPhase> {
    let condition = data_gather
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == PROGRESSING)?;
    [
        GatheringPhase::Pending,
        GatheringPhase::Gathering,
        GatheringPhase::Succeeded,
        GatheringPhase::Failed,
    ]
    .into_iter()
    .find(|p| p.reason() == condition.reason)
}

/// Conditions of a request that has not started yet.
pub fn initial_conditions() -> Vec<Condition> {
    vec![
        Condition::new(DATA_UPLOADED, ConditionStatus::Unknown, NO_UPLOAD_YET_REASON, ""),
        Condition::new(
            DATA_RECORDED,
            ConditionStatus::Unknown,
            NO_DATA_GATHERING_YET_REASON,
            "",
        ),
        Condition::new(
            DATA_PROCESSED,
            ConditionStatus::Unknown,
            NOTHING_TO_PROCESS_YET_REASON,
            "",
        ),
        Condition::new(
            REMOTE_CONFIGURATION_AVAILABLE,
            ConditionStatus::Unknown,
            UNKNOWN_REASON,
            "",
        ),
        Condition::new(REMOTE_CONFIGURATION_VALID, ConditionStatus::Unknown, UNKNOWN_REASON, ""),
    ]
}

/// Status of one gathering function as shown on the request.
pub fn gatherer_status(report: &GathererFunctionReport) -> GathererStatus {
    let mut condition = Condition::new(DATA_GATHERED, ConditionStatus::False, "NoData", "");
    if let Some(panic) = &report.panic {
        condition.reason = "GatherPanic".to_string();
        condition.message.clone_from(panic);
    }

    if report.records_count > 0 {
        condition.status = ConditionStatus::True;
        condition.reason = "GatheredOK".to_string();
        condition.message = format!("Created {} records in the archive.", report.records_count);
        if !report.errors.is_empty() {
            condition.reason = "GatheredWithError".to_string();
            condition.message = format!("{} Error: {}", condition.message, report.errors.join(","));
        }
    } else if !report.errors.is_empty() && report.panic.is_none() {
        condition.reason = "GatherError".to_string();
        condition.message = report.errors.join(",");
    }
    condition.last_transition_time = Some(Utc::now());

    GathererStatus {
        name: report.name.clone(),
        last_gather_duration_ms: i64::try_from(report.duration_in_ms).unwrap_or(i64::MAX),
        conditions: vec![condition],
    }
}

const STATUS_UPDATE_ATTEMPTS: usize = 3;

/// Applies `change` to the latest version of the request and writes its status back, re-reading
/// on conflicts.
pub async fn modify_status<F>(
    requests: &dyn DataGatherStore,
    name: &str,
    mut change: F,
) -> Result<DataGather, ClusterError>
where
    F: FnMut(&mut DataGather),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut data_gather = requests.get_data_gather(name).await?;
        change(&mut data_gather);
        match requests.update_data_gather_status(&data_gather).await {
            Err(ClusterError::Conflict { .. }) if attempt < STATUS_UPDATE_ATTEMPTS => {
                debug!("Status of {name} changed concurrently, retrying");
            }
            result => return result,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("job '{0}' failed")]
    Failed(String),
    #[error("job '{0}' deleted")]
    Deleted(String),
    #[error("failed to record data: {0}")]
    Recording(String),
    #[error("failed to upload data: {0}")]
    Upload(String),
    #[error("data was not processed: {0}")]
    Processing(String),
    #[error("operation cancelled")]
    Cancelled,
}
