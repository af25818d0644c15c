// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operator side of the on-demand gathering.

use super::job::JobController;
use super::{
    current_phase, initial_conditions, modify_status, set_phase, GatheringPhase, JobError,
    DATA_PROCESSED, DATA_UPLOADED, PERIODIC_GATHERING_PREFIX,
};
use crate::cluster::datagather::{DataGather, DataGatherState, DataGatherStore};
use crate::cluster::{
    find_condition, ClusterError, ConditionStatus, ObjectReference, INSIGHTS_NAMESPACE,
};
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, Simple, Summary};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DATA_UPLOADED_NOT_AVAILABLE_REASON: &str = "DataUploadedConditionNotAvailable";
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Jobs and requests older than this are removed.
pub const MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct OnDemandController {
    requests: Arc<dyn DataGatherStore>,
    jobs: JobController,
    configurator: Arc<ConfigAggregator>,
    image: String,
    uploader_status: Arc<Simple>,
    prune_interval: Duration,
}

impl OnDemandController {
    pub fn new(
        requests: Arc<dyn DataGatherStore>,
        jobs: JobController,
        configurator: Arc<ConfigAggregator>,
        image: impl Into<String>,
        uploader_status: Arc<Simple>,
    ) -> Self {
        Self {
            requests,
            jobs,
            configurator,
            image: image.into(),
            uploader_status,
            prune_interval: PRUNE_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_prune_interval(mut self, prune_interval: Duration) -> Self {
        self.prune_interval = prune_interval;
        self
    }

    /// Serves every newly created request until cancelled. Requests created by the periodic
    /// gathering are ignored.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut created = self.requests.watch_created();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                name = created.recv() => {
                    let Some(name) = name else {
                        debug!("DataGather watch closed");
                        return;
                    };
                    if name.starts_with(PERIODIC_GATHERING_PREFIX) {
                        debug!("Ignoring periodic DataGather {name}");
                        continue;
                    }
                    let controller = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = controller.on_demand_gather(&name, &cancel).await {
                            error!("On-demand gathering of {name} failed: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Runs the gathering job of request `name` and follows it to its end, within four
    /// reporting intervals.
    pub async fn on_demand_gather(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DataGather, JobError> {
        let timeout = self.configurator.config().data_reporting.interval * 4;
        let handler = cancel.child_token();
        match tokio::time::timeout(timeout, self.run_job_and_check_results(name, &handler)).await {
            Ok(result) => result,
            Err(_) => {
                handler.cancel();
                error!(
                    "On-demand gathering of {name} did not finish within {}",
                    humantime::format_duration(timeout)
                );
                Err(JobError::Cancelled)
            }
        }
    }

    async fn run_job_and_check_results(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DataGather, JobError> {
        let data_gather = self.requests.get_data_gather(name).await?;
        if let Some(state) = data_gather.status.state {
            info!("DataGather {name} resource state is {state:?}. Not triggering any data gathering");
            return Ok(data_gather);
        }

        info!("Starting on-demand data gathering for the {name} DataGather resource");
        let storage_path = self.configurator.config().data_reporting.storage_path;
        let job = self
            .jobs
            .create_gatherer_job(&self.image, &storage_path.to_string_lossy(), &data_gather)
            .await?;
        let job_reference = ObjectReference {
            group: "batch".to_string(),
            resource: "job".to_string(),
            namespace: job.metadata.namespace.clone(),
            name: job.metadata.name.clone(),
        };
        modify_status(self.requests.as_ref(), name, |dg| {
            dg.status.conditions.clear();
            super::update_conditions(dg, initial_conditions());
            set_phase(dg, GatheringPhase::Pending);
            dg.status.related_objects = vec![job_reference.clone()];
        })
        .await?;
        info!("Created new gathering job {}", job.metadata.name);

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let mut started_tx = Some(started_tx);
        let wait = self.jobs.wait_for_job_completion(&job, cancel, move || {
            if let Some(tx) = started_tx.take() {
                let _ = tx.send(());
            }
        });
        let mark_running = async {
            if started_rx.await.is_err() {
                return;
            }
            let result = modify_status(self.requests.as_ref(), name, |dg| {
                if matches!(current_phase(dg), None | Some(GatheringPhase::Pending)) {
                    set_phase(dg, GatheringPhase::Gathering);
                }
            })
            .await;
            if let Err(e) = result {
                error!("Failed to mark the {name} DataGather resource as running: {e}");
            }
        };
        let (waited, ()) = tokio::join!(wait, mark_running);
        match waited {
            Err(JobError::Cancelled) => {
                error!("Failed to read the status of job {}", job.metadata.name);
                return Err(JobError::Cancelled);
            }
            Err(e) => error!("{e}"),
            Ok(()) => {}
        }
        info!("Job completed {}", job.metadata.name);

        let finished = modify_status(self.requests.as_ref(), name, |dg| {
            let phase = if current_phase(dg) == Some(GatheringPhase::Succeeded) {
                GatheringPhase::Succeeded
            } else {
                GatheringPhase::Failed
            };
            set_phase(dg, phase);
        })
        .await?;

        if !self.was_data_uploaded(&finished) {
            error!("Last data gathering {name} was not successful");
        } else if !was_data_processed(&finished) {
            info!(
                "Data archive for the {name} was not processed. New Insights analysis is not available."
            );
        }
        Ok(finished)
    }

    /// Mirrors the `DataUploaded` condition of a finished request into the uploader status. A
    /// failed upload degrades the operator at once.
    fn was_data_uploaded(&self, data_gather: &DataGather) -> bool {
        let condition = find_condition(&data_gather.status.conditions, DATA_UPLOADED);
        let summary = match condition {
            None => Summary {
                count: 5,
                ..Summary::unhealthy(
                    Operation::Uploading,
                    DATA_UPLOADED_NOT_AVAILABLE_REASON,
                    format!(
                        "did not find any {DATA_UPLOADED:?} condition in the {} dataGather resource",
                        data_gather.metadata.name
                    ),
                )
            },
            Some(c) if c.status == ConditionStatus::False => Summary {
                count: 5,
                ..Summary::unhealthy(Operation::Uploading, &c.reason, c.message.clone())
            },
            Some(_) => Summary::healthy(Operation::Uploading, "", ""),
        };
        let healthy = summary.healthy;
        self.uploader_status.set_status(summary);
        healthy
    }

    /// Deletes the active jobs of unfinished on-demand requests and marks the requests failed.
    /// Returns the number of aborted requests.
    pub async fn abort_in_progress(&self) -> Result<usize, ClusterError> {
        let mut aborted = 0;
        for data_gather in self.requests.list_data_gathers().await? {
            let name = &data_gather.metadata.name;
            if name.starts_with(PERIODIC_GATHERING_PREFIX)
                || !matches!(
                    data_gather.status.state,
                    Some(DataGatherState::Pending | DataGatherState::Running)
                )
            {
                continue;
            }
            let job = match self.jobs.store().get_job(INSIGHTS_NAMESPACE, name).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if job.status.active == 0 {
                continue;
            }
            info!("Aborting the in-progress gathering {name}");
            self.jobs.store().delete_job(INSIGHTS_NAMESPACE, name).await?;
            modify_status(self.requests.as_ref(), name, |dg| {
                set_phase(dg, GatheringPhase::Failed);
            })
            .await?;
            aborted += 1;
        }
        Ok(aborted)
    }

    /// Removes the jobs and requests created more than [`MAX_AGE`] before `now`. Returns how
    /// many objects were removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(MAX_AGE) else {
            return 0;
        };
        let expired = |created: Option<DateTime<Utc>>| created.is_some_and(|at| now - at > max_age);
        let mut removed = 0;

        match self.jobs.store().list_jobs(INSIGHTS_NAMESPACE).await {
            Ok(jobs) => {
                for job in jobs.iter().filter(|j| expired(j.metadata.creation_timestamp)) {
                    let name = &job.metadata.name;
                    match self.jobs.store().delete_job(INSIGHTS_NAMESPACE, name).await {
                        Ok(()) => {
                            info!("Job {name} successfully removed");
                            removed += 1;
                        }
                        Err(e) => error!("Failed to delete job {name}: {e}"),
                    }
                }
            }
            Err(e) => error!("Failed to list the gathering jobs: {e}"),
        }

        match self.requests.list_data_gathers().await {
            Ok(requests) => {
                for request in requests.iter().filter(|r| expired(r.metadata.creation_timestamp)) {
                    let name = &request.metadata.name;
                    match self.requests.delete_data_gather(name).await {
                        Ok(()) => {
                            info!("DataGather {name} resource successfully removed");
                            removed += 1;
                        }
                        Err(e) => error!("Failed to delete DataGather custom resource {name}: {e}"),
                    }
                }
            }
            Err(e) => error!("Failed to list the DataGather resources: {e}"),
        }
        removed
    }

    pub async fn periodically_prune(&self, cancel: CancellationToken) {
        info!(
            "Pruning old jobs every {}",
            humantime::format_duration(self.prune_interval)
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.prune_interval) => {
                    info!("Pruning the jobs and datagather resources");
                    self.prune(Utc::now()).await;
                }
            }
        }
    }
}

fn was_data_processed(data_gather: &DataGather) -> bool {
    find_condition(&data_gather.status.conditions, DATA_PROCESSED)
        .is_some_and(|c| c.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::job::{JobStatus, JobStore};
    use crate::cluster::{Condition, MemoryCluster, ObjectMeta};
    use crate::config::Config;
    use crate::controllerstatus::StatusSource;
    use crate::datagather::{
        update_conditions, DATA_RECORDED, FAILED_REASON, PROGRESSING, SUCCEEDED_REASON,
    };

    fn controller(cluster: &MemoryCluster) -> OnDemandController {
        OnDemandController::new(
            Arc::new(cluster.clone()),
            JobController::new(Arc::new(cluster.clone()))
                .with_poll_interval(Duration::from_millis(5)),
            Arc::new(ConfigAggregator::new(
                Config::default().to_insights_configuration(),
            )),
            "quay.io/openshift/insights-operator:latest",
            Arc::new(Simple::new("insightsuploader")),
        )
    }

    async fn create_request(cluster: &MemoryCluster, name: &str) {
        let mut dg = DataGather::default();
        dg.metadata.name = name.to_string();
        cluster.create_data_gather(&dg).await.unwrap();
    }

    async fn wait_for_state(cluster: &MemoryCluster, name: &str, state: DataGatherState) {
        for _ in 0..400 {
            let dg = cluster.get_data_gather(name).await.unwrap();
            if dg.status.state == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request {name} never reached {state:?}");
    }

    /// Plays the gathering job: reports the given upload condition and phase, then finishes.
    async fn finish_job(
        cluster: &MemoryCluster,
        name: &str,
        uploaded: Condition,
        phase: GatheringPhase,
        job: JobStatus,
    ) {
        cluster.set_job_status(
            INSIGHTS_NAMESPACE,
            name,
            JobStatus {
                active: 1,
                ..Default::default()
            },
        );
        wait_for_state(cluster, name, DataGatherState::Running).await;
        modify_status(cluster, name, |dg| {
            update_conditions(dg, [uploaded.clone()]);
            set_phase(dg, phase);
        })
        .await
        .unwrap();
        cluster.set_job_status(INSIGHTS_NAMESPACE, name, job);
    }

    #[tokio::test]
    async fn test_successful_on_demand_gathering() {
        let cluster = MemoryCluster::new();
        create_request(&cluster, "custom-gather").await;
        let controller = Arc::new(controller(&cluster));

        let handle = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .on_demand_gather("custom-gather", &CancellationToken::new())
                    .await
            })
        };
        wait_for_state(&cluster, "custom-gather", DataGatherState::Pending).await;

        let pending = cluster.get_data_gather("custom-gather").await.unwrap();
        assert_eq!(pending.status.related_objects[0].resource, "job");
        assert_eq!(pending.status.related_objects[0].group, "batch");
        assert!(find_condition(&pending.status.conditions, DATA_RECORDED).is_some());

        finish_job(
            &cluster,
            "custom-gather",
            Condition::new(DATA_UPLOADED, ConditionStatus::True, SUCCEEDED_REASON, ""),
            GatheringPhase::Succeeded,
            JobStatus {
                succeeded: 1,
                ..Default::default()
            },
        )
        .await;

        let finished = handle.await.unwrap().unwrap();
        assert_eq!(finished.status.state, Some(DataGatherState::Completed));
        assert!(finished.status.start_time.is_some());
        assert!(finished.status.finish_time.is_some());
        assert!(controller.uploader_status.current_status().unwrap().healthy);
    }

    #[tokio::test]
    async fn test_failed_upload_degrades_uploader() {
        let cluster = MemoryCluster::new();
        create_request(&cluster, "custom-gather").await;
        let controller = Arc::new(controller(&cluster));

        let handle = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .on_demand_gather("custom-gather", &CancellationToken::new())
                    .await
            })
        };
        wait_for_state(&cluster, "custom-gather", DataGatherState::Pending).await;
        finish_job(
            &cluster,
            "custom-gather",
            Condition::new(DATA_UPLOADED, ConditionStatus::False, FAILED_REASON, "boom"),
            GatheringPhase::Failed,
            JobStatus {
                failed: 1,
                ..Default::default()
            },
        )
        .await;

        let finished = handle.await.unwrap().unwrap();
        assert_eq!(finished.status.state, Some(DataGatherState::Failed));
        let progressing = find_condition(&finished.status.conditions, PROGRESSING).unwrap();
        assert_eq!(progressing.reason, "GatheringFailed");

        let uploader = controller.uploader_status.current_status().unwrap();
        assert!(!uploader.healthy);
        assert_eq!(uploader.count, 5);
        assert_eq!(uploader.reason, FAILED_REASON);
        assert_eq!(uploader.message, "boom");
    }

    #[tokio::test]
    async fn test_started_request_is_not_gathered_again() {
        let cluster = MemoryCluster::new();
        let mut dg = DataGather::default();
        dg.metadata.name = "done".to_string();
        dg.status.state = Some(DataGatherState::Completed);
        cluster.create_data_gather(&dg).await.unwrap();

        let result = controller(&cluster)
            .on_demand_gather("done", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status.state, Some(DataGatherState::Completed));
        assert!(cluster.list_jobs(INSIGHTS_NAMESPACE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_ignores_periodic_requests() {
        let cluster = MemoryCluster::new();
        let controller = Arc::new(controller(&cluster));
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&controller).run(cancel.clone()));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        create_request(&cluster, "periodic-gathering-abcde").await;
        create_request(&cluster, "custom").await;
        wait_for_state(&cluster, "custom", DataGatherState::Pending).await;
        assert!(cluster
            .get_job(INSIGHTS_NAMESPACE, "periodic-gathering-abcde")
            .await
            .unwrap_err()
            .is_not_found());

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_in_progress() {
        let cluster = MemoryCluster::new();
        let controller = controller(&cluster);
        for name in ["running", "periodic-gathering-x"] {
            let mut dg = DataGather::default();
            dg.metadata.name = name.to_string();
            dg.status.state = Some(DataGatherState::Running);
            cluster.create_data_gather(&dg).await.unwrap();
            controller
                .jobs
                .create_gatherer_job("image", "/tmp", &dg)
                .await
                .unwrap();
            cluster.set_job_status(
                INSIGHTS_NAMESPACE,
                name,
                JobStatus {
                    active: 1,
                    ..Default::default()
                },
            );
        }

        assert_eq!(controller.abort_in_progress().await.unwrap(), 1);
        assert!(cluster.get_job(INSIGHTS_NAMESPACE, "running").await.is_err());
        assert!(cluster
            .get_job(INSIGHTS_NAMESPACE, "periodic-gathering-x")
            .await
            .is_ok());
        let aborted = cluster.get_data_gather("running").await.unwrap();
        assert_eq!(aborted.status.state, Some(DataGatherState::Failed));
        let progressing = find_condition(&aborted.status.conditions, PROGRESSING).unwrap();
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "GatheringFailed");
    }

    #[tokio::test]
    async fn test_prune_removes_old_objects() {
        let cluster = MemoryCluster::new();
        let controller = controller(&cluster);
        let now = Utc::now();
        for (name, age_hours) in [("old", 25), ("fresh", 1)] {
            let created = Some(now - chrono::Duration::hours(age_hours));
            let mut dg = DataGather::default();
            dg.metadata.name = name.to_string();
            dg.metadata.creation_timestamp = created;
            cluster.create_data_gather(&dg).await.unwrap();

            let mut job = crate::cluster::job::Job::default();
            job.metadata = ObjectMeta::named(INSIGHTS_NAMESPACE, name);
            job.metadata.creation_timestamp = created;
            cluster.create_job(&job).await.unwrap();
        }

        assert_eq!(controller.prune(now).await, 2);
        assert!(cluster.get_data_gather("old").await.is_err());
        assert!(cluster.get_data_gather("fresh").await.is_ok());
        assert!(cluster.get_job(INSIGHTS_NAMESPACE, "old").await.is_err());
        assert!(cluster.get_job(INSIGHTS_NAMESPACE, "fresh").await.is_ok());
    }
}
