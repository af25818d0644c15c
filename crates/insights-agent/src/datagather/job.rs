// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gathering jobs: creation from a data-gather request and waiting for their completion.

use super::JobError;
use crate::cluster::datagather::{DataGather, Storage, StorageType};
use crate::cluster::job::{
    Container, ContainerSecurityContext, EnvVar, Job, JobSpec, JobStore, PodSecurityContext,
    PodSpec, PodTemplate, Volume, VolumeMount, VolumeSource,
};
use crate::cluster::{ClusterError, ObjectMeta, INSIGHTS_NAMESPACE};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const GATHERING_CONTAINER: &str = "insights-gathering";
pub const SERVICE_ACCOUNT: &str = "operator";
pub const ARCHIVES_VOLUME: &str = "archives-path";
pub const SERVICE_CA_BUNDLE: &str = "service-ca-bundle";
pub const SERVICE_CA_BUNDLE_PATH: &str = "/var/run/configmaps/service-ca-bundle";
pub const CONFIG_PATH: &str = "/etc/insights-operator/server.yaml";
pub const DATAGATHER_NAME_ENV: &str = "DATAGATHER_NAME";

/// Copied from the operator environment into the job.
const FORWARDED_ENV: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY", "RELEASE_VERSION"];

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct JobController {
    jobs: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl JobController {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self {
            jobs,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Creates the single-shot job that serves `data_gather`.
    pub async fn create_gatherer_job(
        &self,
        image: &str,
        storage_path: &str,
        data_gather: &DataGather,
    ) -> Result<Job, ClusterError> {
        let storage = data_gather.spec.storage.as_ref();
        let volume_source = self.volume_source(storage).await;
        let job = gatherer_job(
            &data_gather.metadata.name,
            image,
            volume_source,
            volume_mounts(storage_path, storage),
            env_vars(&data_gather.metadata.name, |name| std::env::var(name).ok()),
        );
        self.jobs.create_job(&job).await
    }

    /// The claim of a persistent volume storage when it exists, an empty directory otherwise.
    async fn volume_source(&self, storage: Option<&Storage>) -> VolumeSource {
        let Some(storage) = storage else {
            info!("Creating volume source with EmptyDir, no storage spec provided");
            return VolumeSource::EmptyDir;
        };
        if storage.storage_type == StorageType::PersistentVolume {
            if let Some(volume) = &storage.persistent_volume {
                match self
                    .jobs
                    .persistent_volume_claim_exists(INSIGHTS_NAMESPACE, &volume.claim_name)
                    .await
                {
                    Ok(true) => {
                        info!(
                            "Creating volume source with PersistentVolumeClaimName: {}",
                            volume.claim_name
                        );
                        return VolumeSource::PersistentVolumeClaim {
                            claim_name: volume.claim_name.clone(),
                        };
                    }
                    Ok(false) => error!(
                        "PersistentVolumeClaim {} not found",
                        volume.claim_name
                    ),
                    Err(e) => error!(
                        "Failed to get PersistentVolumeClaim with name {}: {e}",
                        volume.claim_name
                    ),
                }
            }
        }
        info!("Creating volume source with EmptyDir");
        VolumeSource::EmptyDir
    }

    /// Polls the job until it succeeds or fails.
    pub async fn wait_for_job_completion(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        mut on_started: impl FnMut(),
    ) -> Result<(), JobError> {
        let name = &job.metadata.name;
        let mut started = false;
        loop {
            match self.jobs.get_job(INSIGHTS_NAMESPACE, name).await {
                Ok(current) => {
                    if !started && (current.status.active > 0 || current.status.start_time.is_some())
                    {
                        started = true;
                        on_started();
                    }
                    if current.status.succeeded > 0 {
                        return Ok(());
                    }
                    if current.status.failed > 0 {
                        return Err(JobError::Failed(name.clone()));
                    }
                }
                Err(e) if e.is_not_found() => return Err(JobError::Deleted(name.clone())),
                Err(e) => warn!("Unable to read the status of job {name}: {e}"),
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(JobError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

pub fn gatherer_job(
    name: &str,
    image: &str,
    volume_source: VolumeSource,
    volume_mounts: Vec<VolumeMount>,
    env: Vec<EnvVar>,
) -> Job {
    let mut metadata = ObjectMeta::named(INSIGHTS_NAMESPACE, name);
    metadata.annotations = BTreeMap::from([(
        "openshift.io/required-scc".to_string(),
        "restricted-v2".to_string(),
    )]);

    Job {
        metadata,
        spec: JobSpec {
            // a failed gathering is not restarted
            backoff_limit: 0,
            template: PodTemplate {
                metadata: ObjectMeta::default(),
                spec: PodSpec {
                    restart_policy: "Never".to_string(),
                    service_account_name: SERVICE_ACCOUNT.to_string(),
                    priority_class_name: "system-cluster-critical".to_string(),
                    node_selector: BTreeMap::new(),
                    tolerations: Vec::new(),
                    security_context: PodSecurityContext {
                        run_as_non_root: true,
                        seccomp_profile: "RuntimeDefault".to_string(),
                    },
                    volumes: vec![
                        Volume {
                            name: ARCHIVES_VOLUME.to_string(),
                            source: volume_source,
                        },
                        Volume {
                            name: SERVICE_CA_BUNDLE.to_string(),
                            source: VolumeSource::ConfigMap {
                                name: SERVICE_CA_BUNDLE.to_string(),
                                optional: true,
                            },
                        },
                    ],
                    containers: vec![Container {
                        name: GATHERING_CONTAINER.to_string(),
                        image: image.to_string(),
                        args: vec![
                            "gather-and-upload".to_string(),
                            "-v=4".to_string(),
                            format!("--config={CONFIG_PATH}"),
                        ],
                        env,
                        resource_requests: BTreeMap::from([
                            ("cpu".to_string(), "10m".to_string()),
                            ("memory".to_string(), "70Mi".to_string()),
                        ]),
                        volume_mounts,
                        security_context: ContainerSecurityContext {
                            allow_privilege_escalation: false,
                            read_only_root_filesystem: true,
                            capabilities_drop: vec!["ALL".to_string()],
                        },
                        termination_message_policy: "FallbackToLogsOnError".to_string(),
                    }],
                },
            },
        },
        status: Default::default(),
    }
}

/// Archive and CA bundle mounts. A persistent volume may bring its own mount path.
pub fn volume_mounts(storage_path: &str, storage: Option<&Storage>) -> Vec<VolumeMount> {
    let mut archives = VolumeMount {
        name: ARCHIVES_VOLUME.to_string(),
        mount_path: storage_path.to_string(),
    };
    if let Some(Storage {
        storage_type: StorageType::PersistentVolume,
        persistent_volume: Some(volume),
    }) = storage
    {
        if !volume.mount_path.is_empty() {
            archives.mount_path.clone_from(&volume.mount_path);
        }
    }
    vec![
        archives,
        VolumeMount {
            name: SERVICE_CA_BUNDLE.to_string(),
            mount_path: SERVICE_CA_BUNDLE_PATH.to_string(),
        },
    ]
}

/// Proxy and release settings found through `lookup`, plus the name of the request.
pub fn env_vars(data_gather_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = FORWARDED_ENV
        .iter()
        .filter_map(|name| match lookup(name) {
            Some(value) => Some(EnvVar {
                name: (*name).to_string(),
                value,
            }),
            None => {
                warn!("Environment variable {name:?} not found");
                None
            }
        })
        .collect();
    env.push(EnvVar {
        name: DATAGATHER_NAME_ENV.to_string(),
        value: data_gather_name.to_string(),
    });
    env
}
