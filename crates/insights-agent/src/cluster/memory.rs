// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory cluster used by the local mode of the binary and by tests.

use super::datagather::{DataGather, DataGatherStore};
use super::job::{Job, JobStatus, JobStore};
use super::{
    ClusterError, ClusterOperator, ClusterOperatorStore, ConfigMap, ConfigMapStore,
    ConfigResources, Node, ObjectMeta, Secret, SecretStore,
};
use async_trait::async_trait;
use chrono::Utc;
use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    config_resources: BTreeMap<String, serde_json::Value>,
    nodes: Vec<Node>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    operators: BTreeMap<String, ClusterOperator>,
    operator_status_updates: usize,
    data_gathers: BTreeMap<String, DataGather>,
    jobs: BTreeMap<Key, Job>,
    persistent_volume_claims: BTreeSet<Key>,
    resource_version: u64,
    watchers: Vec<mpsc::UnboundedSender<String>>,
}

impl State {
    fn stamp(&mut self, metadata: &mut ObjectMeta) {
        self.resource_version += 1;
        metadata.resource_version = self.resource_version;
        if metadata.creation_timestamp.is_none() {
            metadata.creation_timestamp = Some(Utc::now());
        }
    }
}

fn check_version(
    kind: &'static str,
    stored: &ObjectMeta,
    incoming: &ObjectMeta,
) -> Result<(), ClusterError> {
    if stored.resource_version != incoming.resource_version {
        return Err(ClusterError::Conflict {
            kind,
            name: incoming.name.clone(),
        });
    }
    Ok(())
}

/// Cluster snapshot file accepted by `--kubeconfig` in local mode.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub config_resources: BTreeMap<String, serde_json::Value>,
    pub nodes: Vec<Node>,
    pub secrets: Vec<SnapshotSecret>,
    pub config_maps: Vec<ConfigMap>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotSecret {
    pub namespace: String,
    pub name: String,
    pub string_data: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster").finish_non_exhaustive()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot_file(path: &Path) -> Result<Self, ClusterError> {
        let snapshot: ClusterSnapshot = Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| ClusterError::Api(format!("unable to load cluster snapshot: {e}")))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        let cluster = Self::new();
        for (kind, doc) in snapshot.config_resources {
            cluster.set_config_resource(&kind, doc);
        }
        for node in snapshot.nodes {
            cluster.add_node(&node.name, &node.architecture);
        }
        for s in snapshot.secrets {
            let mut secret = Secret {
                metadata: ObjectMeta::named(&s.namespace, &s.name),
                ..Default::default()
            };
            for (k, v) in s.string_data {
                secret.data.insert(k, v.into_bytes());
            }
            cluster.insert_secret(secret);
        }
        for config_map in snapshot.config_maps {
            cluster.insert_config_map(config_map);
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config_resource(&self, kind: &str, document: serde_json::Value) {
        self.lock()
            .config_resources
            .insert(kind.to_string(), document);
    }

    pub fn add_node(&self, name: &str, architecture: &str) {
        self.lock().nodes.push(Node {
            name: name.to_string(),
            architecture: architecture.to_string(),
        });
    }

    /// Creates or replaces a secret regardless of its resource version.
    pub fn insert_secret(&self, mut secret: Secret) {
        let mut state = self.lock();
        state.stamp(&mut secret.metadata);
        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        state.secrets.insert(k, secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    /// Creates or replaces a config map regardless of its resource version.
    pub fn insert_config_map(&self, mut config_map: ConfigMap) {
        let mut state = self.lock();
        state.stamp(&mut config_map.metadata);
        let k = key(&config_map.metadata.namespace, &config_map.metadata.name);
        state.config_maps.insert(k, config_map);
    }

    pub fn remove_config_map(&self, namespace: &str, name: &str) {
        self.lock().config_maps.remove(&key(namespace, name));
    }

    pub fn cluster_operator(&self, name: &str) -> Option<ClusterOperator> {
        self.lock().operators.get(name).cloned()
    }

    pub fn operator_status_updates(&self) -> usize {
        self.lock().operator_status_updates
    }

    pub fn add_persistent_volume_claim(&self, namespace: &str, name: &str) {
        self.lock()
            .persistent_volume_claims
            .insert(key(namespace, name));
    }

    /// Overwrites the status of a job, standing in for the job controller.
    pub fn set_job_status(&self, namespace: &str, name: &str, status: JobStatus) -> bool {
        let mut state = self.lock();
        let Some(mut job) = state.jobs.get(&key(namespace, name)).cloned() else {
            return false;
        };
        job.status = status;
        state.stamp(&mut job.metadata);
        state.jobs.insert(key(namespace, name), job);
        true
    }
}

#[async_trait]
impl ConfigResources for MemoryCluster {
    async fn get_config_resource(&self, kind: &str) -> Result<serde_json::Value, ClusterError> {
        self.lock()
            .config_resources
            .get(kind)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "config resource",
                name: kind.to_string(),
            })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.lock().nodes.clone())
    }
}

#[async_trait]
impl SecretStore for MemoryCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.lock()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "secret",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        if state.secrets.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "secret",
                name: secret.metadata.name.clone(),
            });
        }
        let mut secret = secret.clone();
        state.stamp(&mut secret.metadata);
        state.secrets.insert(k, secret.clone());
        Ok(secret)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        let k = key(&secret.metadata.namespace, &secret.metadata.name);
        let stored = state.secrets.get(&k).ok_or_else(|| ClusterError::NotFound {
            kind: "secret",
            name: secret.metadata.name.clone(),
        })?;
        check_version("secret", &stored.metadata, &secret.metadata)?;
        let mut secret = secret.clone();
        state.stamp(&mut secret.metadata);
        state.secrets.insert(k, secret.clone());
        Ok(secret)
    }
}

#[async_trait]
impl ConfigMapStore for MemoryCluster {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError> {
        self.lock()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "configmap",
                name: format!("{namespace}/{name}"),
            })
    }
}

#[async_trait]
impl ClusterOperatorStore for MemoryCluster {
    async fn get_cluster_operator(&self, name: &str) -> Result<ClusterOperator, ClusterError> {
        self.lock()
            .operators
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "clusteroperator",
                name: name.to_string(),
            })
    }

    async fn create_cluster_operator(
        &self,
        operator: &ClusterOperator,
    ) -> Result<ClusterOperator, ClusterError> {
        let mut state = self.lock();
        if state.operators.contains_key(&operator.metadata.name) {
            return Err(ClusterError::AlreadyExists {
                kind: "clusteroperator",
                name: operator.metadata.name.clone(),
            });
        }
        let mut operator = operator.clone();
        state.stamp(&mut operator.metadata);
        state
            .operators
            .insert(operator.metadata.name.clone(), operator.clone());
        Ok(operator)
    }

    async fn update_cluster_operator_status(
        &self,
        operator: &ClusterOperator,
    ) -> Result<ClusterOperator, ClusterError> {
        let mut state = self.lock();
        let stored = state
            .operators
            .get(&operator.metadata.name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "clusteroperator",
                name: operator.metadata.name.clone(),
            })?;
        check_version("clusteroperator", &stored.metadata, &operator.metadata)?;
        let mut updated = stored.clone();
        updated.status = operator.status.clone();
        state.stamp(&mut updated.metadata);
        state.operator_status_updates += 1;
        state
            .operators
            .insert(updated.metadata.name.clone(), updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl DataGatherStore for MemoryCluster {
    async fn get_data_gather(&self, name: &str) -> Result<DataGather, ClusterError> {
        self.lock()
            .data_gathers
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "datagather",
                name: name.to_string(),
            })
    }

    async fn create_data_gather(&self, data_gather: &DataGather) -> Result<DataGather, ClusterError> {
        let mut state = self.lock();
        let name = data_gather.metadata.name.clone();
        if state.data_gathers.contains_key(&name) {
            return Err(ClusterError::AlreadyExists {
                kind: "datagather",
                name,
            });
        }
        let mut data_gather = data_gather.clone();
        state.stamp(&mut data_gather.metadata);
        state.data_gathers.insert(name.clone(), data_gather.clone());
        state.watchers.retain(|tx| tx.send(name.clone()).is_ok());
        Ok(data_gather)
    }

    async fn update_data_gather_status(
        &self,
        data_gather: &DataGather,
    ) -> Result<DataGather, ClusterError> {
        let mut state = self.lock();
        let stored = state
            .data_gathers
            .get(&data_gather.metadata.name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "datagather",
                name: data_gather.metadata.name.clone(),
            })?;
        check_version("datagather", &stored.metadata, &data_gather.metadata)?;
        let mut updated = stored.clone();
        updated.status = data_gather.status.clone();
        state.stamp(&mut updated.metadata);
        state
            .data_gathers
            .insert(updated.metadata.name.clone(), updated.clone());
        Ok(updated)
    }

    async fn list_data_gathers(&self) -> Result<Vec<DataGather>, ClusterError> {
        Ok(self.lock().data_gathers.values().cloned().collect())
    }

    async fn delete_data_gather(&self, name: &str) -> Result<(), ClusterError> {
        self.lock()
            .data_gathers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "datagather",
                name: name.to_string(),
            })
    }

    fn watch_created(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        rx
    }
}

#[async_trait]
impl JobStore for MemoryCluster {
    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        let mut state = self.lock();
        let k = key(&job.metadata.namespace, &job.metadata.name);
        if state.jobs.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "job",
                name: job.metadata.name.clone(),
            });
        }
        let mut job = job.clone();
        state.stamp(&mut job.metadata);
        state.jobs.insert(k, job.clone());
        Ok(job)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, ClusterError> {
        self.lock()
            .jobs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "job",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.lock()
            .jobs
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "job",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>, ClusterError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn persistent_volume_claim_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .lock()
            .persistent_volume_claims
            .contains(&key(namespace, name)))
    }
}
