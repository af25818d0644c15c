// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster API collaborators.
//!
//! The agent talks to the control plane only through the traits in this module. Each trait
//! covers one resource family, the way a typed API client would. [`memory::MemoryCluster`]
//! implements all of them and backs the tests as well as the local mode of the binary.
//!
//! Updates use optimistic concurrency: every object carries a `resource_version` and an update
//! whose version does not match the stored one fails with [`ClusterError::Conflict`].

pub mod datagather;
pub mod job;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use datagather::{DataGather, DataGatherStore};
pub use job::{Job, JobStore};
pub use memory::MemoryCluster;

pub const OPENSHIFT_CONFIG_NAMESPACE: &str = "openshift-config";
pub const INSIGHTS_NAMESPACE: &str = "openshift-insights";
pub const CLUSTER_OPERATOR_NAME: &str = "insights";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum ClusterError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("conflict updating {kind} {name:?}: the object has been modified")]
    Conflict { kind: &'static str, name: String },
    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub resource_version: u64,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, Vec<u8>>,
    #[serde(rename = "type")]
    pub secret_type: String,
}

impl Secret {
    pub fn string(&self, key: &str) -> Option<String> {
        self.data
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub name: String,
    /// Kubernetes style architecture name (`amd64`, `arm64`, ...).
    pub architecture: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition as exposed on cluster resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: None,
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Replaces or appends a condition. The transition time only moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.condition_type != condition_type);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperandVersion {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectReference {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    pub conditions: Vec<Condition>,
    pub versions: Vec<OperandVersion>,
    pub related_objects: Vec<ObjectReference>,
    /// Free-form status extension; carries `{"lastReportTime": "<rfc3339>"}`.
    pub extension: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOperator {
    pub metadata: ObjectMeta,
    pub status: ClusterOperatorStatus,
}

/// Read access to cluster scoped configuration documents (`clusterversion`, `infrastructure`,
/// `ingress`, `network`, `proxy`) and the node list.
#[async_trait]
pub trait ConfigResources: Send + Sync {
    async fn get_config_resource(&self, kind: &str) -> Result<serde_json::Value, ClusterError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;
}

#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClusterError>;
}

#[async_trait]
pub trait ClusterOperatorStore: Send + Sync {
    async fn get_cluster_operator(&self, name: &str) -> Result<ClusterOperator, ClusterError>;
    async fn create_cluster_operator(
        &self,
        operator: &ClusterOperator,
    ) -> Result<ClusterOperator, ClusterError>;
    async fn update_cluster_operator_status(
        &self,
        operator: &ClusterOperator,
    ) -> Result<ClusterOperator, ClusterError>;
}

/// Cluster id and version from the `clusterversion` document.
pub async fn cluster_version_info(
    resources: &dyn ConfigResources,
) -> Result<(Option<String>, Option<String>), ClusterError> {
    let doc = resources.get_config_resource("clusterversion").await?;
    let id = doc
        .pointer("/spec/clusterID")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let version = doc
        .pointer("/status/desired/version")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok((id, version))
}
