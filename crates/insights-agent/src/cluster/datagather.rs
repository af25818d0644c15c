// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The data-gather request resource.

use super::{ClusterError, Condition, ObjectMeta, ObjectReference};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataGather {
    pub metadata: ObjectMeta,
    pub spec: DataGatherSpec,
    pub status: DataGatherStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataGatherSpec {
    /// `ObfuscateNetworking` enables network obfuscation for this request.
    pub data_policy: Vec<String>,
    pub gatherers: Vec<GathererSpec>,
    pub storage: Option<Storage>,
}

impl DataGatherSpec {
    pub fn disabled_gatherers(&self) -> Vec<String> {
        self.gatherers
            .iter()
            .filter(|g| g.state == GathererState::Disabled)
            .map(|g| g.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GathererState {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GathererSpec {
    pub name: String,
    pub state: GathererState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    #[default]
    Ephemeral,
    PersistentVolume,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Storage {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub persistent_volume: Option<PersistentVolumeConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistentVolumeConfig {
    pub claim_name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataGatherState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GathererStatus {
    pub name: String,
    pub last_gather_duration_ms: i64,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataGatherStatus {
    pub state: Option<DataGatherState>,
    pub conditions: Vec<Condition>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub insights_request_id: String,
    pub gatherers: Vec<GathererStatus>,
    pub related_objects: Vec<ObjectReference>,
}

#[async_trait]
pub trait DataGatherStore: Send + Sync {
    async fn get_data_gather(&self, name: &str) -> Result<DataGather, ClusterError>;
    async fn create_data_gather(&self, data_gather: &DataGather) -> Result<DataGather, ClusterError>;
    async fn update_data_gather_status(
        &self,
        data_gather: &DataGather,
    ) -> Result<DataGather, ClusterError>;
    async fn list_data_gathers(&self) -> Result<Vec<DataGather>, ClusterError>;
    async fn delete_data_gather(&self, name: &str) -> Result<(), ClusterError>;
    /// Names of newly created requests, in creation order.
    fn watch_created(&self) -> mpsc::UnboundedReceiver<String>;
}
