// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster ownership transfers.
//!
//! When a transfer of this cluster to another organization is accepted, the OCM API publishes
//! the pull-secret of the new owner. The puller merge-patches it into `openshift-config/pull-secret`
//! so that the next upload is authorized by the new owner. Auths that the new secret does not
//! mention are kept, and so is any other top level field such as `HttpHeaders`.

use crate::backoff::Backoff;
use crate::cluster::{ClusterError, Secret, SecretStore, OPENSHIFT_CONFIG_NAMESPACE};
use crate::config::aggregator::ConfigAggregator;
use crate::config::secret::{PULL_SECRET_KEY, PULL_SECRET_NAME};
use crate::controllerstatus::{Operation, Simple, Summary};
use crate::insights::InsightsClient;
use crate::ocm::{pull_backoff, pull_with_backoff, status_reason};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const STATUS_NAME: &str = "clusterTransferController";

const BACKOFF_DIVISOR: u32 = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterTransfer {
    pub id: String,
    pub cluster_uuid: String,
    pub status: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterTransferList {
    pub page: u64,
    pub size: u64,
    pub total: u64,
    pub items: Vec<ClusterTransfer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct ServiceAuth {
    auth: String,
    email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PullSecretContent {
    auths: BTreeMap<String, ServiceAuth>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unable to parse the pull-secret content: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("the pull-secret has no {PULL_SECRET_KEY} data")]
    MissingData,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Applies `new_secret` to `existing` as a JSON merge patch (RFC 7396).
pub fn merge_pull_secret(existing: &[u8], new_secret: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let mut document: serde_json::Value = serde_json::from_slice(existing)?;
    let patch: serde_json::Value = serde_json::from_slice(new_secret)?;
    json_patch::merge(&mut document, &patch);
    serde_json::to_vec(&document)
}

/// Whether `new_secret` brings an auth that is missing from `existing` or differs from it.
pub fn is_update_required(existing: &[u8], new_secret: &[u8]) -> Result<bool, TransferError> {
    let new_content: PullSecretContent = serde_json::from_slice(new_secret)?;
    let original: PullSecretContent = serde_json::from_slice(existing)?;
    Ok(new_content
        .auths
        .iter()
        .any(|(registry, auth)| original.auths.get(registry) != Some(auth)))
}

pub struct TransferPuller {
    secrets: Arc<dyn SecretStore>,
    client: Arc<InsightsClient>,
    configurator: Arc<ConfigAggregator>,
    status: Arc<Simple>,
    backoff: Option<Backoff>,
}

impl TransferPuller {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        client: Arc<InsightsClient>,
        configurator: Arc<ConfigAggregator>,
    ) -> Self {
        Self {
            secrets,
            client,
            configurator,
            status: Arc::new(Simple::new(STATUS_NAME)),
            backoff: None,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn status(&self) -> Arc<Simple> {
        Arc::clone(&self.status)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut config_changed = self.configurator.config_changed();
        let mut interval = self.configurator.config().cluster_transfer.interval;
        self.pull(&cancel).await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => self.pull(&cancel).await,
                Some(()) = config_changed.changed() => {
                    interval = self.configurator.config().cluster_transfer.interval;
                }
            }
        }
    }

    fn update_status(&self, healthy: bool, reason: &str, message: String) {
        let summary = if healthy {
            Summary::healthy(Operation::PullingClusterTransfer, reason, message)
        } else {
            Summary::unhealthy(Operation::PullingClusterTransfer, reason, message)
        };
        self.status.update_status(summary);
    }

    /// Queries the accepted transfers and updates the pull-secret when one carries new data.
    pub async fn pull(&self, cancel: &CancellationToken) {
        let transfer = self.configurator.config().cluster_transfer;
        info!(
            "Checking the availability of cluster transfer. Next check is in {}s",
            transfer.interval.as_secs()
        );
        let backoff = self
            .backoff
            .clone()
            .unwrap_or_else(|| pull_backoff(transfer.interval, BACKOFF_DIVISOR));
        let result = pull_with_backoff(backoff, cancel, || {
            self.client.recv_cluster_transfer(&transfer.endpoint)
        })
        .await;

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                let message = format!("failed to pull cluster transfer: {e}");
                match e.status_code() {
                    Some(code) => self.status.update_status(
                        Summary::unhealthy(
                            Operation::PullingClusterTransfer,
                            &status_reason(code),
                            message,
                        )
                        .with_status_code(code),
                    ),
                    None => {
                        error!("{message}");
                        self.update_status(true, "Disconnected", message);
                    }
                }
                return;
            }
        };

        if body.is_empty() {
            info!("No available accepted cluster transfer");
            self.update_status(
                true,
                "NoClusterTransfer",
                "no available cluster transfer".to_string(),
            );
            return;
        }
        let list: ClusterTransferList = match serde_json::from_slice(&body) {
            Ok(list) => list,
            Err(e) => {
                let message =
                    format!("unable to deserialize the cluster transfer API response: {e}");
                error!("{message}");
                self.update_status(false, "UnexpectedData", message);
                return;
            }
        };
        self.check_list_and_update(&list).await;
    }

    async fn check_list_and_update(&self, list: &ClusterTransferList) {
        if list.total > 1 {
            let message =
                "there are more accepted cluster transfers. The pull-secret will not be updated!";
            info!("{message}");
            self.update_status(true, "MoreAcceptedClusterTransfers", message.to_string());
            return;
        }
        let [transfer] = list.items.as_slice() else {
            let message = "unexpected number of cluster transfers received from the API";
            info!("{message}");
            self.update_status(true, "UnexpectedData", message.to_string());
            return;
        };

        let new_secret = transfer.secret.as_bytes();
        let pull_secret = match self.pull_secret().await {
            Ok(pull_secret) => pull_secret,
            Err(e) => {
                self.report_corrupted(&e);
                return;
            }
        };
        let existing = pull_secret
            .data
            .get(PULL_SECRET_KEY)
            .cloned()
            .unwrap_or_default();
        match is_update_required(&existing, new_secret) {
            Ok(true) => {}
            Ok(false) => {
                info!("No new data received");
                self.update_status(true, "NoNewData", "no new data received".to_string());
                return;
            }
            Err(e) => {
                self.report_corrupted(&e);
                return;
            }
        }

        info!("Updating the pull-secret content");
        if let Err(e) = self.update_pull_secret(pull_secret, &existing, new_secret).await {
            let message = format!("failed to update pull-secret: {e}");
            error!("{message}");
            self.update_status(false, "UpdateFailed", message);
            return;
        }
        info!("pull-secret successfully updated");
        self.update_status(
            true,
            "PullSecretUpdated",
            "pull-secret successfully updated".to_string(),
        );
    }

    fn report_corrupted(&self, e: &TransferError) {
        let message = format!("new pull-secret check failed: {e}");
        error!("{message}");
        self.update_status(false, "DataCorrupted", message);
    }

    async fn pull_secret(&self) -> Result<Secret, TransferError> {
        let secret = self
            .secrets
            .get_secret(OPENSHIFT_CONFIG_NAMESPACE, PULL_SECRET_NAME)
            .await?;
        if !secret.data.contains_key(PULL_SECRET_KEY) {
            return Err(TransferError::MissingData);
        }
        Ok(secret)
    }

    async fn update_pull_secret(
        &self,
        mut pull_secret: Secret,
        existing: &[u8],
        new_secret: &[u8],
    ) -> Result<(), TransferError> {
        let merged = merge_pull_secret(existing, new_secret)?;
        pull_secret.data.insert(PULL_SECRET_KEY.to_string(), merged);
        self.secrets.update_secret(&pull_secret).await?;
        Ok(())
    }
}
