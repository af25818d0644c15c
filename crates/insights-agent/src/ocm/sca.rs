// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Simple Content Access certificates.
//!
//! The puller asks the OCM API for the entitlement certificates of every architecture found
//! among the cluster nodes and keeps them in the `etc-pki-entitlement` secret, where builds pick
//! them up. The secret is created when missing and updated in place otherwise; it is never
//! deleted.

use crate::backoff::Backoff;
use crate::cluster::{ClusterError, ConfigResources, ObjectMeta, Secret, SecretStore};
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, Simple, Summary};
use crate::insights::{InsightsClient, InsightsError};
use crate::ocm::{pull_backoff, pull_with_backoff, status_reason};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const STATUS_NAME: &str = "scaController";
pub const SECRET_NAMESPACE: &str = "openshift-config-managed";
pub const SECRET_NAME: &str = "etc-pki-entitlement";
pub const ENTITLEMENT_KEY: &str = "entitlement.pem";
pub const ENTITLEMENT_PRIVATE_KEY: &str = "entitlement-key.pem";

const BACKOFF_DIVISOR: u32 = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CertificateMetadata {
    pub arch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScaCertificate {
    pub id: String,
    pub organization_id: String,
    pub cert: String,
    pub key: String,
    pub metadata: CertificateMetadata,
}

/// The API answers either with a certificate list or with a single certificate.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScaResponse {
    List { items: Vec<ScaCertificate> },
    Single(ScaCertificate),
}

impl ScaResponse {
    fn into_certificates(self) -> Vec<ScaCertificate> {
        match self {
            ScaResponse::List { items } => items,
            ScaResponse::Single(certificate) => vec![certificate],
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error("unable to decode the SCA response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no SCA certificate was returned")]
    Empty,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Maps a Kubernetes node architecture onto the name the OCM API expects.
pub fn ocm_architecture(node_architecture: &str) -> String {
    match node_architecture {
        "amd64" => "x86_64",
        "i386" | "386" => "x86",
        "arm64" => "aarch64",
        other => other,
    }
    .to_string()
}

pub struct ScaPuller {
    resources: Arc<dyn ConfigResources>,
    secrets: Arc<dyn SecretStore>,
    client: Arc<InsightsClient>,
    configurator: Arc<ConfigAggregator>,
    status: Arc<Simple>,
    backoff: Option<Backoff>,
}

impl ScaPuller {
    pub fn new(
        resources: Arc<dyn ConfigResources>,
        secrets: Arc<dyn SecretStore>,
        client: Arc<InsightsClient>,
        configurator: Arc<ConfigAggregator>,
    ) -> Self {
        Self {
            resources,
            secrets,
            client,
            configurator,
            status: Arc::new(Simple::new(STATUS_NAME)),
            backoff: None,
        }
    }

    /// Overrides the retry policy derived from the SCA interval.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn status(&self) -> Arc<Simple> {
        Arc::clone(&self.status)
    }

    /// Pulls once at start, then every SCA interval. Config changes take effect on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut config_changed = self.configurator.config_changed();
        let mut sca = self.configurator.config().sca;
        if sca.disabled {
            self.report_disabled();
        } else {
            self.pull(&cancel).await;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(sca.interval) => {
                    if sca.disabled {
                        self.report_disabled();
                    } else {
                        self.pull(&cancel).await;
                    }
                }
                Some(()) = config_changed.changed() => {
                    sca = self.configurator.config().sca;
                }
            }
        }
    }

    fn report_disabled(&self) {
        let message = "Pulling of the SCA certs from the OCM API is disabled";
        warn!("SCA | {message}");
        self.status
            .update_status(Summary::healthy(Operation::PullingSCACerts, "Disabled", message));
    }

    /// Distinct OCM architectures of the cluster nodes. Falls back to the architecture of this
    /// process when the nodes cannot be listed.
    pub async fn architectures(&self) -> BTreeSet<String> {
        let nodes = match self.resources.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("SCA | Gathering nodes architectures failed: {e}");
                Vec::new()
            }
        };
        let mut architectures: BTreeSet<String> = nodes
            .iter()
            .filter(|node| !node.architecture.is_empty())
            .map(|node| ocm_architecture(&node.architecture))
            .collect();
        if architectures.is_empty() {
            architectures.insert(std::env::consts::ARCH.to_string());
        }
        architectures
    }

    /// One pull of every architecture followed by the secret reconciliation.
    pub async fn pull(&self, cancel: &CancellationToken) {
        let sca = self.configurator.config().sca;
        let endpoint = sca.endpoint;
        info!(
            "SCA | Pulling SCA certificates from {endpoint}. Next check is in {}s",
            sca.interval.as_secs()
        );

        let mut bodies = Vec::new();
        for architecture in self.architectures().await {
            let backoff = self
                .backoff
                .clone()
                .unwrap_or_else(|| pull_backoff(sca.interval, BACKOFF_DIVISOR));
            let result = pull_with_backoff(backoff, cancel, || {
                self.client.recv_sca_certs(&endpoint, &architecture)
            })
            .await;
            match result {
                Ok(body) => bodies.push((architecture, body)),
                Err(e) => {
                    self.report_failure(&endpoint, &e);
                    return;
                }
            }
        }

        let certificates = match decode(&bodies) {
            Ok(certificates) => certificates,
            Err(e) => {
                error!("SCA | Unable to decode response: {e}");
                return;
            }
        };
        if let Err(e) = self.reconcile_secret(&certificates).await {
            error!("SCA | Error when checking the {SECRET_NAME} secret: {e}");
            return;
        }

        info!("SCA | {SECRET_NAME} secret successfully updated");
        self.status.update_status(Summary::healthy(
            Operation::PullingSCACerts,
            "Updated",
            format!("SCA certs successfully updated in the {SECRET_NAME} secret"),
        ));
    }

    fn report_failure(&self, endpoint: &str, e: &InsightsError) {
        let message = format!("Failed to pull SCA certs from {endpoint}: {e}");
        match e.status_code() {
            Some(code) => {
                warn!("SCA | {message}");
                self.status.update_status(
                    Summary::unhealthy(Operation::PullingSCACerts, &status_reason(code), message)
                        .with_status_code(code),
                );
            }
            None => {
                warn!("SCA | {message}");
                self.status.update_status(Summary::healthy(
                    Operation::PullingSCACerts,
                    "NonHTTPError",
                    message,
                ));
            }
        }
    }

    /// Creates the entitlement secret or replaces its data.
    async fn reconcile_secret(&self, certificates: &[ScaCertificate]) -> Result<(), ReconcileError> {
        if certificates.is_empty() {
            return Err(ReconcileError::Empty);
        }
        let data = secret_data(certificates);

        match self.secrets.get_secret(SECRET_NAMESPACE, SECRET_NAME).await {
            Ok(mut secret) => {
                if secret.data == data {
                    return Ok(());
                }
                secret.data = data;
                self.secrets.update_secret(&secret).await?;
            }
            Err(e) if e.is_not_found() => {
                let secret = Secret {
                    metadata: ObjectMeta::named(SECRET_NAMESPACE, SECRET_NAME),
                    data,
                    secret_type: "Opaque".to_string(),
                };
                self.secrets.create_secret(&secret).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

fn decode(bodies: &[(String, bytes::Bytes)]) -> Result<Vec<ScaCertificate>, ReconcileError> {
    let mut certificates = Vec::new();
    for (architecture, body) in bodies {
        let response: ScaResponse = serde_json::from_slice(body)?;
        for mut certificate in response.into_certificates() {
            if certificate.metadata.arch.is_empty() {
                certificate.metadata.arch.clone_from(architecture);
            }
            certificates.push(certificate);
        }
    }
    certificates.sort_by(|a, b| a.metadata.arch.cmp(&b.metadata.arch));
    Ok(certificates)
}

fn secret_data(certificates: &[ScaCertificate]) -> BTreeMap<String, Vec<u8>> {
    let join = |pems: Vec<&str>| -> Vec<u8> {
        let mut joined = String::new();
        for pem in pems {
            joined.push_str(pem.trim_end());
            joined.push('\n');
        }
        joined.into_bytes()
    };
    BTreeMap::from([
        (
            ENTITLEMENT_KEY.to_string(),
            join(certificates.iter().map(|c| c.cert.as_str()).collect()),
        ),
        (
            ENTITLEMENT_PRIVATE_KEY.to_string(),
            join(certificates.iter().map(|c| c.key.as_str()).collect()),
        ),
    ])
}
