// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client of the Insights and OCM services.
//!
//! Every request carries the operator user agent. Insights requests authenticate with basic auth
//! when a username is configured and with the pull-secret token otherwise; OCM requests use
//! `AccessToken <cluster-id>:<token>`.

use crate::cluster::{cluster_version_info, ClusterError, ConfigResources};
use crate::config::aggregator::ConfigAggregator;
use crate::config::InsightsConfiguration;
use crate::http::{
    get_client, response_body_for_log, user_agent, DEFAULT_TIMEOUT, REQUEST_ID_HEADER,
};
use crate::metrics::InsightsMetrics;
use bytes::Bytes;
use reqwest::{header, multipart, RequestBuilder, StatusCode};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};

/// Default upload size limit.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const ARCHIVE_CONTENT_TYPE: &str = "application/vnd.redhat.openshift.periodic+tgz";
pub const ARCHIVE_FILE_NAME: &str = "payload.tar.gz";

/// Classification of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Auth,
    ClientBad,
    Transient,
    Fatal,
}

impl Outcome {
    pub fn classify(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=202 => Outcome::Ok,
            401 | 403 => Outcome::Auth,
            400 => Outcome::ClientBad,
            500..=599 => Outcome::Transient,
            _ => Outcome::Fatal,
        }
    }
}

/// An unexpected HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InsightsError {
    #[error("waiting for the cluster version to be loaded")]
    WaitingForVersion,
    /// 401 or 403 from any upstream.
    #[error("{message}")]
    Authorization { status: u16, message: String },
    #[error("{0}")]
    Http(HttpError),
    #[error("archive exceeds the size limit of {0} bytes")]
    TooLong(u64),
    #[error("cluster authorization token is not available")]
    MissingToken,
    /// Connection, DNS or body read failure.
    #[error("{0}")]
    Request(String),
    #[error("unable to read archive {path}: {message}")]
    Archive { path: PathBuf, message: String },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl InsightsError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            InsightsError::Authorization { status, .. } => Some(*status),
            InsightsError::Http(e) => Some(e.status),
            _ => None,
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, InsightsError::Authorization { .. })
    }

    /// Status reason for an authorization error: `Forbidden` for 403, `NotAuthorized` otherwise.
    pub fn authorization_reason(&self) -> &'static str {
        if self.status_code() == Some(403) {
            "Forbidden"
        } else {
            "NotAuthorized"
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// 5xx responses and transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            InsightsError::Request(_) => true,
            InsightsError::Http(e) => e.status >= 500,
            _ => false,
        }
    }
}

/// Archive to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub content_type: String,
    pub path: PathBuf,
}

impl Source {
    pub fn archive(path: &Path) -> Self {
        Self {
            id: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content_type: ARCHIVE_CONTENT_TYPE.to_string(),
            path: path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub request_id: String,
    pub status: u16,
    pub bytes_sent: u64,
}

pub struct InsightsClient {
    resources: Arc<dyn ConfigResources>,
    configurator: Arc<ConfigAggregator>,
    metrics: InsightsMetrics,
    release_version: Option<String>,
    cluster_id: Mutex<Option<String>>,
    max_bytes: u64,
}

impl InsightsClient {
    pub fn new(
        resources: Arc<dyn ConfigResources>,
        configurator: Arc<ConfigAggregator>,
        metrics: InsightsMetrics,
    ) -> Self {
        Self {
            resources,
            configurator,
            metrics,
            release_version: None,
            cluster_id: Mutex::new(None),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    #[must_use]
    pub fn with_release_version(mut self, release_version: Option<String>) -> Self {
        self.release_version = release_version;
        self
    }

    /// Uses a fixed cluster id instead of reading it from the cluster version.
    #[must_use]
    pub fn with_cluster_id(self, cluster_id: Option<String>) -> Self {
        *self.cluster_id.lock().unwrap_or_else(PoisonError::into_inner) = cluster_id;
        self
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn metrics(&self) -> &InsightsMetrics {
        &self.metrics
    }

    /// The cluster id, loaded once from the cluster version document.
    pub async fn cluster_id(&self) -> Result<String, InsightsError> {
        if let Some(id) = self
            .cluster_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(id);
        }
        let id = match cluster_version_info(self.resources.as_ref()).await {
            Ok((Some(id), _)) => id,
            Ok((None, _)) => return Err(InsightsError::WaitingForVersion),
            Err(e) if e.is_not_found() => return Err(InsightsError::WaitingForVersion),
            Err(e) => return Err(e.into()),
        };
        *self.cluster_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        Ok(id)
    }

    fn http(&self, config: &InsightsConfiguration) -> reqwest::Client {
        get_client(&config.proxy, DEFAULT_TIMEOUT)
    }

    fn prepare(
        &self,
        builder: RequestBuilder,
        config: &InsightsConfiguration,
        cluster_id: &str,
    ) -> Result<RequestBuilder, InsightsError> {
        let builder = builder.header(
            header::USER_AGENT,
            user_agent(self.release_version.as_deref(), cluster_id),
        );
        let credentials = &config.credentials;
        if !credentials.username.is_empty() || !credentials.password.is_empty() {
            return Ok(builder.basic_auth(&credentials.username, Some(&credentials.password)));
        }
        if credentials.token.is_empty() {
            return Err(InsightsError::MissingToken);
        }
        Ok(builder.bearer_auth(&credentials.token))
    }

    fn prepare_ocm(
        &self,
        builder: RequestBuilder,
        config: &InsightsConfiguration,
        cluster_id: &str,
    ) -> Result<RequestBuilder, InsightsError> {
        let token = &config.credentials.token;
        if token.is_empty() {
            return Err(InsightsError::MissingToken);
        }
        Ok(builder
            .header(
                header::USER_AGENT,
                user_agent(self.release_version.as_deref(), cluster_id),
            )
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("AccessToken {cluster_id}:{token}"),
            ))
    }

    /// Uploads an archive to the ingress service.
    pub async fn send(&self, endpoint: &str, source: &Source) -> Result<UploadResponse, InsightsError> {
        let cluster_id = self.cluster_id().await?;
        let config = self.configurator.config();
        let body = read_limited(&source.path, self.max_bytes).await?;
        let bytes_sent = body.len() as u64;

        let part = multipart::Part::bytes(body)
            .file_name(ARCHIVE_FILE_NAME)
            .mime_str(&source.content_type)
            .map_err(|e| InsightsError::Request(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let request = self.prepare(self.http(&config).post(endpoint), &config, &cluster_id)?;
        debug!("Uploading {} to {endpoint}", source.content_type);
        let response = match request.multipart(form).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Unable to build a request, possible invalid token: {e}");
                self.metrics.increment_request_send(0);
                return Err(InsightsError::Request(format!(
                    "unable to build request to connect to Insights server: {e}"
                )));
            }
        };

        let status = response.status();
        let request_id = request_id(&response);
        self.metrics.increment_request_send(status.as_u16());

        match Outcome::classify(status) {
            Outcome::Ok => {
                if !request_id.is_empty() {
                    debug!(
                        "Successfully reported id={} {REQUEST_ID_HEADER}={request_id}, wrote={bytes_sent}",
                        source.id
                    );
                }
                Ok(UploadResponse {
                    request_id,
                    status: status.as_u16(),
                    bytes_sent,
                })
            }
            Outcome::Auth => {
                debug!(
                    "gateway server {endpoint} returned {}, {REQUEST_ID_HEADER}={request_id}",
                    status.as_u16()
                );
                Err(authorization_error(status, response_body_for_log(response).await))
            }
            Outcome::ClientBad => Err(InsightsError::Http(HttpError {
                status: status.as_u16(),
                message: format!(
                    "gateway server bad request: {endpoint} (request={request_id}): {}",
                    response_body_for_log(response).await
                ),
            })),
            Outcome::Transient | Outcome::Fatal => Err(InsightsError::Http(HttpError {
                status: status.as_u16(),
                message: format!(
                    "gateway server reported unexpected error code: {} (request={request_id}): {}",
                    status.as_u16(),
                    response_body_for_log(response).await
                ),
            })),
        }
    }

    /// Downloads the latest analysis report. `endpoint` carries a `%s` for the cluster id.
    pub async fn recv_report(&self, endpoint: &str) -> Result<Bytes, InsightsError> {
        let cluster_id = self.cluster_id().await?;
        let config = self.configurator.config();
        let endpoint = endpoint.replacen("%s", &cluster_id, 1);
        info!("Retrieving report for cluster: {cluster_id}");
        debug!("Endpoint: {endpoint}");

        let request = self.prepare(self.http(&config).get(&endpoint), &config, &cluster_id)?;
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Unable to retrieve latest report for {cluster_id}: {e}");
                self.metrics.increment_recv_report(0);
                return Err(InsightsError::Request(e.to_string()));
            }
        };

        let status = response.status();
        let request_id = request_id(&response);
        if status != StatusCode::OK {
            self.metrics.increment_recv_report(status.as_u16());
        }
        match status.as_u16() {
            200 => response
                .bytes()
                .await
                .map_err(|e| InsightsError::Request(e.to_string())),
            401 | 403 => {
                debug!(
                    "gateway server {endpoint} returned {}, {REQUEST_ID_HEADER}={request_id}",
                    status.as_u16()
                );
                Err(authorization_error(status, String::new()))
            }
            400 => Err(InsightsError::Http(HttpError {
                status: 400,
                message: format!(
                    "gateway server bad request: {endpoint} (request={request_id}): {}",
                    response_body_for_log(response).await
                ),
            })),
            404 => Err(InsightsError::Http(HttpError {
                status: 404,
                message: format!(
                    "not found: {endpoint} (request={request_id}): {}",
                    response_body_for_log(response).await
                ),
            })),
            code => Err(InsightsError::Http(HttpError {
                status: code,
                message: format!(
                    "gateway server reported unexpected error code: {code} (request={request_id}): {}",
                    response_body_for_log(response).await
                ),
            })),
        }
    }

    /// GET on an endpoint with `%s` placeholders for the cluster id (when `include_cluster_id`)
    /// and `param`. The response is returned whatever its status.
    pub async fn get_with_path_param(
        &self,
        endpoint: &str,
        param: &str,
        include_cluster_id: bool,
    ) -> Result<reqwest::Response, InsightsError> {
        let cluster_id = self.cluster_id().await?;
        let config = self.configurator.config();
        let mut endpoint = endpoint.to_string();
        if include_cluster_id {
            endpoint = endpoint.replacen("%s", &cluster_id, 1);
        }
        let endpoint = endpoint.replacen("%s", param, 1);
        debug!("Making HTTP GET request to {endpoint}");

        let request = self.prepare(self.http(&config).get(&endpoint), &config, &cluster_id)?;
        request
            .send()
            .await
            .map_err(|e| InsightsError::Request(e.to_string()))
    }

    /// Requests the entitlement certificates of one architecture.
    pub async fn recv_sca_certs(&self, endpoint: &str, architecture: &str) -> Result<Bytes, InsightsError> {
        let cluster_id = self.cluster_id().await?;
        let config = self.configurator.config();
        let payload = serde_json::json!({"type": "sca", "arch": architecture});
        let request = self.prepare_ocm(self.http(&config).post(endpoint), &config, &cluster_id)?;
        let response = request.json(&payload).send().await.map_err(|e| {
            InsightsError::Request(format!(
                "unable to retrieve SCA certs data from {endpoint}: {e}"
            ))
        })?;
        ocm_body(endpoint, response).await
    }

    /// Lists the accepted cluster transfers of this cluster.
    pub async fn recv_cluster_transfer(&self, endpoint: &str) -> Result<Bytes, InsightsError> {
        let cluster_id = self.cluster_id().await?;
        let config = self.configurator.config();
        let search = format!("cluster_uuid is '{cluster_id}' and status is 'accepted'");
        let request = self.prepare_ocm(
            self.http(&config).get(endpoint).query(&[("search", search)]),
            &config,
            &cluster_id,
        )?;
        let response = request.send().await.map_err(|e| {
            InsightsError::Request(format!(
                "unable to retrieve cluster transfer data from {endpoint}: {e}"
            ))
        })?;
        ocm_body(endpoint, response).await
    }
}

fn request_id(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn authorization_error(status: StatusCode, body: String) -> InsightsError {
    let message = if status == StatusCode::UNAUTHORIZED {
        let mut message = "your Red Hat account is not enabled for remote support or your token has expired".to_string();
        if !body.is_empty() {
            message.push_str(": ");
            message.push_str(&body);
        }
        message
    } else {
        "your Red Hat account is not enabled for remote support".to_string()
    };
    InsightsError::Authorization {
        status: status.as_u16(),
        message,
    }
}

async fn ocm_body(endpoint: &str, response: reqwest::Response) -> Result<Bytes, InsightsError> {
    let status = response.status();
    if status.is_success() {
        return response
            .bytes()
            .await
            .map_err(|e| InsightsError::Request(e.to_string()));
    }
    let message = format!(
        "OCM API {endpoint} returned HTTP {}: {}",
        status.as_u16(),
        response_body_for_log(response).await
    );
    if matches!(status.as_u16(), 401 | 403) {
        return Err(InsightsError::Authorization {
            status: status.as_u16(),
            message,
        });
    }
    Err(InsightsError::Http(HttpError {
        status: status.as_u16(),
        message,
    }))
}

/// Reads at most `max_bytes` of `path`; a longer file is [`InsightsError::TooLong`].
async fn read_limited(path: &Path, max_bytes: u64) -> Result<Vec<u8>, InsightsError> {
    let archive_error = |e: std::io::Error| InsightsError::Archive {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let file = tokio::fs::File::open(path).await.map_err(archive_error)?;
    let mut body = Vec::new();
    file.take(max_bytes + 1)
        .read_to_end(&mut body)
        .await
        .map_err(archive_error)?;
    if body.len() as u64 > max_bytes {
        return Err(InsightsError::TooLong(max_bytes));
    }
    Ok(body)
}
