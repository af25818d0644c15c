// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client utilities shared by the upload, report and OCM clients.
//!
//! Clients honor the proxy of the runtime configuration first and the standard proxy variables
//! second. A trusted CA bundle mounted at [`TRUSTED_CA_BUNDLE`] is added to the root store when
//! present.

use crate::config::HttpProxy;
use core::time::Duration;
use std::error::Error;
use std::path::Path;
use tracing::{debug, error};

pub const TRUSTED_CA_BUNDLE: &str = "/var/run/configmaps/trusted-ca-bundle/ca-bundle.crt";
pub const REQUEST_ID_HEADER: &str = "x-rh-insights-request-id";
pub const PRODUCT_NAME: &str = "insights-operator";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Response bodies are logged up to this many bytes.
pub const RESPONSE_BODY_LOG_LIMIT: usize = 1024;

/// Creates a client for `proxy`. An unusable proxy falls back to a direct connection.
#[must_use]
pub fn get_client(proxy: &HttpProxy, timeout: Duration) -> reqwest::Client {
    match build_client(proxy, timeout, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(proxy, timeout, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    proxy: &HttpProxy,
    timeout: Duration,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    for certificate in trusted_ca_bundle(Path::new(TRUSTED_CA_BUNDLE)) {
        client = client.add_root_certificate(certificate);
    }

    if allow_proxy {
        let no_proxy = reqwest::NoProxy::from_string(&proxy.no_proxy);
        if !proxy.https_proxy.is_empty() {
            client = client.proxy(
                reqwest::Proxy::https(proxy.https_proxy.as_str())?.no_proxy(no_proxy.clone()),
            );
        }
        if !proxy.http_proxy.is_empty() {
            client = client
                .proxy(reqwest::Proxy::http(proxy.http_proxy.as_str())?.no_proxy(no_proxy));
        }
    } else {
        client = client.no_proxy();
    }

    Ok(client.build()?)
}

/// Certificates of the CA bundle at `path`. A missing or empty file is ignored.
fn trusted_ca_bundle(path: &Path) -> Vec<reqwest::Certificate> {
    let Some(pem) = std::fs::read(path).ok().filter(|pem| !pem.is_empty()) else {
        return Vec::new();
    };
    match reqwest::Certificate::from_pem_bundle(&pem) {
        Ok(certificates) => certificates,
        Err(e) => {
            error!("Unable to load trusted CA bundle {}: {e}", path.display());
            Vec::new()
        }
    }
}

/// `insights-operator/<version>-<commit> cluster/<cluster-id>`
pub fn user_agent(release_version: Option<&str>, cluster_id: &str) -> String {
    let version = release_version
        .filter(|v| !v.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    let commit = option_env!("SOURCE_GIT_COMMIT").unwrap_or("unknown");
    format!("{PRODUCT_NAME}/{version}-{commit} cluster/{cluster_id}")
}

/// The body text, cut to [`RESPONSE_BODY_LOG_LIMIT`] bytes on a character boundary.
pub fn truncate_body(body: &str) -> &str {
    if body.len() <= RESPONSE_BODY_LOG_LIMIT {
        return body;
    }
    let mut end = RESPONSE_BODY_LOG_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Reads the response body for logging; read errors yield an empty string.
pub async fn response_body_for_log(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => truncate_body(&body).to_string(),
        Err(e) => {
            debug!("Unable to read response body: {e}");
            String::new()
        }
    }
}
