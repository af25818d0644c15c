// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Discovery of the cluster base domain from the `config/infrastructure.json` and
//! `config/ingress.json` documents.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum BaseDomainError {
    #[error("unable to parse the {document} document: {source}")]
    Parse {
        document: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Infrastructure {
    status: InfrastructureStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InfrastructureStatus {
    #[serde(rename = "apiServerURL")]
    api_server_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Ingress {
    spec: IngressSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IngressSpec {
    domain: String,
}

/// Base domain from `status.apiServerURL` (`https://api.<domain>:6443`).
pub fn from_infrastructure(document: &[u8]) -> Result<Option<String>, BaseDomainError> {
    let infrastructure: Infrastructure =
        serde_json::from_slice(document).map_err(|source| BaseDomainError::Parse {
            document: "infrastructure",
            source,
        })?;
    let url = infrastructure.status.api_server_url.trim();
    if url.is_empty() {
        return Ok(None);
    }
    let host = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    Ok(strip_label(host, "api."))
}

/// Base domain from `spec.domain` (`apps.<domain>`).
pub fn from_ingress(document: &[u8]) -> Result<Option<String>, BaseDomainError> {
    let ingress: Ingress =
        serde_json::from_slice(document).map_err(|source| BaseDomainError::Parse {
            document: "ingress",
            source,
        })?;
    Ok(strip_label(ingress.spec.domain.trim(), "apps."))
}

/// Resolves the base domain, preferring the infrastructure document. Parse errors are returned
/// rather than treated as a missing domain.
pub fn resolve(
    infrastructure: Option<&[u8]>,
    ingress: Option<&[u8]>,
) -> Result<Option<String>, BaseDomainError> {
    if let Some(document) = infrastructure {
        if let Some(domain) = from_infrastructure(document)? {
            return Ok(Some(domain));
        }
    }
    match ingress {
        Some(document) => from_ingress(document),
        None => Ok(None),
    }
}

fn strip_label(host: &str, label: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    Some(host.strip_prefix(label).unwrap_or(host).to_string())
}
