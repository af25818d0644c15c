// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Legacy configuration from the `openshift-config/support` secret and the upload token from
//! the cluster pull-secret.

use crate::cluster::{ClusterError, Secret, SecretStore, OPENSHIFT_CONFIG_NAMESPACE};
use crate::config::{parse_duration, ConfigError, InsightsConfiguration, Obfuscation};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const SUPPORT_SECRET_NAME: &str = "support";
pub const PULL_SECRET_NAME: &str = "pull-secret";
pub const PULL_SECRET_KEY: &str = ".dockerconfigjson";
pub const CLOUD_OPENSHIFT_AUTH: &str = "cloud.openshift.com";

/// Shortest accepted gathering interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Values present in the support secret. `None` means the key was absent or empty.
#[derive(Clone, Default, PartialEq)]
pub struct LegacyConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub endpoint: Option<String>,
    pub conditional_gatherer_endpoint: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub report_endpoint: Option<String>,
    pub report_endpoint_tech_preview: Option<String>,
    pub processing_status_endpoint: Option<String>,
    pub interval: Option<Duration>,
    /// Set when `interval` is present but unusable. Reporting is switched off.
    pub interval_error: Option<ConfigError>,
    pub report_pulling_delay: Option<Duration>,
    pub report_pulling_timeout: Option<Duration>,
    pub report_min_retry_time: Option<Duration>,
    pub enable_global_obfuscation: bool,
    pub disable_insights_alerts: bool,
    pub sca_endpoint: Option<String>,
    pub sca_interval: Option<Duration>,
    pub sca_disabled: bool,
    pub cluster_transfer_endpoint: Option<String>,
    pub cluster_transfer_interval: Option<Duration>,
}

impl std::fmt::Debug for LegacyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("report_endpoint", &self.report_endpoint)
            .field("interval", &self.interval)
            .field("interval_error", &self.interval_error)
            .field("enable_global_obfuscation", &self.enable_global_obfuscation)
            .finish_non_exhaustive()
    }
}

impl LegacyConfig {
    pub fn from_secret(secret: &Secret) -> Self {
        let value = |key: &str| {
            secret
                .string(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| {
            value(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
        };

        let mut config = LegacyConfig {
            username: value("username"),
            password: value("password"),
            endpoint: value("endpoint"),
            conditional_gatherer_endpoint: value("conditionalGathererEndpoint"),
            http_proxy: value("httpProxy"),
            https_proxy: value("httpsProxy"),
            no_proxy: value("noProxy"),
            report_endpoint: value("reportEndpoint"),
            report_endpoint_tech_preview: value("reportEndpointTechPreview"),
            processing_status_endpoint: value("processingStatusEndpoint"),
            enable_global_obfuscation: flag("enableGlobalObfuscation"),
            disable_insights_alerts: flag("disableInsightsAlerts"),
            sca_endpoint: value("scaEndpoint"),
            sca_disabled: flag("scaPullDisabled"),
            cluster_transfer_endpoint: value("clusterTransferEndpoint"),
            ..LegacyConfig::default()
        };

        config.report_pulling_delay = lenient_duration(value("reportPullingDelay"), "reportPullingDelay");
        config.report_pulling_timeout =
            lenient_duration(value("reportPullingTimeout"), "reportPullingTimeout");
        config.report_min_retry_time =
            lenient_duration(value("reportMinRetryTime"), "reportMinRetryTime");
        config.sca_interval = lenient_duration(value("scaInterval"), "scaInterval");
        config.cluster_transfer_interval =
            lenient_duration(value("clusterTransferInterval"), "clusterTransferInterval");

        if let Some(raw) = value("interval") {
            match parse_interval(&raw) {
                Ok(interval) => config.interval = Some(interval),
                Err(e) => config.interval_error = Some(e),
            }
        }

        config
    }

    /// Overlays the present values onto `config`.
    pub fn apply(&self, config: &mut InsightsConfiguration) {
        let reporting = &mut config.data_reporting;
        if let Some(endpoint) = &self.endpoint {
            reporting.upload_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &self.report_endpoint {
            reporting.download_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &self.report_endpoint_tech_preview {
            reporting.download_endpoint_tech_preview.clone_from(endpoint);
        }
        if let Some(endpoint) = &self.processing_status_endpoint {
            reporting.processing_status_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &self.conditional_gatherer_endpoint {
            reporting.conditional_gatherer_endpoint.clone_from(endpoint);
        }
        if let Some(interval) = self.interval {
            reporting.interval = interval;
        }
        if let Some(delay) = self.report_pulling_delay {
            reporting.report_pulling_delay = delay;
        }
        if let Some(timeout) = self.report_pulling_timeout {
            reporting.report_pulling_timeout = timeout;
        }
        if let Some(retry) = self.report_min_retry_time {
            reporting.report_min_retry_time = retry;
        }
        if self.enable_global_obfuscation && !reporting.obfuscation.contains(&Obfuscation::Networking)
        {
            reporting.obfuscation.push(Obfuscation::Networking);
        }

        if self.disable_insights_alerts {
            config.alerting.disabled = true;
        }

        if let Some(endpoint) = &self.sca_endpoint {
            config.sca.endpoint.clone_from(endpoint);
        }
        if let Some(interval) = self.sca_interval {
            config.sca.interval = interval;
        }
        if self.sca_disabled {
            config.sca.disabled = true;
        }
        if let Some(endpoint) = &self.cluster_transfer_endpoint {
            config.cluster_transfer.endpoint.clone_from(endpoint);
        }
        if let Some(interval) = self.cluster_transfer_interval {
            config.cluster_transfer.interval = interval;
        }

        if let Some(http_proxy) = &self.http_proxy {
            config.proxy.http_proxy.clone_from(http_proxy);
        }
        if let Some(https_proxy) = &self.https_proxy {
            config.proxy.https_proxy.clone_from(https_proxy);
        }
        if let Some(no_proxy) = &self.no_proxy {
            config.proxy.no_proxy.clone_from(no_proxy);
        }

        if let Some(username) = &self.username {
            config.credentials.username.clone_from(username);
        }
        if let Some(password) = &self.password {
            config.credentials.password.clone_from(password);
        }
    }
}

/// Parses the gathering interval, which must be at least [`MIN_INTERVAL`].
pub fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    match parse_duration(raw) {
        Ok(Some(interval)) if interval >= MIN_INTERVAL => Ok(interval),
        Ok(Some(_)) => Err(ConfigError::InvalidInterval("too short".to_string())),
        Ok(None) => Err(ConfigError::InvalidInterval("empty".to_string())),
        Err(e) => Err(ConfigError::InvalidInterval(e.to_string())),
    }
}

fn lenient_duration(raw: Option<String>, key: &str) -> Option<Duration> {
    let raw = raw?;
    match parse_duration(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("{key} secret contains an invalid value ({raw}). Using previous value: {e}");
            None
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PullSecret {
    #[serde(default)]
    auths: HashMap<String, PullSecretAuth>,
}

#[derive(Debug, Deserialize, Default)]
struct PullSecretAuth {
    #[serde(default)]
    auth: String,
}

/// The `cloud.openshift.com` token of the pull-secret, if any.
pub fn token_from_pull_secret(secret: &Secret) -> Result<Option<String>, ConfigError> {
    let Some(data) = secret.data.get(PULL_SECRET_KEY).filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    let pull_secret: PullSecret = serde_json::from_slice(data).unwrap_or_else(|e| {
        error!("Unable to unmarshal cluster pull-secret: {e}");
        PullSecret::default()
    });
    let Some(auth) = pull_secret.auths.get(CLOUD_OPENSHIFT_AUTH) else {
        return Ok(None);
    };
    let token = auth.auth.trim();
    if token.contains('\n') || token.contains('\r') {
        return Err(ConfigError::InvalidToken);
    }
    if token.is_empty() {
        return Ok(None);
    }
    debug!("Found {CLOUD_OPENSHIFT_AUTH} token");
    Ok(Some(token.to_string()))
}

/// Reads a secret from `openshift-config`. A missing secret is `None`.
pub async fn fetch_secret(
    store: &dyn SecretStore,
    name: &str,
) -> Result<Option<Secret>, ClusterError> {
    match store.get_secret(OPENSHIFT_CONFIG_NAMESPACE, name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(e) if e.is_not_found() => {
            debug!("{name} secret does not exist");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) fn support_secret(entries: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: crate::cluster::ObjectMeta::named(OPENSHIFT_CONFIG_NAMESPACE, SUPPORT_SECRET_NAME),
        data: entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect(),
        secret_type: "Opaque".to_string(),
    }
}

#[cfg(test)]
pub(crate) fn pull_secret(token: &str) -> Secret {
    let json = serde_json::json!({
        "auths": {
            CLOUD_OPENSHIFT_AUTH: {"auth": token, "email": "ops@example.com"},
            "quay.io": {"auth": "cXVheQ==", "email": "ops@example.com"},
        }
    });
    Secret {
        metadata: crate::cluster::ObjectMeta::named(OPENSHIFT_CONFIG_NAMESPACE, PULL_SECRET_NAME),
        data: [(
            PULL_SECRET_KEY.to_string(),
            serde_json::to_vec(&json).unwrap_or_default(),
        )]
        .into_iter()
        .collect(),
        secret_type: "kubernetes.io/dockerconfigjson".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::config::Config;
    use duplicate::duplicate_item;

    #[test]
    fn test_from_secret_reads_all_keys() {
        let secret = support_secret(&[
            ("username", " user \n"),
            ("password", "pass"),
            ("endpoint", "https://intake.example.com"),
            ("reportEndpoint", "https://results.example.com/%s"),
            ("interval", "30m"),
            ("reportPullingDelay", "2m"),
            ("enableGlobalObfuscation", "TRUE"),
            ("disableInsightsAlerts", "true"),
            ("scaPullDisabled", "false"),
            ("clusterTransferInterval", "24h"),
            ("httpsProxy", "http://proxy:3128"),
        ]);
        let config = LegacyConfig::from_secret(&secret);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.interval, Some(Duration::from_secs(1800)));
        assert_eq!(config.report_pulling_delay, Some(Duration::from_secs(120)));
        assert!(config.enable_global_obfuscation);
        assert!(config.disable_insights_alerts);
        assert!(!config.sca_disabled);
        assert_eq!(
            config.cluster_transfer_interval,
            Some(Duration::from_secs(24 * 3600))
        );
        assert!(config.interval_error.is_none());
    }

    #[duplicate_item(
        test_name                   raw;
        [test_interval_too_short]   ["5s"];
        [test_interval_not_a_value] ["often"];
    )]
    #[test]
    fn test_name() {
        let config = LegacyConfig::from_secret(&support_secret(&[("interval", raw)]));
        assert!(config.interval.is_none());
        let error = config.interval_error.expect("interval must be rejected");
        assert!(error.to_string().starts_with(
            "insights secret interval must be a duration (1h, 10m) greater than or equal to ten seconds"
        ));
    }

    #[test]
    fn test_invalid_pulling_delay_keeps_previous_value() {
        let config =
            LegacyConfig::from_secret(&support_secret(&[("reportPullingDelay", "later")]));
        assert!(config.report_pulling_delay.is_none());

        let mut insights = Config::default().to_insights_configuration();
        config.apply(&mut insights);
        assert_eq!(
            insights.data_reporting.report_pulling_delay,
            crate::config::DEFAULT_REPORT_PULLING_DELAY
        );
    }

    #[test]
    fn test_apply_overrides_present_values_only() {
        let mut insights = Config::default().to_insights_configuration();
        let config = LegacyConfig::from_secret(&support_secret(&[
            ("endpoint", "https://intake.example.com"),
            ("interval", "1h"),
            ("enableGlobalObfuscation", "true"),
        ]));
        config.apply(&mut insights);
        assert_eq!(
            insights.data_reporting.upload_endpoint,
            "https://intake.example.com"
        );
        assert_eq!(insights.data_reporting.interval, Duration::from_secs(3600));
        assert_eq!(
            insights.data_reporting.download_endpoint,
            crate::config::DEFAULT_REPORT_ENDPOINT
        );
        assert!(insights.is_networking_obfuscated());
    }

    #[test]
    fn test_token_from_pull_secret() {
        assert_eq!(
            token_from_pull_secret(&pull_secret("  dG9rZW4=  ")).unwrap(),
            Some("dG9rZW4=".to_string())
        );
        assert_eq!(token_from_pull_secret(&pull_secret("")).unwrap(), None);
        assert_eq!(
            token_from_pull_secret(&pull_secret("abc\ndef")),
            Err(ConfigError::InvalidToken)
        );
    }

    #[test]
    fn test_token_from_corrupted_pull_secret() {
        let mut secret = pull_secret("ignored");
        secret
            .data
            .insert(PULL_SECRET_KEY.to_string(), b"{not json".to_vec());
        assert_eq!(token_from_pull_secret(&secret).unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_missing_secret_is_none() {
        let cluster = MemoryCluster::new();
        assert!(fetch_secret(&cluster, SUPPORT_SECRET_NAME)
            .await
            .unwrap()
            .is_none());

        cluster.insert_secret(support_secret(&[("username", "user")]));
        let secret = fetch_secret(&cluster, SUPPORT_SECRET_NAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.string("username").as_deref(), Some("user"));
    }
}
