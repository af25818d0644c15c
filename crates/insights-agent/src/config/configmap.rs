// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `openshift-insights/insights-config` config-map.
//!
//! ```yaml
//! dataReporting:
//!   interval: 30m
//!   uploadEndpoint: https://console.redhat.com/api/ingress/v1/upload
//!   obfuscation:
//!     - networking
//! alerting:
//!   disabled: false
//! sca:
//!   interval: 8h
//! clusterTransfer:
//!   interval: 12h
//! proxy:
//!   httpsProxy: http://proxy.example.com:3128
//! ```
//!
//! Unset values never override the legacy configuration.

use crate::cluster::{ConfigMap, ConfigMapStore, INSIGHTS_NAMESPACE};
use crate::config::{
    deserialize_optional_bool_from_anything, deserialize_optional_string, deserialize_string_list,
    parse_duration, ConfigError, InsightsConfiguration, Obfuscation, DEFAULT_CLUSTER_TRANSFER_INTERVAL,
    DEFAULT_INTERVAL, DEFAULT_SCA_INTERVAL,
};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

pub const CONFIG_MAP_NAME: &str = "insights-config";
pub const CONFIG_MAP_KEY: &str = "config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataReportingSection {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub interval: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub upload_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub download_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub download_endpoint_tech_preview: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub storage_path: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub conditional_gatherer_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub processing_status_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub obfuscation: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlertingSection {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScaSection {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub disabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub interval: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterTransferSection {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub interval: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySection {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub http_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub https_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub no_proxy: Option<String>,
}

/// Parsed content of the config-map.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigMapConfig {
    pub data_reporting: DataReportingSection,
    pub alerting: AlertingSection,
    pub sca: ScaSection,
    pub cluster_transfer: ClusterTransferSection,
    pub proxy: ProxySection,
}

impl ConfigMapConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Yaml::string(content))
            .extract::<ConfigMapConfig>()
            .map_err(|e| {
                ConfigError::ParseError(format!("Failed to parse {CONFIG_MAP_NAME} config map: {e}"))
            })
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self, ConfigError> {
        match config_map.data.get(CONFIG_MAP_KEY) {
            Some(content) => Self::from_yaml(content),
            None => Ok(Self::default()),
        }
    }

    /// Overrides `config` with every non-empty, non-zero value. The reporting switch is left
    /// alone.
    pub fn apply(&self, config: &mut InsightsConfiguration) {
        let section = &self.data_reporting;
        let reporting = &mut config.data_reporting;
        if let Some(raw) = &section.interval {
            reporting.interval = parse_interval(raw, DEFAULT_INTERVAL);
        }
        if let Some(endpoint) = &section.upload_endpoint {
            reporting.upload_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &section.download_endpoint {
            reporting.download_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &section.download_endpoint_tech_preview {
            reporting.download_endpoint_tech_preview.clone_from(endpoint);
        }
        if let Some(path) = &section.storage_path {
            reporting.storage_path = PathBuf::from(path);
        }
        if let Some(endpoint) = &section.conditional_gatherer_endpoint {
            reporting.conditional_gatherer_endpoint.clone_from(endpoint);
        }
        if let Some(endpoint) = &section.processing_status_endpoint {
            reporting.processing_status_endpoint.clone_from(endpoint);
        }
        let obfuscation = parse_obfuscation(&section.obfuscation);
        if !obfuscation.is_empty() {
            reporting.obfuscation = obfuscation;
        }

        if self.alerting.disabled == Some(true) {
            config.alerting.disabled = true;
        }

        if self.sca.disabled == Some(true) {
            config.sca.disabled = true;
        }
        if let Some(raw) = &self.sca.interval {
            config.sca.interval = parse_interval(raw, DEFAULT_SCA_INTERVAL);
        }
        if let Some(endpoint) = &self.sca.endpoint {
            config.sca.endpoint.clone_from(endpoint);
        }

        if let Some(raw) = &self.cluster_transfer.interval {
            config.cluster_transfer.interval = parse_interval(raw, DEFAULT_CLUSTER_TRANSFER_INTERVAL);
        }
        if let Some(endpoint) = &self.cluster_transfer.endpoint {
            config.cluster_transfer.endpoint.clone_from(endpoint);
        }

        if let Some(http_proxy) = &self.proxy.http_proxy {
            config.proxy.http_proxy.clone_from(http_proxy);
        }
        if let Some(https_proxy) = &self.proxy.https_proxy {
            config.proxy.https_proxy.clone_from(https_proxy);
        }
        if let Some(no_proxy) = &self.proxy.no_proxy {
            config.proxy.no_proxy.clone_from(no_proxy);
        }
    }
}

/// Parses an interval, falling back to `default` when it is unparsable or zero.
pub fn parse_interval(raw: &str, default: Duration) -> Duration {
    match parse_duration(raw) {
        Ok(Some(interval)) if !interval.is_zero() => interval,
        Ok(_) => {
            error!(
                "Cannot parse interval time duration: {raw} is not positive. Using default value {}",
                humantime::format_duration(default)
            );
            default
        }
        Err(e) => {
            error!(
                "Cannot parse interval time duration: {e}. Using default value {}",
                humantime::format_duration(default)
            );
            default
        }
    }
}

fn parse_obfuscation(values: &[String]) -> Vec<Obfuscation> {
    let mut obfuscation = Vec::new();
    for value in values {
        match Obfuscation::parse(value) {
            Some(o) if !obfuscation.contains(&o) => obfuscation.push(o),
            Some(_) => {}
            None => warn!("Unknown obfuscation value {value:?}, ignoring"),
        }
    }
    obfuscation
}

/// Reads the config-map. A missing config-map is `None`.
pub async fn fetch_config_map(
    store: &dyn ConfigMapStore,
) -> Result<Option<ConfigMapConfig>, ConfigError> {
    match store.get_config_map(INSIGHTS_NAMESPACE, CONFIG_MAP_NAME).await {
        Ok(config_map) => ConfigMapConfig::from_config_map(&config_map).map(Some),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) fn insights_config_map(content: &str) -> ConfigMap {
    ConfigMap {
        metadata: crate::cluster::ObjectMeta::named(INSIGHTS_NAMESPACE, CONFIG_MAP_NAME),
        data: [(CONFIG_MAP_KEY.to_string(), content.to_string())]
            .into_iter()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use duplicate::duplicate_item;

    #[test]
    fn test_parse_full_document() {
        let config = ConfigMapConfig::from_yaml(
            r"
dataReporting:
  interval: 30m
  uploadEndpoint: https://intake.example.com/upload
  downloadEndpoint: https://results.example.com/cluster/%s/reports
  storagePath: /tmp/insights
  obfuscation:
    - networking
    - workload_names
alerting:
  disabled: true
sca:
  disabled: true
  interval: 4h
clusterTransfer:
  interval: 6h
  endpoint: https://ocm.example.com/transfers/
proxy:
  httpsProxy: http://proxy.example.com:3128
",
        )
        .unwrap();

        let mut insights = Config::default().to_insights_configuration();
        config.apply(&mut insights);

        assert_eq!(insights.data_reporting.interval, Duration::from_secs(1800));
        assert_eq!(
            insights.data_reporting.upload_endpoint,
            "https://intake.example.com/upload"
        );
        assert_eq!(
            insights.data_reporting.storage_path,
            PathBuf::from("/tmp/insights")
        );
        assert_eq!(
            insights.data_reporting.obfuscation,
            vec![Obfuscation::Networking, Obfuscation::WorkloadNames]
        );
        assert!(insights.alerting.disabled);
        assert!(insights.sca.disabled);
        assert_eq!(insights.sca.interval, Duration::from_secs(4 * 3600));
        assert_eq!(
            insights.cluster_transfer.interval,
            Duration::from_secs(6 * 3600)
        );
        assert_eq!(insights.proxy.https_proxy, "http://proxy.example.com:3128");
    }

    #[test]
    fn test_single_obfuscation_string_and_unknown_values() {
        let config = ConfigMapConfig::from_yaml(
            r"
dataReporting:
  obfuscation: networking, pod_names
",
        )
        .unwrap();
        assert_eq!(
            parse_obfuscation(&config.data_reporting.obfuscation),
            vec![Obfuscation::Networking]
        );
    }

    #[test]
    fn test_unset_values_do_not_override() {
        let mut insights = Config::default().to_insights_configuration();
        insights.data_reporting.enabled = true;
        insights.data_reporting.interval = Duration::from_secs(3600);
        let before = insights.clone();

        ConfigMapConfig::from_yaml("alerting:\n  disabled: false\n")
            .unwrap()
            .apply(&mut insights);
        assert_eq!(insights, before);
    }

    #[duplicate_item(
        test_name                           raw         default                                 expected;
        [test_interval_negative_is_default] ["-5m"]     [DEFAULT_INTERVAL]                      [DEFAULT_INTERVAL];
        [test_interval_garbage_is_default]  ["weekly"]  [DEFAULT_SCA_INTERVAL]                  [DEFAULT_SCA_INTERVAL];
        [test_interval_zero_is_default]     ["0s"]      [DEFAULT_CLUSTER_TRANSFER_INTERVAL]     [DEFAULT_CLUSTER_TRANSFER_INTERVAL];
        [test_interval_valid]               ["90m"]     [DEFAULT_INTERVAL]                      [Duration::from_secs(5400)];
    )]
    #[test]
    fn test_name() {
        assert_eq!(parse_interval(raw, default), expected);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(matches!(
            ConfigMapConfig::from_yaml("dataReporting: [unclosed"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_config_map_without_key_is_empty() {
        let mut config_map = insights_config_map("");
        config_map.data.clear();
        assert_eq!(
            ConfigMapConfig::from_config_map(&config_map).unwrap(),
            ConfigMapConfig::default()
        );
    }
}
