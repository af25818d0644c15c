// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file-based operator configuration (`server.yaml`).
//!
//! ```yaml
//! interval: 2h
//! storagePath: /var/lib/insights-operator
//! endpoint: https://console.redhat.com/api/ingress/v1/upload
//! reportPullingDelay: 60s
//! gatherers:
//!   - clusterconfig/version
//!   - clusterconfig/nodes
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::{
    config::{
        deserialize_option_lossless, deserialize_optional_bool_from_anything,
        deserialize_optional_duration, deserialize_optional_string, deserialize_string_list,
        Config, ConfigError, ConfigSource,
    },
    merge_option, merge_option_to_value, merge_string, merge_vec,
};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfig {
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub storage_path: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub report_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub report_endpoint_tech_preview: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub processing_status_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub conditional_gatherer_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub report_pulling_delay: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub report_pulling_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub report_min_retry_time: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub sca_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub sca_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub sca_disabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub cluster_transfer_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub cluster_transfer_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enable_global_obfuscation: Option<bool>,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub gatherers: Vec<String>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub workers: Option<usize>,
    #[serde(rename = "clusterID", deserialize_with = "deserialize_optional_string")]
    pub cluster_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub release_version: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub image: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub http_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub https_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub no_proxy: Option<String>,
}

fn merge_config(config: &mut Config, yaml_config: &YamlConfig) {
    merge_option_to_value!(config, yaml_config, interval);
    if let Some(storage_path) = &yaml_config.storage_path {
        config.storage_path = PathBuf::from(storage_path);
    }

    // Endpoints
    merge_string!(config, yaml_config, endpoint);
    merge_string!(config, yaml_config, report_endpoint);
    merge_string!(config, yaml_config, report_endpoint_tech_preview);
    merge_string!(config, yaml_config, processing_status_endpoint);
    merge_string!(config, yaml_config, conditional_gatherer_endpoint);

    // Report pulling
    merge_option_to_value!(config, yaml_config, report_pulling_delay);
    merge_option_to_value!(config, yaml_config, report_pulling_timeout);
    merge_option_to_value!(config, yaml_config, report_min_retry_time);

    // SCA and cluster transfer
    merge_string!(config, yaml_config, sca_endpoint);
    merge_option_to_value!(config, yaml_config, sca_interval);
    merge_option_to_value!(config, yaml_config, sca_disabled);
    merge_string!(config, yaml_config, cluster_transfer_endpoint);
    merge_option_to_value!(config, yaml_config, cluster_transfer_interval);

    merge_option_to_value!(config, yaml_config, enable_global_obfuscation);
    merge_vec!(config, yaml_config, gatherers);
    merge_option_to_value!(config, yaml_config, workers);
    merge_option!(config, yaml_config, cluster_id);
    merge_option!(config, yaml_config, release_version);
    merge_option!(config, yaml_config, image);

    // Proxy
    merge_string!(config.proxy, http_proxy, yaml_config, http_proxy);
    merge_string!(config.proxy, https_proxy, yaml_config, https_proxy);
    merge_string!(config.proxy, no_proxy, yaml_config, no_proxy);
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<YamlConfig>() {
            Ok(yaml_config) => merge_config(config, &yaml_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from yaml file: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
