// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `INSIGHTS_*` environment variables, e.g. `INSIGHTS_INTERVAL=30m` or
//! `INSIGHTS_STORAGE_PATH=/tmp/insights`.

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
use figment::{providers::Env, Figment};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "INSIGHTS_";

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub storage_path: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub report_endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub processing_status_endpoint: Option<String>,
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
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub cluster_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub image: Option<String>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) {
    merge_option_to_value!(config, env_config, interval);
    if let Some(storage_path) = &env_config.storage_path {
        config.storage_path = PathBuf::from(storage_path);
    }
    merge_string!(config, env_config, endpoint);
    merge_string!(config, env_config, report_endpoint);
    merge_string!(config, env_config, processing_status_endpoint);
    merge_option_to_value!(config, env_config, report_pulling_delay);
    merge_option_to_value!(config, env_config, report_pulling_timeout);
    merge_option_to_value!(config, env_config, report_min_retry_time);
    merge_string!(config, env_config, sca_endpoint);
    merge_option_to_value!(config, env_config, sca_interval);
    merge_option_to_value!(config, env_config, sca_disabled);
    merge_string!(config, env_config, cluster_transfer_endpoint);
    merge_option_to_value!(config, env_config, cluster_transfer_interval);
    merge_option_to_value!(config, env_config, enable_global_obfuscation);
    merge_vec!(config, env_config, gatherers);
    merge_option_to_value!(config, env_config, workers);
    merge_option!(config, env_config, cluster_id);
    merge_option!(config, env_config, image);
}

#[derive(Debug, PartialEq, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
