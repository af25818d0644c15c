// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Two layers of configuration exist:
//!
//! - The operator [`Config`], read once at startup by the binary. Sources are applied in order,
//!   later sources override earlier ones:
//!   1. **Defaults** - hard-coded below
//!   2. **YAML file** - `--config` (default `/etc/insights-operator/server.yaml`)
//!   3. **Environment variables** - `INSIGHTS_*`, plus the standard proxy variables
//! - The runtime [`InsightsConfiguration`], derived from the operator config and then kept up to
//!   date from the cluster by the [`aggregator::ConfigAggregator`]: the legacy `support` secret,
//!   the pull-secret token and the `insights-config` config-map.
//!
//! ## Edge Cases and Behaviors
//!
//! - Durations are humantime strings (`1h`, `30m`, `1h30m`, `90s`). Unparsable values are logged
//!   and ignored.
//! - Empty strings after trimming are treated as unset.
//! - `workers = 0` falls back to the default worker count.

pub mod aggregator;
pub mod configmap;
pub mod env;
pub mod observer;
pub mod secret;
pub mod yaml;

use crate::cluster::ClusterError;
use crate::gather::{ALL_GATHERERS, DEFAULT_WORKERS};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::{env::EnvConfigSource, yaml::YamlConfigSource};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/insights-operator/server.yaml";
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/insights-operator";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_SCA_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);
pub const DEFAULT_CLUSTER_TRANSFER_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_REPORT_PULLING_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_PULLING_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REPORT_MIN_RETRY_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_UPLOAD_ENDPOINT: &str = "https://console.redhat.com/api/ingress/v1/upload";
pub const DEFAULT_REPORT_ENDPOINT: &str =
    "https://console.redhat.com/api/insights-results-aggregator/v2/cluster/%s/reports";
pub const DEFAULT_PROCESSING_STATUS_ENDPOINT: &str =
    "https://console.redhat.com/api/insights-results-aggregator/v2/cluster/%s/request/%s/status";
pub const DEFAULT_SCA_ENDPOINT: &str = "https://api.openshift.com/api/accounts_mgmt/v1/certificates";
pub const DEFAULT_CLUSTER_TRANSFER_ENDPOINT: &str =
    "https://api.openshift.com/api/accounts_mgmt/v1/cluster_transfers/";

/// Helper macro to merge `Option<String>` fields into `String` fields.
#[macro_export]
macro_rules! merge_string {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field.clone_from(value);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field.clone_from(value);
        }
    };
}

/// Helper macro to merge `Option<T>` fields where T implements Clone.
#[macro_export]
macro_rules! merge_option {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if $source.$source_field.is_some() {
            $config.$config_field.clone_from(&$source.$source_field);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

/// Helper macro to merge `Option<T>` fields to T fields when `Option<T>` is Some.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Helper macro to merge `Vec` fields when `Vec` is not empty.
#[macro_export]
macro_rules! merge_vec {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if !$source.$source_field.is_empty() {
            $config.$config_field.clone_from(&$source.$source_field);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if !$source.$field.is_empty() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("{0}")]
    ParseError(String),
    #[error(
        "insights secret interval must be a duration (1h, 10m) greater than or equal to ten seconds: {0}"
    )]
    InvalidInterval(String),
    #[error("cluster authorization token is not valid: contains newlines")]
    InvalidToken,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            match source.load(&mut self.config) {
                Ok(()) => (),
                Err(e) => {
                    error!("Failed to load config: {e}");
                    failed_sources += 1;
                }
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        // Standard proxy variables fill what the sources left unset
        if self.config.proxy.http_proxy.is_empty() {
            if let Ok(http_proxy) = std::env::var("HTTP_PROXY") {
                self.config.proxy.http_proxy = http_proxy;
            }
        }
        if self.config.proxy.https_proxy.is_empty() {
            if let Ok(https_proxy) = std::env::var("HTTPS_PROXY") {
                self.config.proxy.https_proxy = https_proxy;
            }
        }
        if self.config.proxy.no_proxy.is_empty() {
            if let Ok(no_proxy) = std::env::var("NO_PROXY") {
                self.config.proxy.no_proxy = no_proxy;
            }
        }
        if self.config.release_version.is_none() {
            self.config.release_version = std::env::var("RELEASE_VERSION")
                .ok()
                .filter(|v| !v.trim().is_empty());
        }
        if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
            if !namespace.trim().is_empty() {
                self.config.namespace = namespace;
            }
        }

        if self.config.workers == 0 {
            self.config.workers = DEFAULT_WORKERS;
        }
        if self.config.gatherers.is_empty() {
            self.config.gatherers = vec![ALL_GATHERERS.to_string()];
        }

        self.config.clone()
    }
}

/// Loads the operator configuration: defaults, then the YAML file at `path`, then the
/// environment.
#[must_use]
pub fn get_config(path: &Path) -> Config {
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource {
            path: path.to_path_buf(),
        }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

/// Proxy settings. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpProxy {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl HttpProxy {
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_empty() && self.https_proxy.is_empty() && self.no_proxy.is_empty()
    }
}

/// Operator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub interval: Duration,
    pub storage_path: PathBuf,
    pub endpoint: String,
    pub report_endpoint: String,
    pub report_endpoint_tech_preview: String,
    pub processing_status_endpoint: String,
    pub conditional_gatherer_endpoint: String,
    pub report_pulling_delay: Duration,
    pub report_pulling_timeout: Duration,
    pub report_min_retry_time: Duration,
    pub sca_endpoint: String,
    pub sca_interval: Duration,
    pub sca_disabled: bool,
    pub cluster_transfer_endpoint: String,
    pub cluster_transfer_interval: Duration,
    pub enable_global_obfuscation: bool,
    /// Enabled gathering functions, `gatherer/function` or `ALL`.
    pub gatherers: Vec<String>,
    pub workers: usize,
    pub cluster_id: Option<String>,
    pub release_version: Option<String>,
    /// Image of the on-demand gathering job.
    pub image: Option<String>,
    pub namespace: String,
    pub proxy: HttpProxy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            endpoint: DEFAULT_UPLOAD_ENDPOINT.to_string(),
            report_endpoint: DEFAULT_REPORT_ENDPOINT.to_string(),
            report_endpoint_tech_preview: String::new(),
            processing_status_endpoint: DEFAULT_PROCESSING_STATUS_ENDPOINT.to_string(),
            conditional_gatherer_endpoint: String::new(),
            report_pulling_delay: DEFAULT_REPORT_PULLING_DELAY,
            report_pulling_timeout: DEFAULT_REPORT_PULLING_TIMEOUT,
            report_min_retry_time: DEFAULT_REPORT_MIN_RETRY_TIME,
            sca_endpoint: DEFAULT_SCA_ENDPOINT.to_string(),
            sca_interval: DEFAULT_SCA_INTERVAL,
            sca_disabled: false,
            cluster_transfer_endpoint: DEFAULT_CLUSTER_TRANSFER_ENDPOINT.to_string(),
            cluster_transfer_interval: DEFAULT_CLUSTER_TRANSFER_INTERVAL,
            enable_global_obfuscation: false,
            gatherers: vec![ALL_GATHERERS.to_string()],
            workers: DEFAULT_WORKERS,
            cluster_id: None,
            release_version: None,
            image: None,
            namespace: crate::cluster::INSIGHTS_NAMESPACE.to_string(),
            proxy: HttpProxy::default(),
        }
    }
}

impl Config {
    /// Runtime configuration before anything was read from the cluster.
    pub fn to_insights_configuration(&self) -> InsightsConfiguration {
        let mut obfuscation = Vec::new();
        if self.enable_global_obfuscation {
            obfuscation.push(Obfuscation::Networking);
        }
        InsightsConfiguration {
            data_reporting: DataReporting {
                enabled: !self.endpoint.is_empty(),
                interval: self.interval,
                upload_endpoint: self.endpoint.clone(),
                download_endpoint: self.report_endpoint.clone(),
                download_endpoint_tech_preview: self.report_endpoint_tech_preview.clone(),
                storage_path: self.storage_path.clone(),
                conditional_gatherer_endpoint: self.conditional_gatherer_endpoint.clone(),
                processing_status_endpoint: self.processing_status_endpoint.clone(),
                report_pulling_delay: self.report_pulling_delay,
                report_pulling_timeout: self.report_pulling_timeout,
                report_min_retry_time: self.report_min_retry_time,
                obfuscation,
            },
            alerting: Alerting::default(),
            sca: Sca {
                disabled: self.sca_disabled,
                interval: self.sca_interval,
                endpoint: self.sca_endpoint.clone(),
            },
            cluster_transfer: ClusterTransfer {
                interval: self.cluster_transfer_interval,
                endpoint: self.cluster_transfer_endpoint.clone(),
            },
            proxy: self.proxy.clone(),
            credentials: Credentials::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Obfuscation {
    Networking,
    WorkloadNames,
}

impl Obfuscation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "networking" => Some(Obfuscation::Networking),
            "workload_names" => Some(Obfuscation::WorkloadNames),
            _ => None,
        }
    }
}

impl fmt::Display for Obfuscation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obfuscation::Networking => f.write_str("networking"),
            Obfuscation::WorkloadNames => f.write_str("workload_names"),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &(!self.password.is_empty()))
            .field("token", &(!self.token.is_empty()))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataReporting {
    /// Reporting (upload) enabled. Only the legacy sources decide this.
    pub enabled: bool,
    pub interval: Duration,
    pub upload_endpoint: String,
    pub download_endpoint: String,
    pub download_endpoint_tech_preview: String,
    pub storage_path: PathBuf,
    pub conditional_gatherer_endpoint: String,
    pub processing_status_endpoint: String,
    pub report_pulling_delay: Duration,
    pub report_pulling_timeout: Duration,
    pub report_min_retry_time: Duration,
    pub obfuscation: Vec<Obfuscation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alerting {
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sca {
    pub disabled: bool,
    pub interval: Duration,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTransfer {
    pub interval: Duration,
    pub endpoint: String,
}

/// Runtime configuration handed out by value to every subsystem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsightsConfiguration {
    pub data_reporting: DataReporting,
    pub alerting: Alerting,
    pub sca: Sca,
    pub cluster_transfer: ClusterTransfer,
    pub proxy: HttpProxy,
    pub credentials: Credentials,
}

impl InsightsConfiguration {
    pub fn is_networking_obfuscated(&self) -> bool {
        self.data_reporting
            .obfuscation
            .contains(&Obfuscation::Networking)
    }
}

impl fmt::Display for InsightsConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let obfuscation: Vec<String> = self
            .data_reporting
            .obfuscation
            .iter()
            .map(ToString::to_string)
            .collect();
        write!(
            f,
            "enabled={}, upload_interval={}, upload_endpoint={}, storage_path={}, download_endpoint={}, obfuscation={:?}",
            self.data_reporting.enabled,
            humantime::format_duration(self.data_reporting.interval),
            self.data_reporting.upload_endpoint,
            self.data_reporting.storage_path.display(),
            self.data_reporting.download_endpoint,
            obfuscation,
        )
    }
}

/// Parses a humantime duration, `None` for empty input.
pub fn parse_duration(value: &str) -> Result<Option<Duration>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| ConfigError::ParseError(format!("invalid duration {value:?}: {e}")))
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Null => Ok(None),
        other => {
            error!(
                "Failed to parse value, expected a string, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {}, ignoring", e);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_aux::field_attributes::deserialize_bool_from_anything(deserializer) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            error!("Failed to parse bool: {}, ignoring", e);
            Ok(None)
        }
    }
}

/// Humantime string (`90s`, `1h30m`) or a number of seconds.
pub fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => match parse_duration(&s) {
            Ok(d) => Ok(d),
            Err(e) => {
                error!("Failed to parse duration: {e}, ignoring");
                Ok(None)
            }
        },
        Value::Number(n) => match n.as_u64() {
            Some(secs) => Ok(Some(Duration::from_secs(secs))),
            None => {
                error!("Failed to parse duration: {n} is not a positive number of seconds, ignoring");
                Ok(None)
            }
        },
        Value::Null => Ok(None),
        other => {
            error!("Failed to parse duration, got: {other}, ignoring");
            Ok(None)
        }
    }
}

/// A list of strings, or a single comma separated string.
pub fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let list = match Value::deserialize(deserializer)? {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(values) => values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                other => {
                    error!("Failed to parse list item, expected a string, got: {other}, ignoring");
                    None
                }
            })
            .collect(),
        Value::Null => Vec::new(),
        other => {
            error!("Failed to parse list, got: {other}, ignoring");
            Vec::new()
        }
    };
    Ok(list
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = get_config(Path::new("missing.yaml"));
            assert_eq!(config.interval, Duration::from_secs(7200));
            assert_eq!(config.storage_path, PathBuf::from(DEFAULT_STORAGE_PATH));
            assert_eq!(config.endpoint, DEFAULT_UPLOAD_ENDPOINT);
            assert_eq!(config.gatherers, vec![ALL_GATHERERS.to_string()]);
            assert_eq!(config.workers, DEFAULT_WORKERS);
            assert_eq!(config.namespace, "openshift-insights");
            assert!(config.proxy.is_empty());
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_proxy_falls_back_to_environment() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("HTTPS_PROXY", "http://proxy.example.com:3128");
            jail.set_env("NO_PROXY", ".cluster.local");
            let config = get_config(Path::new("missing.yaml"));
            assert_eq!(config.proxy.https_proxy, "http://proxy.example.com:3128");
            assert_eq!(config.proxy.no_proxy, ".cluster.local");
            assert!(config.proxy.http_proxy.is_empty());
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_yaml_then_env_precedence() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "server.yaml",
                r"
interval: 1h
storagePath: /tmp/insights
enableGlobalObfuscation: true
workers: 3
",
            )?;
            jail.set_env("INSIGHTS_INTERVAL", "30m");
            let config = get_config(Path::new("server.yaml"));
            assert_eq!(config.interval, Duration::from_secs(1800));
            assert_eq!(config.storage_path, PathBuf::from("/tmp/insights"));
            assert!(config.enable_global_obfuscation);
            assert_eq!(config.workers, 3);
            Ok(())
        });
    }

    #[test]
    fn test_to_insights_configuration() {
        let config = Config {
            enable_global_obfuscation: true,
            ..Config::default()
        };
        let insights = config.to_insights_configuration();
        assert!(insights.data_reporting.enabled);
        assert!(insights.is_networking_obfuscated());
        assert_eq!(insights.sca.interval, DEFAULT_SCA_INTERVAL);
        assert_eq!(
            insights.cluster_transfer.interval,
            DEFAULT_CLUSTER_TRANSFER_INTERVAL
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Some(Duration::from_secs(5400))
        );
        assert_eq!(parse_duration("  ").unwrap(), None);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "hunter2".to_string(),
            token: "secret-token".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("secret-token"));
    }
}
