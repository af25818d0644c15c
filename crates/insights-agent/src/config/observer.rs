// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polls the cluster for the configuration sources and feeds the aggregator.

use crate::cluster::{ConfigMapStore, SecretStore};
use crate::config::aggregator::ConfigAggregator;
use crate::config::configmap::fetch_config_map;
use crate::config::secret::{
    fetch_secret, token_from_pull_secret, LegacyConfig, PULL_SECRET_NAME, SUPPORT_SECRET_NAME,
};
use crate::config::ConfigError;
use crate::controllerstatus::{Operation, Simple, Summary};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const SECRET_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const CONFIG_MAP_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Status source name of the configuration.
pub const STATUS_NAME: &str = "config";

pub struct ConfigObserver {
    aggregator: Arc<ConfigAggregator>,
    secrets: Arc<dyn SecretStore>,
    config_maps: Arc<dyn ConfigMapStore>,
    secret_period: Duration,
    config_map_period: Duration,
    status: Arc<Simple>,
}

impl ConfigObserver {
    pub fn new(
        aggregator: Arc<ConfigAggregator>,
        secrets: Arc<dyn SecretStore>,
        config_maps: Arc<dyn ConfigMapStore>,
    ) -> Self {
        Self {
            aggregator,
            secrets,
            config_maps,
            secret_period: SECRET_CHECK_PERIOD,
            config_map_period: CONFIG_MAP_CHECK_PERIOD,
            status: Arc::new(Simple::new(STATUS_NAME)),
        }
    }

    #[must_use]
    pub fn with_periods(mut self, secret_period: Duration, config_map_period: Duration) -> Self {
        self.secret_period = secret_period;
        self.config_map_period = config_map_period;
        self
    }

    pub fn status(&self) -> Arc<Simple> {
        Arc::clone(&self.status)
    }

    pub async fn refresh_token(&self) -> Result<(), ConfigError> {
        debug!("Refreshing configuration from cluster pull secret");
        let token = match fetch_secret(self.secrets.as_ref(), PULL_SECRET_NAME).await? {
            Some(secret) => token_from_pull_secret(&secret)?,
            None => None,
        };
        self.aggregator.set_token(token);
        Ok(())
    }

    pub async fn refresh_support_secret(&self) -> Result<(), ConfigError> {
        debug!("Refreshing configuration from cluster secret");
        let legacy = fetch_secret(self.secrets.as_ref(), SUPPORT_SECRET_NAME)
            .await?
            .map(|secret| LegacyConfig::from_secret(&secret));

        match legacy.as_ref().and_then(|l| l.interval_error.as_ref()) {
            Some(e) => {
                error!("{e}");
                self.status.update_status(Summary::unhealthy(
                    Operation::Unknown,
                    "ConfigInvalid",
                    e.to_string(),
                ));
            }
            None => self
                .status
                .update_status(Summary::healthy(Operation::Unknown, "AsExpected", "")),
        }
        self.aggregator.set_legacy(legacy);
        Ok(())
    }

    pub async fn refresh_config_map(&self) -> Result<(), ConfigError> {
        debug!("Refreshing configuration from the insights-config config map");
        let config_map = fetch_config_map(self.config_maps.as_ref()).await?;
        self.aggregator.set_config_map(config_map);
        Ok(())
    }

    /// Reads every source once. Failures are logged and keep the previous values.
    pub async fn refresh_all(&self) {
        if let Err(e) = self.refresh_token().await {
            warn!("Unable to retrieve token config: {e}");
        }
        if let Err(e) = self.refresh_support_secret().await {
            warn!("Unable to retrieve config: {e}");
        }
        if let Err(e) = self.refresh_config_map().await {
            warn!("Unable to retrieve config map: {e}");
        }
    }

    /// Polls the secrets and the config-map until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut secret_ticker =
            interval_at(Instant::now() + self.secret_period, self.secret_period);
        secret_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut config_map_ticker =
            interval_at(Instant::now() + self.config_map_period, self.config_map_period);
        config_map_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = secret_ticker.tick() => {
                    if let Err(e) = self.refresh_token().await {
                        warn!("Unable to retrieve token config: {e}");
                    }
                    if let Err(e) = self.refresh_support_secret().await {
                        warn!("Unable to retrieve config: {e}");
                    }
                }
                _ = config_map_ticker.tick() => {
                    if let Err(e) = self.refresh_config_map().await {
                        warn!("Unable to retrieve config map: {e}");
                    }
                }
            }
        }
    }
}
