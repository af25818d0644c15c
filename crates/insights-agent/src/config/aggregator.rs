// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merged runtime configuration and the change notification registry.
//!
//! The operator configuration is the base. The support secret and the pull-secret token are
//! applied on top of it and decide whether reporting is enabled. The config-map is applied last
//! and overrides every non-empty value except the reporting switch.

use crate::config::configmap::ConfigMapConfig;
use crate::config::secret::LegacyConfig;
use crate::config::{ConfigError, InsightsConfiguration};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Subscribers to configuration changes. Each one owns a single slot channel.
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Slots>>,
}

#[derive(Debug, Default)]
struct Slots {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::Sender<()>>,
}

impl ListenerRegistry {
    pub fn subscribe(&self) -> ConfigListener {
        let (tx, rx) = mpsc::channel(1);
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = slots.next_id;
        slots.next_id += 1;
        slots.senders.insert(id, tx);
        ConfigListener {
            id,
            rx,
            registry: Some(self.clone()),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .senders
            .remove(&id);
    }

    /// Wakes every listener. A listener with a pending signal is not signalled twice.
    pub fn notify(&self) {
        let slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for tx in slots.senders.values() {
            let _ = tx.try_send(());
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .senders
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ConfigListener {
    id: u64,
    rx: mpsc::Receiver<()>,
    registry: Option<ListenerRegistry>,
}

impl ConfigListener {
    /// Waits for the next change. `None` once the listener is closed.
    pub async fn changed(&mut self) -> Option<()> {
        self.registry.as_ref()?;
        self.rx.recv().await
    }

    /// Consumes a pending change signal, if any.
    pub fn has_changed(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Unsubscribes. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.unsubscribe(self.id);
        }
        self.rx.close();
    }
}

impl Drop for ConfigListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default)]
struct Sources {
    legacy: Option<LegacyConfig>,
    token: Option<String>,
    config_map: Option<ConfigMapConfig>,
    merged: InsightsConfiguration,
}

#[derive(Debug)]
pub struct ConfigAggregator {
    base: InsightsConfiguration,
    sources: Mutex<Sources>,
    listeners: ListenerRegistry,
}

impl ConfigAggregator {
    pub fn new(base: InsightsConfiguration) -> Self {
        let merged = merge(&base, None, None, None);
        info!("Configuration set: {merged}");
        Self {
            base,
            sources: Mutex::new(Sources {
                merged,
                ..Sources::default()
            }),
            listeners: ListenerRegistry::default(),
        }
    }

    /// Snapshot of the merged configuration.
    pub fn config(&self) -> InsightsConfiguration {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merged
            .clone()
    }

    /// Subscribes to configuration changes from either source.
    pub fn config_changed(&self) -> ConfigListener {
        self.listeners.subscribe()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// The reason the support secret was rejected, if it was.
    pub fn legacy_error(&self) -> Option<ConfigError> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .legacy
            .as_ref()
            .and_then(|l| l.interval_error.clone())
    }

    pub fn set_legacy(&self, legacy: Option<LegacyConfig>) -> bool {
        self.update(|sources| sources.legacy = legacy)
    }

    pub fn set_token(&self, token: Option<String>) -> bool {
        self.update(|sources| sources.token = token)
    }

    pub fn set_config_map(&self, config_map: Option<ConfigMapConfig>) -> bool {
        self.update(|sources| sources.config_map = config_map)
    }

    /// Applies `f` and notifies the listeners when the merged configuration changed.
    fn update(&self, f: impl FnOnce(&mut Sources)) -> bool {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut sources);
        let merged = merge(
            &self.base,
            sources.legacy.as_ref(),
            sources.token.as_deref(),
            sources.config_map.as_ref(),
        );
        if merged == sources.merged {
            return false;
        }
        info!("Configuration updated: {merged}");
        sources.merged = merged;
        drop(sources);
        self.listeners.notify();
        true
    }
}

fn merge(
    base: &InsightsConfiguration,
    legacy: Option<&LegacyConfig>,
    token: Option<&str>,
    config_map: Option<&ConfigMapConfig>,
) -> InsightsConfiguration {
    let mut config = base.clone();

    if let Some(legacy) = legacy {
        legacy.apply(&mut config);
    }
    if let Some(token) = token {
        config.credentials.token = token.to_string();
    }

    let credentials = &config.credentials;
    let mut enabled = !config.data_reporting.upload_endpoint.is_empty()
        && (!credentials.token.is_empty() || !credentials.username.is_empty());
    if let Some(e) = legacy.and_then(|l| l.interval_error.as_ref()) {
        debug!("Reporting disabled: {e}");
        enabled = false;
    }
    config.data_reporting.enabled = enabled;

    if let Some(config_map) = config_map {
        config_map.apply(&mut config);
    }
    config
}
