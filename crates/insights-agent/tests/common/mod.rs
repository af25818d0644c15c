// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use insights_agent::anonymization::Anonymizer;
use insights_agent::archive::DiskStorage;
use insights_agent::cluster::MemoryCluster;
use insights_agent::config::aggregator::ConfigAggregator;
use insights_agent::config::Config;
use insights_agent::gather::{GatherError, Gatherer, GatheringClosure, GatheringOutput};
use insights_agent::insights::client::InsightsClient;
use insights_agent::metrics::InsightsMetrics;
use insights_agent::periodic::PeriodicController;
use insights_agent::record::{RawBytes, Record};
use insights_agent::recorder::Recorder;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const CLUSTER_ID: &str = "6f4e3b8c-1111-4222-8333-444455556666";

/// Gatherer whose functions are given by the test.
pub struct StaticGatherer {
    name: String,
    functions: BTreeMap<String, GatheringClosure>,
}

impl StaticGatherer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: BTreeMap::new(),
        }
    }

    pub fn with_records(mut self, function: &str, count: usize) -> Self {
        let prefix = format!("{}/{function}", self.name);
        self.functions.insert(
            function.to_string(),
            GatheringClosure::new(move |_| {
                let prefix = prefix.clone();
                async move {
                    GatheringOutput::records(
                        (0..count)
                            .map(|i| Record::new(format!("{prefix}/{i}"), RawBytes(vec![b'x'; 8])))
                            .collect(),
                    )
                }
            }),
        );
        self
    }

    pub fn with_payload(mut self, function: &str, record: &str, payload: &str) -> Self {
        let record = record.to_string();
        let payload = payload.to_string();
        self.functions.insert(
            function.to_string(),
            GatheringClosure::new(move |_| {
                let record = record.clone();
                let payload = payload.clone().into_bytes();
                async move { GatheringOutput::records(vec![Record::new(record, RawBytes(payload))]) }
            }),
        );
        self
    }

    pub fn with_closure(mut self, function: &str, closure: GatheringClosure) -> Self {
        self.functions.insert(function.to_string(), closure);
        self
    }
}

#[async_trait]
impl Gatherer for StaticGatherer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn gathering_functions(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, GatheringClosure>, GatherError> {
        Ok(self.functions.clone())
    }
}

/// Everything one agent needs, backed by an in-memory cluster and a temporary archive
/// directory.
pub struct Agent {
    pub dir: TempDir,
    pub cluster: MemoryCluster,
    pub configurator: Arc<ConfigAggregator>,
    pub storage: Arc<DiskStorage>,
    pub recorder: Arc<Recorder>,
}

impl Agent {
    /// `endpoint` is the base URL of the mock ingress service.
    pub fn new(endpoint: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage_path: dir.path().to_path_buf(),
            endpoint: format!("{endpoint}/upload"),
            report_endpoint: format!("{endpoint}/cluster/%s/reports"),
            processing_status_endpoint: format!("{endpoint}/cluster/%s/request/%s/status"),
            ..Config::default()
        };
        let configurator = Arc::new(ConfigAggregator::new(config.to_insights_configuration()));
        configurator.set_token(Some("dG9rZW4=".to_string()));

        let storage = Arc::new(DiskStorage::new(dir.path()));
        let recorder = Arc::new(Recorder::new(
            Arc::clone(&storage) as _,
            Duration::from_secs(3600),
            Arc::new(Anonymizer::disabled().unwrap()),
        ));
        Self {
            dir,
            cluster: MemoryCluster::new(),
            configurator,
            storage,
            recorder,
        }
    }

    pub fn periodic(&self, gatherers: Vec<Arc<dyn Gatherer>>) -> PeriodicController {
        PeriodicController::new(
            Arc::clone(&self.configurator),
            Arc::clone(&self.recorder),
            Arc::new(self.cluster.clone()),
            gatherers,
        )
    }

    pub fn client(&self) -> Arc<InsightsClient> {
        Arc::new(
            InsightsClient::new(
                Arc::new(self.cluster.clone()),
                Arc::clone(&self.configurator),
                InsightsMetrics::new().unwrap(),
            )
            .with_cluster_id(Some(CLUSTER_ID.to_string()))
            .with_release_version(Some("4.16.2".to_string())),
        )
    }
}
