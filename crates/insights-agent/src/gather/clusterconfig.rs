// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in gatherer collecting the cluster scoped configuration documents.

use super::{GatherError, Gatherer, GatheringClosure, GatheringOutput};
use crate::cluster::{ClusterError, ConfigResources};
use crate::record::{RawBytes, Record};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const GATHERER_NAME: &str = "clusterconfig";

/// (function name, resource kind, record name)
const DOCUMENTS: &[(&str, &str, &str)] = &[
    ("infrastructures", "infrastructure", "config/infrastructure"),
    ("ingress", "ingress", "config/ingress"),
    ("networks", "network", "config/network"),
    ("proxies", "proxy", "config/proxy"),
];

pub struct ClusterConfigGatherer {
    resources: Arc<dyn ConfigResources>,
}

impl ClusterConfigGatherer {
    pub fn new(resources: Arc<dyn ConfigResources>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Gatherer for ClusterConfigGatherer {
    fn name(&self) -> &str {
        GATHERER_NAME
    }

    async fn gathering_functions(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, GatheringClosure>, GatherError> {
        let mut functions = BTreeMap::new();

        for (function, kind, record_name) in DOCUMENTS {
            let resources = Arc::clone(&self.resources);
            functions.insert(
                (*function).to_string(),
                GatheringClosure::new(move |_| {
                    let resources = Arc::clone(&resources);
                    async move { gather_document(resources.as_ref(), kind, record_name).await }
                }),
            );
        }

        let resources = Arc::clone(&self.resources);
        functions.insert(
            "version".to_string(),
            GatheringClosure::new(move |_| {
                let resources = Arc::clone(&resources);
                async move { gather_cluster_version(resources.as_ref()).await }
            }),
        );

        let resources = Arc::clone(&self.resources);
        functions.insert(
            "nodes".to_string(),
            GatheringClosure::new(move |_| {
                let resources = Arc::clone(&resources);
                async move { gather_nodes(resources.as_ref()).await }
            }),
        );

        Ok(functions)
    }
}

async fn gather_document(
    resources: &dyn ConfigResources,
    kind: &str,
    record_name: &str,
) -> GatheringOutput {
    match resources.get_config_resource(kind).await {
        Ok(doc) => GatheringOutput::records(vec![Record::json(record_name, doc)]),
        Err(e) => not_found_is_empty(e),
    }
}

/// `config/version` plus the bare cluster id in `config/id`.
async fn gather_cluster_version(resources: &dyn ConfigResources) -> GatheringOutput {
    let doc = match resources.get_config_resource("clusterversion").await {
        Ok(doc) => doc,
        Err(e) => return not_found_is_empty(e),
    };
    let mut records = Vec::with_capacity(2);
    if let Some(id) = doc.pointer("/spec/clusterID").and_then(|v| v.as_str()) {
        records.push(Record::new("config/id", RawBytes(id.as_bytes().to_vec())));
    }
    records.push(Record::json("config/version", doc));
    GatheringOutput::records(records)
}

async fn gather_nodes(resources: &dyn ConfigResources) -> GatheringOutput {
    match resources.list_nodes().await {
        Ok(nodes) => GatheringOutput::records(
            nodes
                .into_iter()
                .map(|node| Record::json(format!("config/node/{}", node.name), node))
                .collect(),
        ),
        Err(e) => not_found_is_empty(e),
    }
}

fn not_found_is_empty(e: ClusterError) -> GatheringOutput {
    if e.is_not_found() {
        return GatheringOutput::default();
    }
    GatheringOutput::error(e.to_string())
}
