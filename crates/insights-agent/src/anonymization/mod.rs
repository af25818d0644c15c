// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Removal of sensitive data from records before they reach the archive.
//!
//! Two facets can be enabled independently:
//!
//! * sensitive values: every occurrence of a configured value (typically the cluster base
//!   domain) is replaced by a placeholder, both in the record name and in its data;
//! * network obfuscation: every IPv4 address or CIDR found in the data is remapped into a
//!   synthetic address of the same subnet. Issued addresses are kept in a translation table so
//!   the same input always maps to the same output within one gather cycle.
//!
//! Addresses outside every known subnet become `0.0.0.0`.

pub mod base_domain;
pub mod network;

use crate::cluster::{
    ClusterError, ConfigResources, ObjectMeta, Secret, SecretStore, INSIGHTS_NAMESPACE,
};
use crate::record::MemoryRecord;
use network::{InvalidNetwork, Ipv4Network, NetworkTranslator};
use regex::bytes::{Captures, Regex};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

pub const CLUSTER_BASE_DOMAIN_PLACEHOLDER: &str = "<CLUSTER_BASE_DOMAIN>";
pub const TRANSLATION_TABLE_SECRET_NAME: &str = "obfuscation-translation-table";
const LOCALHOST_NETWORK: &str = "127.0.0.0/8";
const IPV4_ADDRESS_OR_NETWORK: &str = r"((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(/[0-9]{1,2})?";

#[derive(Debug, thiserror::Error)]
pub enum AnonymizerError {
    #[error(transparent)]
    InvalidNetwork(#[from] InvalidNetwork),
    #[error(transparent)]
    BaseDomain(#[from] base_domain::BaseDomainError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

struct SensitiveValue {
    value: String,
    placeholder: String,
    pattern: Regex,
}

#[derive(Default)]
pub struct AnonymizerBuilder {
    sensitive_values: Vec<(String, String)>,
    networks: Vec<String>,
    network_obfuscation: bool,
}

impl AnonymizerBuilder {
    /// Replaces every occurrence of `value` with `placeholder`. Values are trimmed; empty values
    /// are ignored. Adding a value twice keeps its first position and the latest placeholder.
    pub fn with_sensitive_value(mut self, value: &str, placeholder: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return self;
        }
        match self.sensitive_values.iter_mut().find(|(v, _)| v == value) {
            Some(existing) => existing.1 = placeholder.to_string(),
            None => self
                .sensitive_values
                .push((value.to_string(), placeholder.to_string())),
        }
        self
    }

    pub fn with_networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks.extend(networks.into_iter().map(Into::into));
        self
    }

    pub fn with_network_obfuscation(mut self, enabled: bool) -> Self {
        self.network_obfuscation = enabled;
        self
    }

    pub fn build(self) -> Result<Anonymizer, AnonymizerError> {
        let mut networks = vec![LOCALHOST_NETWORK.parse::<Ipv4Network>()?];
        for network in &self.networks {
            if network.contains(':') {
                debug!("Anonymizer | skipping IPv6 network {network}");
                continue;
            }
            networks.push(network.parse()?);
        }

        let sensitive_values = self
            .sensitive_values
            .into_iter()
            .map(|(value, placeholder)| {
                Ok(SensitiveValue {
                    pattern: Regex::new(&regex::escape(&value))?,
                    value,
                    placeholder,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Anonymizer {
            sensitive_values,
            network_obfuscation: self.network_obfuscation,
            translator: Mutex::new(NetworkTranslator::new(networks)),
            ip_regex: Regex::new(IPV4_ADDRESS_OR_NETWORK)?,
        })
    }
}

pub struct Anonymizer {
    sensitive_values: Vec<SensitiveValue>,
    network_obfuscation: bool,
    translator: Mutex<NetworkTranslator>,
    ip_regex: Regex,
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymizer")
            .field("sensitive_values", &self.sensitive_values.len())
            .field("network_obfuscation", &self.network_obfuscation)
            .finish_non_exhaustive()
    }
}

impl Anonymizer {
    pub fn builder() -> AnonymizerBuilder {
        AnonymizerBuilder::default()
    }

    /// Anonymizer that leaves every record untouched.
    pub fn disabled() -> Result<Self, AnonymizerError> {
        Self::builder().build()
    }

    /// Builds an anonymizer from the cluster configuration documents: the base domain from
    /// `infrastructure` (falling back to `ingress`) and the networks from `network`.
    pub async fn from_cluster(
        resources: &dyn ConfigResources,
        enabled: bool,
    ) -> Result<Self, AnonymizerError> {
        if !enabled {
            return Self::disabled();
        }
        let infrastructure = optional_document(resources, "infrastructure").await?;
        let ingress = optional_document(resources, "ingress").await?;
        let base_domain =
            base_domain::resolve(infrastructure.as_deref(), ingress.as_deref())?;

        let networks = match resources.get_config_resource("network").await {
            Ok(doc) => cluster_networks(&doc),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut builder = Self::builder()
            .with_networks(networks)
            .with_network_obfuscation(true);
        if let Some(domain) = base_domain {
            builder = builder.with_sensitive_value(&domain, CLUSTER_BASE_DOMAIN_PLACEHOLDER);
        }
        builder.build()
    }

    pub fn is_obfuscation_enabled(&self) -> bool {
        self.network_obfuscation || !self.sensitive_values.is_empty()
    }

    pub fn networks(&self) -> Vec<Ipv4Network> {
        self.lock().networks()
    }

    /// Anonymizes the record in place and hands it back.
    pub fn anonymize_memory_record<'a>(&self, record: &'a mut MemoryRecord) -> &'a mut MemoryRecord {
        if !self.is_obfuscation_enabled() {
            return record;
        }

        for sensitive in &self.sensitive_values {
            if record.name.contains(&sensitive.value) {
                record.name = record.name.replace(&sensitive.value, &sensitive.placeholder);
            }
            if let std::borrow::Cow::Owned(data) = sensitive
                .pattern
                .replace_all(&record.data, sensitive.placeholder.as_bytes())
            {
                record.data = data;
            }
        }

        if self.network_obfuscation {
            let mut translator = self.lock();
            let replaced = self.ip_regex.replace_all(&record.data, |caps: &Captures<'_>| {
                translate_match(&mut translator, caps)
            });
            if let std::borrow::Cow::Owned(data) = replaced {
                record.data = data;
            }
        }

        record
    }

    pub fn translation_table(&self) -> BTreeMap<String, String> {
        self.lock().table_snapshot()
    }

    pub fn translation_table_len(&self) -> usize {
        self.lock().table_len()
    }

    /// Forgets issued addresses. Called between gather cycles.
    pub fn reset_translation_table(&self) {
        self.lock().reset();
    }

    /// Persists the translation table into the `obfuscation-translation-table` secret. Nothing is
    /// written while the table is empty.
    pub async fn store_translation_table(
        &self,
        secrets: &dyn SecretStore,
    ) -> Result<Option<Secret>, AnonymizerError> {
        let table = self.translation_table();
        if table.is_empty() {
            return Ok(None);
        }
        let data: BTreeMap<String, Vec<u8>> = table
            .into_iter()
            .map(|(original, translated)| (original, translated.into_bytes()))
            .collect();

        let stored = match secrets
            .get_secret(INSIGHTS_NAMESPACE, TRANSLATION_TABLE_SECRET_NAME)
            .await
        {
            Ok(mut existing) => {
                existing.data = data;
                secrets.update_secret(&existing).await?
            }
            Err(e) if e.is_not_found() => {
                let secret = Secret {
                    metadata: ObjectMeta::named(INSIGHTS_NAMESPACE, TRANSLATION_TABLE_SECRET_NAME),
                    data,
                    secret_type: "Opaque".to_string(),
                };
                secrets.create_secret(&secret).await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(stored))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkTranslator> {
        self.translator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn translate_match(translator: &mut NetworkTranslator, caps: &Captures<'_>) -> Vec<u8> {
    let whole = caps.get(0).map_or(&[][..], |m| m.as_bytes());
    let suffix = caps.get(4).map_or(&[][..], |m| m.as_bytes());
    let address = &whole[..whole.len() - suffix.len()];

    let parsed = std::str::from_utf8(address)
        .ok()
        .and_then(|s| s.parse::<Ipv4Addr>().ok());
    let Some(ip) = parsed else {
        warn!(
            "Anonymizer | unable to parse IP {:?}",
            String::from_utf8_lossy(whole)
        );
        return whole.to_vec();
    };

    let mut out = translator.translate(ip).to_string().into_bytes();
    out.extend_from_slice(suffix);
    out
}

async fn optional_document(
    resources: &dyn ConfigResources,
    kind: &str,
) -> Result<Option<Vec<u8>>, AnonymizerError> {
    match resources.get_config_resource(kind).await {
        Ok(doc) => Ok(Some(doc.to_string().into_bytes())),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Cluster, service and external IP networks from the `network` configuration document.
fn cluster_networks(doc: &serde_json::Value) -> Vec<String> {
    let strings = |pointer: &str| -> Vec<String> {
        doc.pointer(pointer)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut networks: Vec<String> = doc
        .pointer("/spec/clusterNetwork")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("cidr").and_then(|c| c.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    networks.extend(strings("/spec/serviceNetwork"));
    networks.extend(strings("/spec/externalIP/autoAssignCIDRs"));
    networks.extend(strings("/spec/externalIP/policy/allowedCIDRs"));
    networks.extend(strings("/spec/externalIP/policy/rejectedCIDRs"));
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    fn anonymizer() -> Anonymizer {
        Anonymizer::builder()
            .with_sensitive_value("example.com", CLUSTER_BASE_DOMAIN_PLACEHOLDER)
            .with_networks(["127.0.0.0/8", "192.168.0.0/16"])
            .with_network_obfuscation(true)
            .build()
            .unwrap()
    }

    fn record(name: &str, data: &str) -> MemoryRecord {
        MemoryRecord {
            name: name.to_string(),
            fingerprint: None,
            at: Utc::now(),
            data: data.as_bytes().to_vec(),
        }
    }

    fn anonymize(anonymizer: &Anonymizer, data: &str) -> String {
        let mut r = record("", data);
        String::from_utf8(anonymizer.anonymize_memory_record(&mut r).data.clone()).unwrap()
    }

    #[test]
    fn test_anonymize_names() {
        let anonymizer = anonymizer();
        for (before, after) in [
            ("node1.example.com", "node1.<CLUSTER_BASE_DOMAIN>"),
            ("api.example.com/test", "api.<CLUSTER_BASE_DOMAIN>/test"),
        ] {
            let mut r = record(before, "");
            assert_eq!(anonymizer.anonymize_memory_record(&mut r).name, after);
        }
    }

    #[test]
    fn test_anonymize_data_sequentially() {
        let anonymizer = anonymizer();
        let cases = [
            ("api.example.com\n127.0.0.1  ", "api.<CLUSTER_BASE_DOMAIN>\n127.0.0.1  "),
            ("api.example.com\n127.0.0.128  ", "api.<CLUSTER_BASE_DOMAIN>\n127.0.0.2  "),
            ("127.0.0.1  ", "127.0.0.1  "),
            ("127.0.0.128  ", "127.0.0.2  "),
            ("192.168.1.15  ", "192.168.0.1  "),
            ("192.168.1.5  ", "192.168.0.2  "),
            ("192.168.1.255  ", "192.168.0.3  "),
            ("192.169.1.255  ", "0.0.0.0  "),
            (
                r#"{"key1": "val1", "key2": "127.0.0.128"'}"#,
                r#"{"key1": "val1", "key2": "127.0.0.2"'}"#,
            ),
        ];
        for (before, after) in cases {
            assert_eq!(anonymize(&anonymizer, before), after, "input {before:?}");
        }
    }

    #[test]
    fn test_translation_table() {
        let anonymizer = anonymizer();
        for i in 0..254 {
            assert_eq!(
                anonymize(&anonymizer, &format!("192.168.0.{}", 255 - i)),
                format!("192.168.0.{}", i + 1)
            );
        }
        // network address maps to itself
        assert_eq!(anonymize(&anonymizer, "192.168.0.0"), "192.168.0.0");
        assert_eq!(anonymize(&anonymizer, "192.168.1.255"), "192.168.0.255");
        assert_eq!(anonymize(&anonymizer, "192.168.1.55"), "192.168.1.0");
        assert_eq!(anonymize(&anonymizer, "192.168.1.56"), "192.168.1.1");

        assert_eq!(anonymizer.translation_table_len(), 257);
        anonymizer.reset_translation_table();
        assert_eq!(anonymizer.translation_table_len(), 0);
    }

    #[test]
    fn test_cidr_keeps_prefix_length() {
        let anonymizer = anonymizer();
        assert_eq!(
            anonymize(&anonymizer, "route 192.168.7.7/24 via 192.168.7.1"),
            "route 192.168.0.1/24 via 192.168.0.2"
        );
    }

    #[test]
    fn test_cluster_base_domain_in_hostname() {
        let anonymizer = Anonymizer::builder()
            .with_sensitive_value(" cluster.example.com ", CLUSTER_BASE_DOMAIN_PLACEHOLDER)
            .build()
            .unwrap();
        assert!(anonymizer.is_obfuscation_enabled());
        assert_eq!(
            anonymize(&anonymizer, r#""api.cluster.example.com" 10.0.0.1"#),
            r#""api.<CLUSTER_BASE_DOMAIN>" 10.0.0.1"#
        );
    }

    #[test]
    fn test_disabled_anonymizer_is_identity() {
        let anonymizer = Anonymizer::disabled().unwrap();
        assert!(!anonymizer.is_obfuscation_enabled());
        assert_eq!(anonymize(&anonymizer, "10.1.2.3 example.com"), "10.1.2.3 example.com");
    }

    #[test]
    fn test_localhost_network_is_first() {
        let anonymizer = Anonymizer::builder()
            .with_networks(["55.44.0.0/16", "192.168.0.0/16", "10.0.0.0/8"])
            .build()
            .unwrap();
        let networks: Vec<String> = anonymizer.networks().iter().map(|n| n.to_string()).collect();
        assert_eq!(
            networks,
            vec!["127.0.0.0/8", "10.0.0.0/8", "55.44.0.0/16", "192.168.0.0/16"]
        );
    }

    #[test]
    fn test_invalid_network_fails_build() {
        let err = Anonymizer::builder()
            .with_networks(["not-a-network"])
            .build()
            .unwrap_err();
        assert!(matches!(err, AnonymizerError::InvalidNetwork(_)));
    }

    #[tokio::test]
    async fn test_store_translation_table() {
        let cluster = MemoryCluster::new();
        let anonymizer = anonymizer();

        assert!(anonymizer
            .store_translation_table(&cluster)
            .await
            .unwrap()
            .is_none());

        for i in 0..10 {
            assert_eq!(
                anonymize(&anonymizer, &format!("192.168.0.{}", 255 - i)),
                format!("192.168.0.{}", i + 1)
            );
        }
        let secret = anonymizer
            .store_translation_table(&cluster)
            .await
            .unwrap()
            .unwrap();
        for i in 0..10 {
            assert_eq!(
                secret.string(&format!("192.168.0.{}", 255 - i)),
                Some(format!("192.168.0.{}", i + 1))
            );
        }

        // a second store updates the existing secret
        anonymize(&anonymizer, "192.168.3.3");
        let secret = anonymizer
            .store_translation_table(&cluster)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.data.len(), 11);
    }

    #[tokio::test]
    async fn test_from_cluster() {
        let cluster = MemoryCluster::new();
        cluster.set_config_resource(
            "infrastructure",
            json!({"status": {"apiServerURL": "https://api.example.com:6443"}}),
        );
        cluster.set_config_resource(
            "network",
            json!({"spec": {
                "clusterNetwork": [{"cidr": "55.44.0.0/16", "hostPrefix": 23}],
                "serviceNetwork": ["192.168.0.0/16", "fd02::/112"],
                "externalIP": {"policy": {"allowedCIDRs": ["10.0.0.0/8"]}}
            }}),
        );

        let anonymizer = Anonymizer::from_cluster(&cluster, true).await.unwrap();
        let networks: Vec<String> = anonymizer.networks().iter().map(|n| n.to_string()).collect();
        assert_eq!(
            networks,
            vec!["127.0.0.0/8", "10.0.0.0/8", "55.44.0.0/16", "192.168.0.0/16"]
        );
        assert_eq!(
            anonymize(&anonymizer, "node.example.com 55.44.9.9"),
            "node.<CLUSTER_BASE_DOMAIN> 55.44.0.1"
        );

        let disabled = Anonymizer::from_cluster(&cluster, false).await.unwrap();
        assert!(!disabled.is_obfuscation_enabled());
    }

    proptest! {
        #[test]
        fn prop_output_is_deterministic(hosts in proptest::collection::vec((0u8..=255, 0u8..=255), 1..40)) {
            let input: Vec<String> = hosts.iter().map(|(a, b)| format!("192.168.{a}.{b}")).collect();
            let input = input.join(" ");
            let first = anonymize(&anonymizer(), &input);
            let second = anonymize(&anonymizer(), &input);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_distinct_inputs_map_to_distinct_outputs(hosts in proptest::collection::btree_set(1u8..=255, 1..100)) {
            let anonymizer = anonymizer();
            let mut seen = std::collections::HashSet::new();
            for host in hosts {
                let out = anonymize(&anonymizer, &format!("192.168.5.{host}"));
                prop_assert!(out.starts_with("192.168."));
                prop_assert!(seen.insert(out));
            }
        }
    }
}
