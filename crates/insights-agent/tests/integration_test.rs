// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end flows: gather into an archive, upload it and fold the outcome into the cluster
//! operator status.

mod common;

use chrono::Utc;
use common::{Agent, StaticGatherer};
use insights_agent::anonymization::{Anonymizer, CLUSTER_BASE_DOMAIN_PLACEHOLDER};
use insights_agent::archive::{read_archive_file, SavedArchive};
use insights_agent::cluster::{
    find_condition, ConditionStatus, ObjectMeta, Secret, INSIGHTS_NAMESPACE,
    OPENSHIFT_CONFIG_NAMESPACE,
};
use insights_agent::config::configmap::ConfigMapConfig;
use insights_agent::config::secret::LegacyConfig;
use insights_agent::controllerstatus::StatusSource;
use insights_agent::gather::metadata::ArchiveMetadata;
use insights_agent::gather::{GatherSelection, Gatherer, GatheringClosure, GatheringOutput};
use insights_agent::http::REQUEST_ID_HEADER;
use insights_agent::insights::uploader::{ReportedTime, Uploader};
use insights_agent::insights::Source;
use insights_agent::record::{MemoryRecord, METADATA_RECORD_NAME};
use insights_agent::recorder::LastReported;
use insights_agent::status::conditions::{AVAILABLE, DEGRADED, PROGRESSING, UPLOAD_DEGRADED};
use insights_agent::status::StatusController;
use mockito::Server;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn metadata(archive: &SavedArchive) -> ArchiveMetadata {
    let records = read_archive_file(&archive.path).unwrap();
    let metadata = records
        .iter()
        .find(|r| r.name == format!("{METADATA_RECORD_NAME}.json"))
        .unwrap();
    serde_json::from_slice(&metadata.data).unwrap()
}

fn uploader(agent: &Agent, reported: Arc<ReportedTime>) -> Uploader {
    Uploader::new(
        Arc::clone(&agent.storage) as _,
        agent.client(),
        Arc::clone(&agent.configurator),
        reported,
    )
}

fn status_controller(agent: &Agent) -> StatusController {
    StatusController::new(
        Arc::new(agent.cluster.clone()),
        Arc::clone(&agent.configurator),
        INSIGHTS_NAMESPACE,
    )
}

#[tokio::test]
async fn test_gather_upload_and_report_healthy() {
    let mut server = Server::new_async().await;
    let upload = server
        .mock("POST", "/upload")
        .with_status(202)
        .with_header(REQUEST_ID_HEADER, "abc")
        .expect(2)
        .create_async()
        .await;
    let agent = Agent::new(&server.url());
    let gatherer = StaticGatherer::new("clusterconfig")
        .with_records("nodes", 2)
        .with_records("version", 4);
    let periodic = agent.periodic(vec![Arc::new(gatherer)]);

    let report = periodic
        .run_cycle(&CancellationToken::new(), &GatherSelection::all())
        .await
        .unwrap();

    let archive = report.archive.unwrap();
    let file_name = archive.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("insights-"));
    assert!(file_name.ends_with(".tar.gz"));
    assert_eq!(read_archive_file(&archive.path).unwrap().len(), 7);
    assert_eq!(agent.storage.list().unwrap().len(), 1);

    let reported = Arc::new(ReportedTime::default());
    let uploader = uploader(&agent, Arc::clone(&reported));
    let response = uploader
        .upload(&CancellationToken::new(), &Source::archive(&archive.path))
        .await
        .unwrap();
    assert_eq!(response.request_id, "abc");
    assert_eq!(response.status, 202);

    uploader
        .check_summary_and_send(&CancellationToken::new())
        .await;
    upload.assert_async().await;
    assert!(reported.last_reported_time().is_some());

    let status = status_controller(&agent);
    status.add_sources(periodic.sources());
    status.add_sources([uploader.status() as Arc<dyn StatusSource>]);
    status.update_status(true).await.unwrap();

    let operator = agent.cluster.cluster_operator("insights").unwrap();
    let conditions = &operator.status.conditions;
    assert_eq!(find_condition(conditions, AVAILABLE).unwrap().status, ConditionStatus::True);
    assert_eq!(find_condition(conditions, PROGRESSING).unwrap().status, ConditionStatus::False);
    assert_eq!(find_condition(conditions, DEGRADED).unwrap().status, ConditionStatus::False);
}

#[tokio::test]
async fn test_panicking_gatherer_is_reported_in_metadata() {
    fn explode() -> GatheringOutput {
        panic!("boom")
    }
    let agent = Agent::new("http://127.0.0.1:1");
    let good = StaticGatherer::new("good").with_records("run", 3);
    let bad = StaticGatherer::new("bad")
        .with_closure("run", GatheringClosure::new(|_| async { explode() }).can_fail());
    let periodic = agent.periodic(vec![Arc::new(good), Arc::new(bad)]);

    let report = periodic
        .run_cycle(&CancellationToken::new(), &GatherSelection::all())
        .await
        .unwrap();

    let archive = report.archive.unwrap();
    assert_eq!(read_archive_file(&archive.path).unwrap().len(), 4);
    let bad_report = metadata(&archive)
        .status_reports
        .into_iter()
        .find(|r| r.name == "bad/run")
        .unwrap();
    assert_eq!(bad_report.panic.as_deref(), Some("boom"));
    assert_eq!(bad_report.errors, vec!["boom".to_string()]);
    assert_eq!(bad_report.records_count, 0);
}

#[tokio::test]
async fn test_unauthorized_upload_degrades_operator() {
    let mut server = Server::new_async().await;
    let upload = server
        .mock("POST", "/upload")
        .with_status(401)
        .with_body("token expired")
        .expect(1)
        .create_async()
        .await;
    let agent = Agent::new(&server.url());
    let periodic = agent.periodic(vec![Arc::new(
        StaticGatherer::new("clusterconfig").with_records("nodes", 1),
    )]);
    periodic
        .run_cycle(&CancellationToken::new(), &GatherSelection::all())
        .await
        .unwrap();

    let reported = Arc::new(ReportedTime::default());
    let uploader = uploader(&agent, Arc::clone(&reported));
    uploader
        .check_summary_and_send(&CancellationToken::new())
        .await;
    upload.assert_async().await;
    assert!(reported.last_reported_time().is_none());

    let summary = uploader.status().current_status().unwrap();
    assert!(!summary.healthy);
    assert_eq!(summary.reason, "NotAuthorized");
    assert_eq!(summary.count, 1);
    assert_eq!(summary.http_status_code, Some(401));

    let status = status_controller(&agent);
    status.add_sources([uploader.status() as Arc<dyn StatusSource>]);
    status.update_status(true).await.unwrap();

    let operator = agent.cluster.cluster_operator("insights").unwrap();
    let conditions = &operator.status.conditions;
    assert_eq!(find_condition(conditions, PROGRESSING).unwrap().status, ConditionStatus::False);
    assert_eq!(find_condition(conditions, AVAILABLE).unwrap().status, ConditionStatus::False);
    let degraded = find_condition(conditions, DEGRADED).unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, "NotAuthorized");
    assert!(find_condition(conditions, UPLOAD_DEGRADED).is_none());
}

#[tokio::test]
async fn test_cluster_base_domain_is_obfuscated_in_archive() {
    let agent = Agent::new("http://127.0.0.1:1");
    agent.cluster.set_config_resource(
        "infrastructure",
        serde_json::json!({"status": {"apiServerURL": "https://api.cluster.example.com:6443"}}),
    );
    let gatherer = StaticGatherer::new("clusterconfig").with_payload(
        "ingress",
        "config/ingress",
        r#"{"host":"api.cluster.example.com"}"#,
    );
    let periodic = agent
        .periodic(vec![Arc::new(gatherer)])
        .with_networking_obfuscation(true);

    let report = periodic
        .run_cycle(&CancellationToken::new(), &GatherSelection::all())
        .await
        .unwrap();

    let archive = report.archive.unwrap();
    let records = read_archive_file(&archive.path).unwrap();
    let ingress = records
        .iter()
        .find(|r| r.name.starts_with("config/ingress"))
        .unwrap();
    let content = String::from_utf8(ingress.data.clone()).unwrap();
    assert_eq!(
        content,
        format!(r#"{{"host":"api.{CLUSTER_BASE_DOMAIN_PLACEHOLDER}"}}"#)
    );
    assert!(metadata(&archive).is_global_obfuscation_enabled);
}

#[test]
fn test_network_translation_is_stable_within_a_cycle() {
    let anonymizer = Anonymizer::builder()
        .with_networks(["10.0.0.0/24"])
        .with_network_obfuscation(true)
        .build()
        .unwrap();
    let record = |data: &str| MemoryRecord {
        name: "config/network".to_string(),
        fingerprint: None,
        at: Utc::now(),
        data: data.as_bytes().to_vec(),
    };

    let mut first = record("10.0.0.54 10.0.0.55 10.0.0.54 10.0.0.0/24 192.168.1.1");
    anonymizer.anonymize_memory_record(&mut first);
    assert_eq!(
        String::from_utf8(first.data).unwrap(),
        "10.0.0.1 10.0.0.2 10.0.0.1 10.0.0.0/24 0.0.0.0"
    );
    assert_eq!(anonymizer.translation_table_len(), 2);

    let mut second = record("10.0.0.56 10.0.0.55");
    anonymizer.anonymize_memory_record(&mut second);
    assert_eq!(String::from_utf8(second.data).unwrap(), "10.0.0.3 10.0.0.2");
    assert_eq!(anonymizer.translation_table_len(), 3);

    anonymizer.reset_translation_table();
    let mut next_cycle = record("10.0.0.56");
    anonymizer.anonymize_memory_record(&mut next_cycle);
    assert_eq!(String::from_utf8(next_cycle.data).unwrap(), "10.0.0.1");
}

fn support_secret(values: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta::named(OPENSHIFT_CONFIG_NAMESPACE, "support"),
        data: values
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect::<BTreeMap<_, _>>(),
        secret_type: "Opaque".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_config_map_interval_reschedules_gathering() {
    let agent = Agent::new("http://127.0.0.1:1");
    agent
        .configurator
        .set_legacy(Some(LegacyConfig::from_secret(&support_secret(&[(
            "interval", "1h",
        )]))));
    assert_eq!(
        agent.configurator.config().data_reporting.interval,
        Duration::from_secs(3600)
    );

    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let gatherer: Arc<dyn Gatherer> = Arc::new(StaticGatherer::new("clusterconfig").with_closure(
        "nodes",
        GatheringClosure::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { GatheringOutput::default() }
        }),
    ));
    let periodic = Arc::new(agent.periodic(vec![gatherer]));
    let cancel = CancellationToken::new();
    let handle = {
        let periodic = Arc::clone(&periodic);
        let cancel = cancel.clone();
        tokio::spawn(async move { periodic.run(cancel, Duration::ZERO).await })
    };
    while runs.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let changed = agent.configurator.set_config_map(Some(
        ConfigMapConfig::from_yaml("dataReporting:\n  enabled: false\n  interval: 30m\n").unwrap(),
    ));
    assert!(changed);
    let config = agent.configurator.config();
    assert_eq!(config.data_reporting.interval, Duration::from_secs(1800));
    assert!(config.data_reporting.enabled);

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    cancel.cancel();
    handle.await.unwrap();
}
