// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics of the agent.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `insightsclient_request_send_total` | Counter | `client`, `status_code` |
//! | `insightsclient_request_recvreport_total` | Counter | `client`, `status_code` |
//! | `health_statuses_insights` | Gauge | `metric` |
//!
//! The registry is a value owned by the process context and handed to the subsystems. Exposing
//! it over HTTP is left to the embedding program; [`InsightsMetrics::encode_text`] renders the
//! text exposition format.

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Client label of the upload and report counters.
pub const CLIENT_LABEL: &str = "insights";

pub const HEALTH_METRIC_LABELS: [&str; 5] = ["low", "moderate", "important", "critical", "total"];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Recommendation counts of one report, by total risk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStatusCounts {
    pub low: i64,
    pub moderate: i64,
    pub important: i64,
    pub critical: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct InsightsMetrics {
    registry: Registry,
    request_send_total: CounterVec,
    request_recvreport_total: CounterVec,
    health_statuses: GaugeVec,
}

impl InsightsMetrics {
    /// Creates the metrics on a fresh registry. The health gauges start at `-1` until the
    /// first report is downloaded.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let request_send_total = CounterVec::new(
            Opts::new(
                "insightsclient_request_send_total",
                "Tracks the number of archives sent",
            ),
            &["client", "status_code"],
        )?;
        registry.register(Box::new(request_send_total.clone()))?;

        let request_recvreport_total = CounterVec::new(
            Opts::new(
                "insightsclient_request_recvreport_total",
                "Tracks the number of insights reports received/downloaded",
            ),
            &["client", "status_code"],
        )?;
        registry.register(Box::new(request_recvreport_total.clone()))?;

        let health_statuses = GaugeVec::new(
            Opts::new(
                "insights",
                "Information about the cluster health status as detected by Insights tooling.",
            )
            .namespace("health")
            .subsystem("statuses"),
            &["metric"],
        )?;
        registry.register(Box::new(health_statuses.clone()))?;
        for label in HEALTH_METRIC_LABELS {
            health_statuses.with_label_values(&[label]).set(-1.0);
        }

        Ok(Self {
            registry,
            request_send_total,
            request_recvreport_total,
            health_statuses,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn increment_request_send(&self, status_code: u16) {
        self.request_send_total
            .with_label_values(&[CLIENT_LABEL, &status_code.to_string()])
            .inc();
    }

    pub fn increment_recv_report(&self, status_code: u16) {
        self.request_recvreport_total
            .with_label_values(&[CLIENT_LABEL, &status_code.to_string()])
            .inc();
    }

    pub fn request_send_count(&self, status_code: u16) -> f64 {
        self.request_send_total
            .with_label_values(&[CLIENT_LABEL, &status_code.to_string()])
            .get()
    }

    pub fn recv_report_count(&self, status_code: u16) -> f64 {
        self.request_recvreport_total
            .with_label_values(&[CLIENT_LABEL, &status_code.to_string()])
            .get()
    }

    pub fn set_health_statuses(&self, counts: HealthStatusCounts) {
        let values = [
            counts.low,
            counts.moderate,
            counts.important,
            counts.critical,
            counts.total,
        ];
        for (label, value) in HEALTH_METRIC_LABELS.iter().zip(values) {
            #[allow(clippy::cast_precision_loss)]
            self.health_statuses
                .with_label_values(&[*label])
                .set(value as f64);
        }
    }

    pub fn health_status(&self, label: &str) -> f64 {
        self.health_statuses.with_label_values(&[label]).get()
    }

    /// Renders every registered family in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

impl std::fmt::Debug for InsightsMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightsMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_gauges_start_at_minus_one() {
        let metrics = InsightsMetrics::new().unwrap();
        for label in HEALTH_METRIC_LABELS {
            assert!((metrics.health_status(label) + 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_set_health_statuses() {
        let metrics = InsightsMetrics::new().unwrap();
        metrics.set_health_statuses(HealthStatusCounts {
            low: 1,
            moderate: 2,
            important: 0,
            critical: 1,
            total: 4,
        });
        assert!((metrics.health_status("moderate") - 2.0).abs() < f64::EPSILON);
        assert!((metrics.health_status("total") - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_encode_text() {
        let metrics = InsightsMetrics::new().unwrap();
        metrics.increment_request_send(202);
        metrics.increment_request_send(202);
        metrics.increment_recv_report(200);

        let output = metrics.encode_text().unwrap();
        assert!(output
            .contains(r#"insightsclient_request_send_total{client="insights",status_code="202"} 2"#));
        assert!(output.contains(
            r#"insightsclient_request_recvreport_total{client="insights",status_code="200"} 1"#
        ));
        assert!(output.contains(r#"health_statuses_insights{metric="low"} -1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = InsightsMetrics::new().unwrap();
        let second = InsightsMetrics::new().unwrap();
        first.increment_request_send(500);
        assert!((second.request_send_count(500)).abs() < f64::EPSILON);
    }
}
