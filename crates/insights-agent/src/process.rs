// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process wide state: start time and the metrics registry.

use crate::metrics::{InsightsMetrics, MetricsError};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ProcessContext {
    started: Instant,
    started_at: DateTime<Utc>,
    metrics: InsightsMetrics,
}

impl ProcessContext {
    pub fn init() -> Result<Self, MetricsError> {
        Ok(Self {
            started: Instant::now(),
            started_at: Utc::now(),
            metrics: InsightsMetrics::new()?,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn metrics(&self) -> &InsightsMetrics {
        &self.metrics
    }

    pub fn teardown(self) {
        info!("Shutting down after {}s", self.uptime().as_secs());
    }
}
