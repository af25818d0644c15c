// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Health summaries published by every subsystem and consumed by the status controller.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Operation {
    #[default]
    Unknown,
    Uploading,
    DownloadingReport,
    PullingSCACerts,
    PullingClusterTransfer,
    GatheringReport,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Unknown => "Unknown",
            Operation::Uploading => "Uploading",
            Operation::DownloadingReport => "DownloadingReport",
            Operation::PullingSCACerts => "PullingSCACerts",
            Operation::PullingClusterTransfer => "PullingClusterTransfer",
            Operation::GatheringReport => "GatheringReport",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub operation: Operation,
    pub healthy: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub count: u32,
    pub http_status_code: Option<u16>,
}

impl Summary {
    pub fn healthy(operation: Operation, reason: &str, message: impl Into<String>) -> Self {
        Self {
            operation,
            healthy: true,
            reason: reason.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn unhealthy(operation: Operation, reason: &str, message: impl Into<String>) -> Self {
        Self {
            operation,
            healthy: false,
            reason: reason.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.http_status_code = Some(code);
        self
    }
}

/// Anything whose health the status controller aggregates.
pub trait StatusSource: Send + Sync {
    fn name(&self) -> &str;

    /// `None` until the first update.
    fn current_status(&self) -> Option<Summary>;
}

/// Thread-safe holder of the last summary of one source.
#[derive(Debug)]
pub struct Simple {
    name: String,
    summary: Mutex<Summary>,
}

impl Simple {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: Mutex::new(Summary::default()),
        }
    }

    /// Records a new summary. A change of health replaces the stored summary and restarts the
    /// count; otherwise the count grows and an unhealthy summary refreshes its reason, message
    /// and operation.
    pub fn update_status(&self, mut summary: Summary) {
        let mut current = self.summary.lock().unwrap_or_else(PoisonError::into_inner);

        if current.healthy != summary.healthy {
            debug!(
                "name={} healthy={} reason={} message={}",
                self.name, summary.healthy, summary.reason, summary.message
            );
            if summary.last_transition_time.is_none() {
                summary.last_transition_time = Some(Utc::now());
            }
            summary.count = 1;
            *current = summary;
            return;
        }

        current.count += 1;
        current.http_status_code = summary.http_status_code;
        if summary.healthy {
            return;
        }
        if current.message != summary.message || current.reason != summary.reason {
            debug!(
                "name={} healthy={} reason={} message={}",
                self.name, summary.healthy, summary.reason, summary.message
            );
            current.reason = summary.reason;
            current.message = summary.message;
            current.operation = summary.operation;
        }
    }

    /// Stores `summary` as is, count included.
    pub fn set_status(&self, mut summary: Summary) {
        let mut current = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        if summary.last_transition_time.is_none() {
            summary.last_transition_time = if current.count > 0 && current.healthy == summary.healthy {
                current.last_transition_time
            } else {
                Some(Utc::now())
            };
        }
        summary.count = summary.count.max(1);
        *current = summary;
    }
}

impl StatusSource for Simple {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_status(&self) -> Option<Summary> {
        let summary = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        if summary.count == 0 {
            return None;
        }
        Some(summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_until_first_update() {
        let status = Simple::new("test-controller");
        assert_eq!(status.name(), "test-controller");
        assert!(status.current_status().is_none());
    }

    #[test]
    fn test_same_health_increments_count_and_keeps_transition_time() {
        let status = Simple::new("test");
        status.update_status(Summary::healthy(Operation::Uploading, "UpdatedOK1", "testing"));
        let first = status.current_status().unwrap();
        assert_eq!(first.count, 1);
        assert!(first.last_transition_time.is_some());

        status.update_status(Summary::healthy(
            Operation::DownloadingReport,
            "UpdatedOK1",
            "testing",
        ));
        let second = status.current_status().unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.operation, Operation::Uploading);
        assert_eq!(second.last_transition_time, first.last_transition_time);
    }

    #[test]
    fn test_flip_to_unhealthy_resets_count() {
        let status = Simple::new("test");
        status.update_status(Summary::healthy(Operation::Uploading, "OK", ""));
        status.update_status(Summary::healthy(Operation::Uploading, "OK", ""));
        status.update_status(
            Summary::unhealthy(Operation::Uploading, "UploadFailed", "boom").with_status_code(500),
        );
        let current = status.current_status().unwrap();
        assert!(!current.healthy);
        assert_eq!(current.count, 1);
        assert_eq!(current.http_status_code, Some(500));
    }

    #[test]
    fn test_unhealthy_refreshes_reason() {
        let status = Simple::new("test");
        status.update_status(Summary::unhealthy(Operation::Uploading, "First", "a"));
        status.update_status(Summary::unhealthy(Operation::GatheringReport, "Second", "b"));
        let current = status.current_status().unwrap();
        assert_eq!(current.count, 2);
        assert_eq!(current.reason, "Second");
        assert_eq!(current.message, "b");
        assert_eq!(current.operation, Operation::GatheringReport);
    }

    #[test]
    fn test_set_status_keeps_count() {
        let status = Simple::new("test");
        status.set_status(Summary {
            count: 5,
            ..Summary::unhealthy(Operation::Uploading, "Failed", "boom")
        });
        let current = status.current_status().unwrap();
        assert_eq!(current.count, 5);
        assert!(current.last_transition_time.is_some());
    }
}
