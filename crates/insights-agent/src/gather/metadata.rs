// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::GathererFunctionReport;
use crate::record::{Record, METADATA_RECORD_NAME};
use crate::recorder::{Recorder, RecorderError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const CGROUP_V2_MEMORY: &str = "/sys/fs/cgroup/memory.current";
const CGROUP_V1_MEMORY: &str = "/sys/fs/cgroup/memory/memory.usage_in_bytes";

/// Content of the metadata record written into every archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub status_reports: Vec<GathererFunctionReport>,
    /// Memory used by the container, from cgroups. Zero when unavailable.
    pub memory_alloc_bytes: u64,
    pub uptime_seconds: f64,
    pub is_global_obfuscation_enabled: bool,
}

impl ArchiveMetadata {
    pub fn new(
        status_reports: Vec<GathererFunctionReport>,
        uptime: Duration,
        is_global_obfuscation_enabled: bool,
    ) -> Self {
        let memory_alloc_bytes = read_memory_usage().unwrap_or_else(|e| {
            warn!("can't read cgroups memory usage data: {e}");
            0
        });
        Self {
            status_reports,
            memory_alloc_bytes,
            // millisecond resolution
            uptime_seconds: (uptime.as_millis() as f64) / 1000.0,
            is_global_obfuscation_enabled,
        }
    }
}

/// Records the archive metadata through the recorder.
pub async fn record_archive_metadata(
    status_reports: Vec<GathererFunctionReport>,
    recorder: &Recorder,
    uptime: Duration,
    is_global_obfuscation_enabled: bool,
) -> Result<(), RecorderError> {
    let metadata = ArchiveMetadata::new(status_reports, uptime, is_global_obfuscation_enabled);
    recorder
        .record(Record::json(METADATA_RECORD_NAME, metadata))
        .await
}

fn read_memory_usage() -> io::Result<u64> {
    read_cgroup_value(Path::new(CGROUP_V2_MEMORY))
        .or_else(|_| read_cgroup_value(Path::new(CGROUP_V1_MEMORY)))
}

fn read_cgroup_value(path: &Path) -> io::Result<u64> {
    let content = std::fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
