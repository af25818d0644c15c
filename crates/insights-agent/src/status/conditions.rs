// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Condition set of the cluster operator, keyed and sorted by type.

use crate::cluster::{Condition, ConditionStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const AVAILABLE: &str = "Available";
pub const PROGRESSING: &str = "Progressing";
pub const DEGRADED: &str = "Degraded";
pub const UPGRADEABLE: &str = "Upgradeable";
/// The primary function of the operator is switched off.
pub const DISABLED: &str = "Disabled";
/// Set when archives cannot be uploaded.
pub const UPLOAD_DEGRADED: &str = "UploadDegraded";
/// Set when the analysis report cannot be downloaded.
pub const DOWNLOAD_DEGRADED: &str = "DownloadDegraded";
pub const SCA_AVAILABLE: &str = "SCAAvailable";
pub const CLUSTER_TRANSFER_AVAILABLE: &str = "ClusterTransferAvailable";

#[derive(Debug, Clone)]
pub struct Conditions {
    entries: BTreeMap<String, Condition>,
    now: DateTime<Utc>,
}

impl Conditions {
    /// Starts from `existing`, adding the always present types with an `Unknown` status.
    pub fn new(existing: &[Condition], now: DateTime<Utc>) -> Self {
        let mut entries = BTreeMap::new();
        for condition_type in [
            AVAILABLE,
            PROGRESSING,
            DEGRADED,
            SCA_AVAILABLE,
            CLUSTER_TRANSFER_AVAILABLE,
        ] {
            let mut condition = Condition::new(condition_type, ConditionStatus::Unknown, "", "");
            condition.last_transition_time = Some(now);
            entries.insert(condition_type.to_string(), condition);
        }
        for condition in existing {
            entries.insert(condition.condition_type.clone(), condition.clone());
        }
        Self { entries, now }
    }

    /// Keeps the transition time when the status does not change.
    pub fn set(&mut self, condition_type: &str, status: ConditionStatus, reason: &str, message: &str) {
        let last_transition_time = match self.entries.get(condition_type) {
            Some(existing) if existing.status == status => existing.last_transition_time,
            _ => Some(self.now),
        };
        self.entries.insert(
            condition_type.to_string(),
            Condition {
                condition_type: condition_type.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time,
            },
        );
    }

    pub fn remove(&mut self, condition_type: &str) {
        self.entries.remove(condition_type);
    }

    pub fn find(&self, condition_type: &str) -> Option<&Condition> {
        self.entries.get(condition_type)
    }

    /// Conditions sorted by type.
    pub fn entries(self) -> Vec<Condition> {
        self.entries.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_defaults_are_unknown() {
        let conditions = Conditions::new(&[], t(1));
        let entries = conditions.entries();
        let types: Vec<&str> = entries.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                AVAILABLE,
                CLUSTER_TRANSFER_AVAILABLE,
                DEGRADED,
                PROGRESSING,
                SCA_AVAILABLE
            ]
        );
        assert!(entries.iter().all(|c| c.status == ConditionStatus::Unknown));
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let mut existing = Condition::new(AVAILABLE, ConditionStatus::True, "AsExpected", "");
        existing.last_transition_time = Some(t(0));

        let mut conditions = Conditions::new(&[existing], t(5));
        conditions.set(AVAILABLE, ConditionStatus::True, "AsExpected", "still fine");
        assert_eq!(conditions.find(AVAILABLE).unwrap().last_transition_time, Some(t(0)));
        assert_eq!(conditions.find(AVAILABLE).unwrap().message, "still fine");

        conditions.set(AVAILABLE, ConditionStatus::False, "Broken", "");
        assert_eq!(conditions.find(AVAILABLE).unwrap().last_transition_time, Some(t(5)));
    }

    #[test]
    fn test_remove() {
        let mut conditions = Conditions::new(&[], t(1));
        conditions.set(UPLOAD_DEGRADED, ConditionStatus::True, "UploadFailed", "boom");
        assert!(conditions.find(UPLOAD_DEGRADED).is_some());
        conditions.remove(UPLOAD_DEGRADED);
        assert!(conditions.find(UPLOAD_DEGRADED).is_none());
    }
}
