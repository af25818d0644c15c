// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of the subsystem health summaries into the `insights` cluster operator.
//!
//! Every subsystem publishes a [`Summary`] through a [`StatusSource`]. The controller folds
//! them into a condition set whenever a source asks for it, at least every two minutes, and
//! never more than twice per thirty seconds. The time of the last successful upload is kept in
//! the status extension so that it survives restarts.

pub mod conditions;
pub mod limiter;

use crate::backoff;
use crate::cluster::{
    ClusterError, ClusterOperator, ClusterOperatorStore, ConditionStatus, ObjectMeta,
    ObjectReference, OperandVersion, CLUSTER_OPERATOR_NAME, OPENSHIFT_CONFIG_NAMESPACE,
};
use crate::config::aggregator::ConfigAggregator;
use crate::controllerstatus::{Operation, StatusSource, Summary};
use crate::insights::uploader::StatusReporter;
use crate::ocm::{sca, transfer};
use crate::recorder::LastReported;
use chrono::{DateTime, SecondsFormat, Utc};
use conditions::{
    Conditions, AVAILABLE, CLUSTER_TRANSFER_AVAILABLE, DEGRADED, DISABLED, DOWNLOAD_DEGRADED,
    PROGRESSING, SCA_AVAILABLE, UPGRADEABLE, UPLOAD_DEGRADED,
};
use limiter::TokenBucket;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upload failures in a row tolerated before the upload is reported as degraded.
pub const UPLOAD_FAILURES_COUNT_THRESHOLD: u32 = 5;
/// Sources that are not ready yet keep the operator progressing for this long.
pub const INITIALIZING_WINDOW: Duration = Duration::from_secs(3 * 60);
pub const UPDATE_PERIOD: Duration = Duration::from_secs(2 * 60);
const RATE_LIMIT_PERIOD: Duration = Duration::from_secs(15);
const RATE_LIMIT_BURST: u32 = 2;

pub const AS_EXPECTED_REASON: &str = "AsExpected";
const DEGRADED_REASON: &str = "Degraded";
const NO_TOKEN_REASON: &str = "NoToken";
const UPGRADEABLE_REASON: &str = "InsightsUpgradeable";
const OPENSHIFT_UPGRADE_REASON: &str = "OpenshiftUpgrade";
const INITIALIZING_REASON: &str = "Initializing";
const MULTIPLE_FAILURES_REASON: &str = "MultipleFailures";

pub const INSIGHTS_AVAILABLE_MESSAGE: &str = "Insights works as expected";
pub const REPORTING_DISABLED_MESSAGE: &str = "Health reporting is disabled";
pub const MONITORING_MESSAGE: &str = "Monitoring the cluster";
const INITIALIZING_MESSAGE: &str = "Initializing the operator";
const ERROR_MESSAGE: &str = "An error has occurred";
const UPGRADEABLE_MESSAGE: &str = "Insights operator can be upgraded";

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusMessage {
    reason: String,
    message: String,
}

impl StatusMessage {
    fn new(reason: &str, message: &str) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Health of the operator derived from the sources in one pass.
#[derive(Debug, Default)]
struct ControllerState {
    all_ready: bool,
    disabled: Option<StatusMessage>,
    upload: Option<StatusMessage>,
    download: Option<StatusMessage>,
    error: Option<StatusMessage>,
}

impl ControllerState {
    fn is_healthy(&self) -> bool {
        self.error.is_none()
    }

    fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }
}

/// Folds the failures that degrade the operator into one reason and message.
fn error_status(errors: &mut [String], reason: &str) -> Option<StatusMessage> {
    match errors {
        [] => None,
        [single] => Some(StatusMessage::new(
            if reason.is_empty() { "UnknownError" } else { reason },
            single,
        )),
        _ => {
            errors.sort();
            Some(StatusMessage::new(
                MULTIPLE_FAILURES_REASON,
                &format!(
                    "There are multiple errors blocking progress:\n* {}",
                    errors.join("\n* ")
                ),
            ))
        }
    }
}

fn is_authorization_reason(reason: &str) -> bool {
    matches!(reason, "NotAuthorized" | "Forbidden")
}

/// `(major, minor)` of a release version such as `4.16.2` or `v4.16.0-rc.1`.
pub fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim_start_matches('v').split(['.', '-', '+']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Whether moving the operand versions to `new_version` crosses a major or minor release.
pub fn is_release_upgrade(new_version: &str, versions: &[OperandVersion]) -> Result<bool, String> {
    let new = major_minor(new_version)
        .ok_or_else(|| format!("invalid release version {new_version:?}"))?;
    for version in versions {
        let current = major_minor(&version.version)
            .ok_or_else(|| format!("invalid operand version {:?}", version.version))?;
        if current != new {
            info!(
                "Operator version updated from {} to {new_version}",
                version.version
            );
            return Ok(true);
        }
    }
    Ok(false)
}

fn related_objects(namespace: &str) -> Vec<ObjectReference> {
    let reference = |group: &str, resource: &str, namespace: &str, name: &str| ObjectReference {
        group: group.to_string(),
        resource: resource.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    vec![
        reference("", "namespaces", "", namespace),
        reference("apps", "deployments", namespace, "insights-operator"),
        reference("", "secrets", OPENSHIFT_CONFIG_NAMESPACE, "pull-secret"),
        reference("", "secrets", OPENSHIFT_CONFIG_NAMESPACE, "support"),
        reference("", "serviceaccounts", namespace, "gather"),
        reference("", "serviceaccounts", namespace, "operator"),
        reference("", "configmaps", namespace, "service-ca-bundle"),
    ]
}

pub struct StatusController {
    name: String,
    namespace: String,
    operators: Arc<dyn ClusterOperatorStore>,
    configurator: Arc<ConfigAggregator>,
    release_version: Option<String>,
    sources: Mutex<BTreeMap<String, Arc<dyn StatusSource>>>,
    reported: Mutex<Option<DateTime<Utc>>>,
    start: Mutex<Option<Instant>>,
    trigger: Notify,
}

impl StatusController {
    pub fn new(
        operators: Arc<dyn ClusterOperatorStore>,
        configurator: Arc<ConfigAggregator>,
        namespace: &str,
    ) -> Self {
        Self {
            name: CLUSTER_OPERATOR_NAME.to_string(),
            namespace: namespace.to_string(),
            operators,
            configurator,
            release_version: None,
            sources: Mutex::new(BTreeMap::new()),
            reported: Mutex::new(None),
            start: Mutex::new(None),
            trigger: Notify::new(),
        }
    }

    /// Release the operator belongs to; a major or minor change marks the operator progressing.
    #[must_use]
    pub fn with_release_version(mut self, release_version: Option<String>) -> Self {
        self.release_version = release_version.filter(|v| !v.is_empty());
        self
    }

    pub fn add_sources<I>(&self, sources: I)
    where
        I: IntoIterator<Item = Arc<dyn StatusSource>>,
    {
        let mut registered = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        for source in sources {
            registered.insert(source.name().to_string(), source);
        }
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn StatusSource>> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Asks the run loop for an update. Requests coalesce.
    pub fn trigger_status_update(&self) {
        self.trigger.notify_one();
    }

    fn controller_start_time(&self) -> Instant {
        *self
            .start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now)
    }

    fn current_state(&self) -> ControllerState {
        let mut state = ControllerState {
            all_ready: true,
            ..Default::default()
        };
        let mut error_reason = String::new();
        let mut errors = Vec::new();

        let sources: Vec<Arc<dyn StatusSource>> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for source in sources {
            let Some(summary) = source.current_status() else {
                info!("Source {} is not ready", source.name());
                state.all_ready = false;
                continue;
            };
            if summary.healthy {
                continue;
            }
            if summary.message.is_empty() {
                error!(
                    "Status source {} reported an empty message: {summary:?}",
                    source.name()
                );
                continue;
            }

            if self.is_degrading_failure(&summary, &mut state) {
                error_reason.clone_from(&summary.reason);
                errors.push(summary.message);
            }
        }

        state.error = error_status(&mut errors, &error_reason);
        if !self.configurator.config().data_reporting.enabled {
            state.disabled = Some(StatusMessage::new(
                NO_TOKEN_REASON,
                REPORTING_DISABLED_MESSAGE,
            ));
        }
        state
    }

    fn is_degrading_failure(&self, summary: &Summary, state: &mut ControllerState) -> bool {
        match summary.operation {
            Operation::Uploading => {
                let over_threshold = summary.count >= UPLOAD_FAILURES_COUNT_THRESHOLD;
                if over_threshold {
                    info!(
                        "Number of last upload failures {} exceeded the threshold {UPLOAD_FAILURES_COUNT_THRESHOLD}. Marking as degraded.",
                        summary.count
                    );
                    state.upload = Some(StatusMessage::new(&summary.reason, &summary.message));
                } else {
                    info!(
                        "Number of last upload failures {} lower than threshold {UPLOAD_FAILURES_COUNT_THRESHOLD}. Not marking as degraded.",
                        summary.count
                    );
                }
                over_threshold || is_authorization_reason(&summary.reason)
            }
            Operation::DownloadingReport => {
                info!("Failed to download Insights report");
                state.download = Some(StatusMessage::new(&summary.reason, &summary.message));
                false
            }
            Operation::PullingSCACerts | Operation::PullingClusterTransfer => {
                summary.http_status_code.is_some_and(|code| code >= 500)
            }
            Operation::GatheringReport => false,
            Operation::Unknown => true,
        }
    }

    /// Computes the new cluster operator from `existing`.
    fn merge(&self, existing: Option<ClusterOperator>, now: DateTime<Utc>) -> ClusterOperator {
        let mut operator = existing.unwrap_or_else(|| ClusterOperator {
            metadata: ObjectMeta::named("", &self.name),
            ..Default::default()
        });

        let state = self.current_state();
        if !self.namespace.is_empty() {
            operator.status.related_objects = related_objects(&self.namespace);
        }
        let initializing =
            !state.all_ready && self.controller_start_time().elapsed() < INITIALIZING_WINDOW;

        let mut conditions = Conditions::new(&operator.status.conditions, now);
        self.update_controller_conditions(&mut conditions, &state, initializing);
        update_conditions_by_status(&mut conditions, &state, initializing);

        if let Some(release_version) = &self.release_version {
            match is_release_upgrade(release_version, &operator.status.versions) {
                Ok(true) => conditions.set(
                    PROGRESSING,
                    ConditionStatus::True,
                    OPENSHIFT_UPGRADE_REASON,
                    "Cluster version is updated",
                ),
                Ok(false) => {}
                Err(e) => error!("Failed checking openshift release version: {e}"),
            }
            operator.status.versions = vec![OperandVersion {
                name: "operator".to_string(),
                version: release_version.clone(),
            }];
        }

        operator.status.conditions = conditions.entries();
        let last_report_time = self
            .last_reported_time()
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));
        operator.status.extension = Some(serde_json::json!({ "lastReportTime": last_report_time }));
        operator
    }

    fn update_controller_conditions(
        &self,
        conditions: &mut Conditions,
        state: &ControllerState,
        initializing: bool,
    ) {
        match &state.disabled {
            Some(disabled) => conditions.set(
                DISABLED,
                ConditionStatus::True,
                &disabled.reason,
                &disabled.message,
            ),
            None => conditions.set(DISABLED, ConditionStatus::False, AS_EXPECTED_REASON, ""),
        }

        match &state.error {
            Some(error) if !state.is_disabled() => {
                conditions.set(DEGRADED, ConditionStatus::True, &error.reason, &error.message);
            }
            _ => conditions.set(
                DEGRADED,
                ConditionStatus::False,
                AS_EXPECTED_REASON,
                INSIGHTS_AVAILABLE_MESSAGE,
            ),
        }

        match &state.upload {
            Some(upload) if !state.is_disabled() => conditions.set(
                UPLOAD_DEGRADED,
                ConditionStatus::True,
                &upload.reason,
                &upload.message,
            ),
            _ => conditions.remove(UPLOAD_DEGRADED),
        }

        match &state.download {
            Some(download) if !state.is_disabled() => conditions.set(
                DOWNLOAD_DEGRADED,
                ConditionStatus::True,
                &download.reason,
                &download.message,
            ),
            _ => conditions.remove(DOWNLOAD_DEGRADED),
        }

        if !initializing {
            self.update_condition_by_reason(conditions, SCA_AVAILABLE, sca::STATUS_NAME, "Updated");
            self.update_condition_by_reason(
                conditions,
                CLUSTER_TRANSFER_AVAILABLE,
                transfer::STATUS_NAME,
                "PullSecretUpdated",
            );
        }

        conditions.set(
            UPGRADEABLE,
            ConditionStatus::True,
            UPGRADEABLE_REASON,
            UPGRADEABLE_MESSAGE,
        );
    }

    /// `True` when the source last reported `reason`, `False` with its reason otherwise.
    fn update_condition_by_reason(
        &self,
        conditions: &mut Conditions,
        condition_type: &str,
        source: &str,
        reason: &str,
    ) {
        let Some(summary) = self.source(source).and_then(|s| s.current_status()) else {
            return;
        };
        let status = if summary.reason == reason {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        conditions.set(condition_type, status, &summary.reason, &summary.message);
    }

    /// Writes the merged status. On the initial call the last report time is restored from the
    /// existing status and the returned flag tells whether the operator was degraded before.
    pub async fn update_status(&self, initial: bool) -> Result<bool, ClusterError> {
        let existing = match self.operators.get_cluster_operator(&self.name).await {
            Ok(operator) => Some(operator),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let mut was_degraded = false;
        if initial {
            if let Some(existing) = &existing {
                if let Some(at) = last_report_time_from(existing) {
                    info!(
                        "Initializing last reported time to {}",
                        at.to_rfc3339_opts(SecondsFormat::Secs, true)
                    );
                    *self.reported.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
                }
                was_degraded = existing
                    .status
                    .conditions
                    .iter()
                    .any(|c| c.condition_type == DEGRADED && c.status == ConditionStatus::True);
                if !was_degraded {
                    info!("The initial operator extension status is healthy");
                }
            }
        }

        let updated = self.merge(existing.clone(), Utc::now());
        match existing {
            None => {
                let created = self.operators.create_cluster_operator(&updated).await?;
                let mut updated = updated;
                updated.metadata = created.metadata;
                self.operators.update_cluster_operator_status(&updated).await?;
            }
            Some(existing) if existing.status == updated.status => {
                debug!("No status update necessary, objects are identical");
            }
            Some(_) => {
                self.operators.update_cluster_operator_status(&updated).await?;
            }
        }
        Ok(was_degraded)
    }

    /// Performs the initial update and returns the delay the first gathering should wait:
    /// none for a healthy start, a fraction of the interval after a degraded one.
    pub async fn start(&self) -> Result<Duration, ClusterError> {
        self.controller_start_time();
        let was_degraded = self.update_status(true).await?;
        if !was_degraded {
            return Ok(Duration::ZERO);
        }
        let interval = self.configurator.config().data_reporting.interval;
        let delay = backoff::jitter(interval / 12, 0.5);
        info!(
            "The operator was degraded before the restart. Setting initial delay to {}s",
            delay.as_secs()
        );
        Ok(delay)
    }

    /// Rewrites the status on every trigger and every two minutes, rate limited.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut limiter = TokenBucket::new(RATE_LIMIT_PERIOD, RATE_LIMIT_BURST);
        let mut ticker = tokio::time::interval_at(Instant::now() + UPDATE_PERIOD, UPDATE_PERIOD);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
                () = self.trigger.notified() => {}
            }
            if !limiter.acquire(&cancel).await {
                return;
            }
            if let Err(e) = self.update_status(false).await {
                error!("Unable to write cluster operator status: {e}");
            }
        }
    }
}

fn update_conditions_by_status(
    conditions: &mut Conditions,
    state: &ControllerState,
    initializing: bool,
) {
    if initializing {
        info!("The operator is still being initialized");
        conditions.set(
            PROGRESSING,
            ConditionStatus::True,
            INITIALIZING_REASON,
            INITIALIZING_MESSAGE,
        );
    }

    match &state.error {
        Some(error) if !state.is_disabled() => {
            info!("The operator has some internal errors: {}", error.message);
            conditions.set(
                PROGRESSING,
                ConditionStatus::False,
                DEGRADED_REASON,
                ERROR_MESSAGE,
            );
            conditions.set(AVAILABLE, ConditionStatus::False, &error.reason, &error.message);
        }
        _ if state.is_disabled() || (state.is_healthy() && !initializing) => {
            if state.is_disabled() {
                info!("The operator is marked as disabled");
            } else {
                info!("The operator is healthy");
            }
            conditions.set(
                PROGRESSING,
                ConditionStatus::False,
                AS_EXPECTED_REASON,
                MONITORING_MESSAGE,
            );
            conditions.set(
                AVAILABLE,
                ConditionStatus::True,
                AS_EXPECTED_REASON,
                INSIGHTS_AVAILABLE_MESSAGE,
            );
        }
        _ => {}
    }
}

fn last_report_time_from(operator: &ClusterOperator) -> Option<DateTime<Utc>> {
    let raw = operator
        .status
        .extension
        .as_ref()?
        .get("lastReportTime")?
        .as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            error!("The initial operator extension status is invalid: {e}");
            None
        }
    }
}

impl LastReported for StatusController {
    fn last_reported_time(&self) -> Option<DateTime<Utc>> {
        *self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusReporter for StatusController {
    fn set_last_reported_time(&self, at: DateTime<Utc>) {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        if reported.is_none() {
            info!(
                "Initializing last reported time to {}",
                at.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
        }
        *reported = Some(at);
        drop(reported);
        self.trigger_status_update();
    }
}
