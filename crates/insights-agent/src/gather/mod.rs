// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gatherer plug-ins and the logic that runs them into the recorder.
//!
//! A [`Gatherer`] exposes named [`GatheringClosure`]s. [`collect_and_record_gatherer`] selects
//! the enabled ones, runs them on the task runner and records what they return. Every function
//! gets a [`GathererFunctionReport`] which ends up in the archive metadata.

pub mod clusterconfig;
pub mod metadata;
pub mod tasks;

use crate::recorder::Recorder;
use crate::record::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use metadata::{record_archive_metadata, ArchiveMetadata};
pub use tasks::{handle_tasks_concurrently, Task, TaskResult, DEFAULT_WORKERS};

/// Enables every function of every gatherer.
pub const ALL_GATHERERS: &str = "ALL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatherError {
    #[error("no gather functions are specified to run")]
    NoFunctions,
    #[error("unable to list gathering functions: {0}")]
    Functions(String),
    #[error("{}", .0.join(", "))]
    Failed(Vec<String>),
}

/// What a gathering function returns.
#[derive(Debug, Default)]
pub struct GatheringOutput {
    pub records: Vec<Record>,
    pub errors: Vec<String>,
}

impl GatheringOutput {
    pub fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            errors: Vec::new(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            errors: vec![error.into()],
        }
    }
}

pub type GatherFuture = Pin<Box<dyn Future<Output = GatheringOutput> + Send>>;

/// One gathering function. With `can_fail` its errors are logged but do not degrade the
/// gatherer.
#[derive(Clone)]
pub struct GatheringClosure {
    pub run: Arc<dyn Fn(CancellationToken) -> GatherFuture + Send + Sync>,
    pub can_fail: bool,
}

impl GatheringClosure {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatheringOutput> + Send + 'static,
    {
        Self {
            run: Arc::new(move |cancel| Box::pin(f(cancel))),
            can_fail: false,
        }
    }

    #[must_use]
    pub fn can_fail(mut self) -> Self {
        self.can_fail = true;
        self
    }
}

impl std::fmt::Debug for GatheringClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatheringClosure")
            .field("can_fail", &self.can_fail)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Gatherer: Send + Sync {
    fn name(&self) -> &str;

    async fn gathering_functions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, GatheringClosure>, GatherError>;

    /// Gatherers with their own cadence return themselves here.
    fn custom_period(&self) -> Option<&dyn CustomPeriodGatherer> {
        None
    }
}

/// Gatherer that is not processed on every cycle.
pub trait CustomPeriodGatherer: Send + Sync {
    fn should_be_processed_now(&self) -> bool;
    fn update_last_processing_time(&self);
}

/// Which functions run. `enabled` holds `gatherer/function` entries, bare gatherer names or
/// [`ALL_GATHERERS`]; `disabled` uses the same syntax and wins over `enabled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherSelection {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

impl Default for GatherSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl GatherSelection {
    pub fn all() -> Self {
        Self {
            enabled: vec![ALL_GATHERERS.to_string()],
            disabled: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_disabled(mut self, disabled: Vec<String>) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn is_gatherer_disabled(&self, gatherer: &str) -> bool {
        self.disabled.iter().any(|d| d == gatherer)
    }

    fn is_enabled(&self, gatherer: &str, function: &str) -> bool {
        let full_name = format!("{gatherer}/{function}");
        if self.is_gatherer_disabled(gatherer) || self.disabled.contains(&full_name) {
            return false;
        }
        self.enabled
            .iter()
            .any(|e| e == ALL_GATHERERS || e == gatherer || *e == full_name)
    }
}

/// Filters `functions` of `gatherer` down to the selected ones.
pub fn select_functions(
    gatherer: &str,
    functions: BTreeMap<String, GatheringClosure>,
    selection: &GatherSelection,
) -> BTreeMap<String, GatheringClosure> {
    if selection.is_gatherer_disabled(gatherer) {
        info!("{gatherer} gatherer is completely disabled");
        return BTreeMap::new();
    }
    functions
        .into_iter()
        .filter(|(name, _)| selection.is_enabled(gatherer, name))
        .collect()
}

/// Outcome of one function, as stored in the archive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GathererFunctionReport {
    pub name: String,
    pub duration_in_ms: u64,
    pub records_count: usize,
    pub errors: Vec<String>,
    pub panic: Option<String>,
}

/// Reports of one gatherer run. `error` carries the degrading failures, if any.
#[derive(Debug, Default)]
pub struct GathererRun {
    pub reports: Vec<GathererFunctionReport>,
    pub error: Option<GatherError>,
}

/// Runs the selected functions of `gatherer` and records their output. The returned reports
/// end with an aggregate entry named after the gatherer.
pub async fn collect_and_record_gatherer(
    cancel: &CancellationToken,
    gatherer: &dyn Gatherer,
    recorder: &Recorder,
    selection: &GatherSelection,
    workers: usize,
) -> GathererRun {
    let start = Instant::now();
    let name = gatherer.name().to_string();
    let mut reports = Vec::new();
    let mut degrading = Vec::new();
    let mut total_records = 0;

    match gatherer.gathering_functions(cancel).await {
        Ok(functions) => {
            let functions = select_functions(&name, functions, selection);
            if functions.is_empty() {
                degrading.push(GatherError::NoFunctions.to_string());
            } else {
                let tasks = functions
                    .into_iter()
                    .map(|(name, closure)| Task { name, closure })
                    .collect();
                let mut results = handle_tasks_concurrently(cancel.clone(), tasks, workers);
                while let Some(result) = results.recv().await {
                    let (report, errors) = record_function_result(recorder, result, &name).await;
                    total_records += report.records_count;
                    degrading.extend(errors);
                    reports.push(report);
                }
            }
        }
        Err(e) => degrading.push(e.to_string()),
    }

    reports.push(GathererFunctionReport {
        name: name.clone(),
        duration_in_ms: elapsed_ms(start),
        records_count: total_records,
        errors: degrading.clone(),
        panic: None,
    });

    GathererRun {
        reports,
        error: (!degrading.is_empty()).then(|| GatherError::Failed(degrading)),
    }
}

async fn record_function_result(
    recorder: &Recorder,
    result: TaskResult,
    gatherer: &str,
) -> (GathererFunctionReport, Vec<String>) {
    let function = &result.function_name;
    let mut report_errors = Vec::new();
    let mut degrading = Vec::new();

    if let Some(panic) = &result.panic {
        error!(r#"gatherer "{gatherer}" function "{function}" panicked with the error: {panic}"#);
        report_errors.push(panic.clone());
    }

    for err in &result.errors {
        report_errors.push(err.clone());
        if result.ignore_errors {
            warn!(r#"gatherer "{gatherer}" function "{function}" failed with the error: {err}"#);
        } else {
            error!(r#"gatherer "{gatherer}" function "{function}" failed with the error: {err}"#);
            degrading.push(format!(r#"function "{function}" failed with an error"#));
        }
    }

    let total = result.records.len();
    let mut recorded = 0;
    for record in result.records {
        let filename = record.filename();
        match recorder.record(record).await {
            Ok(()) => recorded += 1,
            Err(e) => {
                error!(
                    r#"error recording gatherer "{gatherer}" function "{function}" result "{filename}" because of the error: {e}"#
                );
                report_errors.push(e.to_string());
                degrading.push(format!(
                    r#"unable to record function "{function}" record "{filename}""#
                ));
            }
        }
    }

    info!(
        r#"gatherer "{gatherer}" function "{function}" took {:?} to process {total} records"#,
        result.duration
    );

    (
        GathererFunctionReport {
            name: format!("{gatherer}/{function}"),
            duration_in_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            records_count: recorded,
            errors: report_errors,
            panic: result.panic,
        },
        degrading,
    )
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Test gatherers shared by the modules of this crate.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::record::RawBytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct MockGatherer {
        pub name: String,
        pub functions: BTreeMap<String, GatheringClosure>,
    }

    impl MockGatherer {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                functions: BTreeMap::new(),
            }
        }

        pub fn with_records(mut self, function: &str, count: usize) -> Self {
            let gatherer = self.name.clone();
            let function_name = function.to_string();
            self.functions.insert(
                function.to_string(),
                GatheringClosure::new(move |_| {
                    let prefix = format!("{gatherer}/{function_name}");
                    async move {
                        GatheringOutput::records(
                            (0..count)
                                .map(|i| Record::new(format!("{prefix}/{i}"), RawBytes(vec![b'x'; 4])))
                                .collect(),
                        )
                    }
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
    impl Gatherer for MockGatherer {
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

    /// Processed every other time it is asked.
    pub struct MockCustomPeriodGatherer {
        pub inner: MockGatherer,
        pub asked: AtomicUsize,
        pub updated: AtomicUsize,
    }

    impl MockCustomPeriodGatherer {
        pub fn new(inner: MockGatherer) -> Self {
            Self {
                inner,
                asked: AtomicUsize::new(0),
                updated: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Gatherer for MockCustomPeriodGatherer {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn gathering_functions(
            &self,
            cancel: &CancellationToken,
        ) -> Result<BTreeMap<String, GatheringClosure>, GatherError> {
            self.inner.gathering_functions(cancel).await
        }

        fn custom_period(&self) -> Option<&dyn CustomPeriodGatherer> {
            Some(self)
        }
    }

    impl CustomPeriodGatherer for MockCustomPeriodGatherer {
        fn should_be_processed_now(&self) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst) % 2 == 0
        }

        fn update_last_processing_time(&self) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }
    }
}
