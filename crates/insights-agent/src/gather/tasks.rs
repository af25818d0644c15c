// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency execution of gathering functions.

use super::{GatheringClosure, GatheringOutput};
use crate::record::Record;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_WORKERS: usize = 5;

pub struct Task {
    pub name: String,
    pub closure: GatheringClosure,
}

#[derive(Debug)]
pub struct TaskResult {
    pub function_name: String,
    pub records: Vec<Record>,
    pub errors: Vec<String>,
    pub panic: Option<String>,
    pub duration: Duration,
    pub ignore_errors: bool,
}

/// Runs `tasks` on `workers` workers and streams the results in completion order. The returned
/// channel closes once every worker has exited.
pub fn handle_tasks_concurrently(
    cancel: CancellationToken,
    tasks: Vec<Task>,
    workers: usize,
) -> mpsc::Receiver<TaskResult> {
    let (results_tx, results_rx) = mpsc::channel(1);
    let (tasks_tx, tasks_rx) = mpsc::channel::<Task>(1);
    let tasks_rx = Arc::new(Mutex::new(tasks_rx));

    let workers = workers.max(1).min(tasks.len().max(1));
    debug!("number of workers: {workers}");
    for id in 0..workers {
        let tasks_rx = Arc::clone(&tasks_rx);
        let results_tx = results_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            debug!("worker {id} listening for tasks.");
            loop {
                let task = tasks_rx.lock().await.recv().await;
                let Some(task) = task else { break };
                debug!("worker {id} working on {} task.", task.name);
                let result = handle_task(cancel.clone(), task).await;
                if results_tx.send(result).await.is_err() {
                    break;
                }
            }
            debug!("worker {id} stopped.");
        });
    }
    drop(results_tx);

    tokio::spawn(async move {
        for task in tasks {
            if tasks_tx.send(task).await.is_err() {
                break;
            }
        }
    });

    results_rx
}

async fn handle_task(cancel: CancellationToken, task: Task) -> TaskResult {
    let start = Instant::now();
    let ignore_errors = task.closure.can_fail;
    let future = (task.closure.run)(cancel);
    let (output, panic) = match tokio::spawn(future).await {
        Ok(output) => (output, None),
        Err(e) if e.is_panic() => (GatheringOutput::default(), Some(panic_message(e.into_panic()))),
        Err(e) => (
            GatheringOutput {
                records: Vec::new(),
                errors: vec![e.to_string()],
            },
            None,
        ),
    };
    TaskResult {
        function_name: task.name,
        records: output.records,
        errors: output.errors,
        panic,
        duration: start.elapsed(),
        ignore_errors,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
