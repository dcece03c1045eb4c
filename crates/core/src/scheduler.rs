//! Bounded fan-out of independent async operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{FleetError, Result};

/// How [`FanOut::run`] aggregates failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Return the first error once every task in flight has finished. The
    /// other outcomes are dropped.
    FailFast,
    /// Run everything to completion and hand back every outcome.
    BestEffort,
}

/// Outcome of one fanned-out task.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub label: String,
    pub outcome: Result<T>,
}

impl<T> TaskResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A set of labelled tasks waiting to be run with bounded parallelism.
///
/// Parallelism defaults to one slot per task.
pub struct FanOut<T> {
    name: &'static str,
    parallelism: Option<usize>,
    tasks: Vec<(String, std::pin::Pin<Box<dyn Future<Output = Result<T>> + Send>>)>,
}

impl<T: Send + 'static> FanOut<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            parallelism: None,
            tasks: Vec::new(),
        }
    }

    /// Cap the number of tasks running at once. `None` or zero means one slot per task.
    pub fn with_parallelism(mut self, parallelism: Option<usize>) -> Self {
        self.parallelism = parallelism.filter(|p| *p > 0);
        self
    }

    pub fn push<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.tasks.push((label.into(), Box::pin(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task to completion. Under [`Policy::FailFast`] the first error
    /// is returned as `Err`; under [`Policy::BestEffort`] failures are logged
    /// and returned in launch order alongside the successes.
    pub async fn run(self, policy: Policy) -> Result<Vec<TaskResult<T>>> {
        let total = self.tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let permits = self.parallelism.unwrap_or(total).min(total);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut set = JoinSet::new();
        let mut labels = Vec::with_capacity(total);
        let mut task_ids = HashMap::with_capacity(total);

        for (index, (label, task)) in self.tasks.into_iter().enumerate() {
            labels.push(label);
            let semaphore = Arc::clone(&semaphore);
            let handle = set.spawn(async move {
                // The semaphore is never closed; a failed acquire just runs unbounded.
                let _permit = semaphore.acquire_owned().await.ok();
                (index, task.await)
            });
            task_ids.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    let index = task_ids.get(&e.id()).copied();
                    let label = index.map(|i| labels[i].clone()).unwrap_or_default();
                    warn!(fan_out = self.name, task = %label, error = %e, "Task panicked");
                    match index {
                        Some(index) => (index, Err(FleetError::TaskPanicked(label))),
                        None => {
                            first_error.get_or_insert(FleetError::TaskPanicked(label));
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = &outcome {
                warn!(fan_out = self.name, task = %labels[index], error = %e, "Task failed");
            }
            match (policy, outcome) {
                // Siblings still run to completion; only the first error is kept.
                (Policy::FailFast, Err(e)) => {
                    first_error.get_or_insert(e);
                }
                (_, outcome) => slots[index] = Some(outcome),
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(labels
            .into_iter()
            .zip(slots)
            .map(|(label, outcome)| {
                let outcome =
                    outcome.unwrap_or_else(|| Err(FleetError::TaskPanicked(label.clone())));
                TaskResult { label, outcome }
            })
            .collect())
    }
}

/// Split best-effort results into successes and the labelled failures.
pub fn partition<T>(results: Vec<TaskResult<T>>) -> (Vec<T>, Vec<(String, FleetError)>) {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for result in results {
        match result.outcome {
            Ok(value) => ok.push(value),
            Err(e) => failed.push((result.label, e)),
        }
    }
    (ok, failed)
}
