// crates/cafe-core/src/graph.rs

//! Dependency-ordered task execution. A task starts once every upstream task
//! has succeeded; when any upstream fails or is skipped the task is skipped.
//! Independent tasks run concurrently.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::{FailureKind, Result};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("tasks {0:?} form a dependency cycle")]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord<T> {
    pub id: &'static str,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl<T> TaskRecord<T> {
    fn skipped(id: &'static str) -> Self {
        Self {
            id,
            status: TaskStatus::Skipped,
            started_at: None,
            duration_ms: None,
            output: None,
            error: None,
        }
    }
}

pub type TaskFuture<'a, T> = BoxFuture<'a, Result<T>>;
type TaskFn<'a, T> = Box<dyn FnOnce() -> TaskFuture<'a, T> + Send + 'a>;

struct TaskNode<'a, T> {
    id: &'static str,
    depends_on: Vec<&'static str>,
    run: TaskFn<'a, T>,
}

pub struct TaskGraph<'a, T> {
    tasks: Vec<TaskNode<'a, T>>,
}

impl<'a, T> Default for TaskGraph<'a, T> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<'a, T: Send + 'a> TaskGraph<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task<F, Fut>(&mut self, id: &'static str, depends_on: &[&'static str], run: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T>> + Send + 'a,
    {
        self.tasks.push(TaskNode {
            id,
            depends_on: depends_on.to_vec(),
            run: Box::new(move || run().boxed()),
        });
        self
    }

    /// Validated execution order.
    pub fn plan(&self) -> std::result::Result<Vec<&'static str>, GraphError> {
        plan_order(
            self.tasks
                .iter()
                .map(|task| (task.id, task.depends_on.as_slice())),
        )
    }

    /// Runs the graph to completion and returns one record per task, in plan
    /// order. Task failures are recorded, not returned.
    pub async fn execute(self) -> std::result::Result<Vec<TaskRecord<T>>, GraphError> {
        let order = self.plan()?;
        let mut pending: HashMap<&'static str, TaskNode<'a, T>> =
            self.tasks.into_iter().map(|task| (task.id, task)).collect();
        let mut records: HashMap<&'static str, TaskRecord<T>> = HashMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            let mut settled = true;
            while settled {
                settled = false;
                for id in &order {
                    let Some(node) = pending.get(id) else {
                        continue;
                    };
                    let upstream: Option<Vec<TaskStatus>> = node
                        .depends_on
                        .iter()
                        .map(|dependency| records.get(dependency).map(|record| record.status))
                        .collect();
                    let Some(upstream) = upstream else {
                        continue;
                    };
                    let Some(node) = pending.remove(id) else {
                        continue;
                    };

                    if upstream.iter().all(|status| *status == TaskStatus::Succeeded) {
                        running.push(run_task(node.id, node.run));
                    } else {
                        debug!(task = *id, "skipping task; an upstream task did not succeed");
                        records.insert(*id, TaskRecord::skipped(*id));
                        settled = true;
                    }
                }
            }

            match running.next().await {
                Some(record) => {
                    records.insert(record.id, record);
                }
                None => break,
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| records.remove(id))
            .collect())
    }
}

async fn run_task<'a, T>(id: &'static str, run: TaskFn<'a, T>) -> TaskRecord<T> {
    let span = info_span!("task", task = id);
    let started_at = Utc::now();
    let clock = Instant::now();

    let outcome = async {
        info!("task started");
        run().await
    }
    .instrument(span.clone())
    .await;

    let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(output) => {
            info!(parent: &span, duration_ms, "task succeeded");
            TaskRecord {
                id,
                status: TaskStatus::Succeeded,
                started_at: Some(started_at),
                duration_ms: Some(duration_ms),
                output: Some(output),
                error: None,
            }
        }
        Err(err) => {
            let kind = err.kind();
            error!(parent: &span, duration_ms, ?kind, error = %err, "task failed");
            TaskRecord {
                id,
                status: TaskStatus::Failed,
                started_at: Some(started_at),
                duration_ms: Some(duration_ms),
                output: None,
                error: Some(TaskFailure {
                    kind,
                    message: err.to_string(),
                }),
            }
        }
    }
}

/// Kahn ordering of `(task, dependencies)` pairs. Ties keep declaration order.
pub fn plan_order<'d>(
    tasks: impl IntoIterator<Item = (&'static str, &'d [&'static str])>,
) -> std::result::Result<Vec<&'static str>, GraphError> {
    let tasks: Vec<(&'static str, &'d [&'static str])> = tasks.into_iter().collect();

    let mut indegree: HashMap<&'static str, usize> = HashMap::with_capacity(tasks.len());
    for (id, depends_on) in &tasks {
        if indegree.insert(*id, depends_on.len()).is_some() {
            return Err(GraphError::DuplicateTask(id.to_string()));
        }
    }

    let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
    for (id, depends_on) in &tasks {
        for dependency in depends_on.iter() {
            if !indegree.contains_key(dependency) {
                return Err(GraphError::UnknownDependency {
                    task: id.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            dependents.entry(*dependency).or_default().push(*id);
        }
    }

    let mut ready: VecDeque<&'static str> = tasks
        .iter()
        .filter(|(_, depends_on)| depends_on.is_empty())
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = ready.pop_front() {
        order.push(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(remaining) = indegree.get_mut(dependent) {
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if order.len() < tasks.len() {
        let blocked = tasks
            .iter()
            .filter(|(id, _)| !order.contains(id))
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(GraphError::Cycle(blocked));
    }

    Ok(order)
}
