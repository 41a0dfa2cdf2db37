// crates/cafe-core/src/driver.rs

use std::sync::Arc;

use cafe_parser::{CAFE_FILE_FORMAT, RAW_COLUMNS};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{self, BatchFile};
use crate::config::PipelineConfig;
use crate::credentials::{resolve_credentials, ProfileStore, WarehouseCredentials};
use crate::error::{FailureKind, Result};
use crate::graph::{self, GraphError, TaskGraph, TaskRecord, TaskStatus};
use crate::ledger::BatchLedger;
use crate::merge::{self, MergeSpec};
use crate::reconcile;
use crate::steps::{self, StepContext, StepOutput};
use crate::warehouse::Warehouse;

pub const START: &str = "start";
pub const STAGE_FILES: &str = "stage_files";
pub const LOAD_RAW: &str = "load_raw";
pub const UPSERT_PRODUCT: &str = "upsert_product";
pub const UPSERT_STORE: &str = "upsert_store";
pub const UPSERT_SALES: &str = "upsert_sales";
pub const REMOVE_STAGED: &str = "remove_staged";
pub const ARCHIVE_LOCAL: &str = "archive_local";
pub const END: &str = "end";

/// Task identifiers and their upstream tasks. The two dimension merges run
/// concurrently, as do the two cleanup tasks.
pub const TASK_LAYOUT: [(&str, &[&str]); 9] = [
    (START, &[]),
    (STAGE_FILES, &[START]),
    (LOAD_RAW, &[STAGE_FILES]),
    (UPSERT_PRODUCT, &[LOAD_RAW]),
    (UPSERT_STORE, &[LOAD_RAW]),
    (UPSERT_SALES, &[UPSERT_PRODUCT, UPSERT_STORE]),
    (REMOVE_STAGED, &[UPSERT_SALES]),
    (ARCHIVE_LOCAL, &[UPSERT_SALES]),
    (END, &[REMOVE_STAGED, ARCHIVE_LOCAL]),
];

/// Validated execution order of [`TASK_LAYOUT`].
pub fn task_order() -> std::result::Result<Vec<&'static str>, GraphError> {
    graph::plan_order(TASK_LAYOUT.iter().map(|(id, depends_on)| (*id, *depends_on)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: FailureKind,
    pub task: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<String>,
    pub tasks: Vec<TaskRecord<StepOutput>>,
    pub failure: Option<FailureSummary>,
}

impl RunReport {
    fn skipped(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Skipped,
            started_at,
            finished_at: Utc::now(),
            files: Vec::new(),
            tasks: Vec::new(),
            failure: None,
        }
    }

    fn from_tasks(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        files: Vec<String>,
        tasks: Vec<TaskRecord<StepOutput>>,
    ) -> Self {
        let failure = summarize_failure(&tasks);
        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        Self {
            run_id,
            status,
            started_at,
            finished_at: Utc::now(),
            files,
            tasks,
            failure,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskRecord<StepOutput>> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.task(id).map(|task| task.status)
    }
}

fn summarize_failure(tasks: &[TaskRecord<StepOutput>]) -> Option<FailureSummary> {
    let status = |id: &str| tasks.iter().find(|task| task.id == id).map(|task| task.status);

    let cleanup = (status(REMOVE_STAGED), status(ARCHIVE_LOCAL));
    let partial = match cleanup {
        (Some(TaskStatus::Succeeded), Some(TaskStatus::Failed)) => {
            Some((REMOVE_STAGED, ARCHIVE_LOCAL))
        }
        (Some(TaskStatus::Failed), Some(TaskStatus::Succeeded)) => {
            Some((ARCHIVE_LOCAL, REMOVE_STAGED))
        }
        _ => None,
    };
    if let Some((succeeded, failed)) = partial {
        let cause = tasks
            .iter()
            .find(|task| task.id == failed)
            .and_then(|task| task.error.as_ref())
            .map(|error| error.message.as_str())
            .unwrap_or("unknown error");
        return Some(FailureSummary {
            kind: FailureKind::CleanupPartialFailure,
            task: failed.to_string(),
            message: format!("{succeeded} succeeded but {failed} failed: {cause}"),
        });
    }

    tasks.iter().find_map(|task| {
        task.error.as_ref().map(|error| FailureSummary {
            kind: error.kind,
            task: task.id.to_string(),
            message: error.message.clone(),
        })
    })
}

/// The dimension and fact merges of one run.
struct StarSchema {
    product: MergeSpec,
    store: MergeSpec,
    sales: MergeSpec,
}

fn step<'a>(id: &'static str, ctx: &'a StepContext<'a>, schema: &'a StarSchema) -> BoxFuture<'a, Result<StepOutput>> {
    match id {
        STAGE_FILES => steps::stage_files(ctx).boxed(),
        LOAD_RAW => steps::load_raw(ctx).boxed(),
        UPSERT_PRODUCT => steps::upsert(ctx, &schema.product).boxed(),
        UPSERT_STORE => steps::upsert(ctx, &schema.store).boxed(),
        UPSERT_SALES => steps::upsert_fact(ctx, &schema.sales).boxed(),
        REMOVE_STAGED => steps::remove_staged(ctx).boxed(),
        ARCHIVE_LOCAL => steps::archive_local(ctx).boxed(),
        _ => async { Ok(StepOutput::Marker) }.boxed(),
    }
}

pub struct PipelineDriver {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<dyn BatchLedger>,
}

impl PipelineDriver {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>, ledger: Arc<dyn BatchLedger>) -> Self {
        Self {
            config,
            warehouse,
            ledger,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn discover(&self) -> Result<Vec<BatchFile>> {
        batch::discover(&self.config.source_path(), &self.config.batch)
    }

    /// Resolves the configured connection, then runs one batch.
    pub async fn run(&self, profiles: &dyn ProfileStore) -> Result<RunReport> {
        let credentials = resolve_credentials(profiles, &self.config.connection_id)?;
        self.run_with_credentials(&credentials).await
    }

    /// Runs one batch. Task failures are reported in the returned
    /// [`RunReport`]; `Err` means the run could not be attempted.
    pub async fn run_with_credentials(&self, credentials: &WarehouseCredentials) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline_run", %run_id);

        async {
            let pending = reconcile::plan(self.ledger.as_ref()).await?;
            if !pending.is_empty() {
                warn!(
                    files = pending.len(),
                    "earlier runs left loaded files without complete cleanup; see `cafe-admin reconcile`"
                );
            }

            let batch = self.discover()?;
            if batch.is_empty() {
                warn!(dir = %self.config.source_path().display(), "no batch files found; skipping run");
                let report = RunReport::skipped(run_id, started_at);
                self.ledger.record_run(&report).await?;
                return Ok(report);
            }
            batch::preflight(&batch, &CAFE_FILE_FORMAT, &RAW_COLUMNS)?;
            info!(files = batch.len(), "starting pipeline run");

            let ctx = StepContext {
                run_id,
                config: &self.config,
                credentials,
                warehouse: self.warehouse.as_ref(),
                ledger: self.ledger.as_ref(),
                batch: &batch,
            };
            let schema = StarSchema {
                product: merge::product_dimension(&self.config.warehouse),
                store: merge::store_dimension(&self.config.warehouse),
                sales: merge::sales_fact(&self.config.warehouse),
            };

            let mut graph = TaskGraph::new();
            for (id, depends_on) in TASK_LAYOUT {
                let (ctx, schema) = (&ctx, &schema);
                graph.task(id, depends_on, move || step(id, ctx, schema));
            }
            let tasks = graph.execute().await?;

            let files = batch.iter().map(|file| file.name.clone()).collect();
            let report = RunReport::from_tasks(run_id, started_at, files, tasks);
            match &report.failure {
                Some(failure) => warn!(
                    kind = ?failure.kind,
                    task = %failure.task,
                    message = %failure.message,
                    "pipeline run failed"
                ),
                None => info!("pipeline run succeeded"),
            }
            self.ledger.record_run(&report).await?;
            Ok(report)
        }
        .instrument(span)
        .await
    }
}
