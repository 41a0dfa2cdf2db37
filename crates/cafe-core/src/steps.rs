// crates/cafe-core/src/steps.rs

//! The pipeline's units of work. Each step maps warehouse failures onto the
//! pipeline error taxonomy and records per-file progress in the ledger.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::BatchFile;
use crate::config::PipelineConfig;
use crate::credentials::WarehouseCredentials;
use crate::error::{PipelineError, Result};
use crate::ledger::{BatchLedger, FileKey, LedgerMark};
use crate::merge::{DedupPolicy, MergeSpec};
use crate::warehouse::{
    LoadReport, MergeReport, RawLoadError, RawLoadPhase, RawLoadPlan, StagedObject, Warehouse,
};

/// What a step produced, kept in the run report.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Marker,
    Staged { objects: Vec<StagedObject> },
    Loaded(LoadReport),
    Merged(MergeReport),
    Removed { objects: Vec<String> },
    Archived { files: Vec<PathBuf> },
}

pub struct StepContext<'a> {
    pub run_id: Uuid,
    pub config: &'a PipelineConfig,
    pub credentials: &'a WarehouseCredentials,
    pub warehouse: &'a dyn Warehouse,
    pub ledger: &'a dyn BatchLedger,
    pub batch: &'a [BatchFile],
}

impl StepContext<'_> {
    async fn mark_all(&self, mark: LedgerMark) -> Result<()> {
        for file in self.batch {
            self.mark(file, mark).await?;
        }
        Ok(())
    }

    async fn mark(&self, file: &BatchFile, mark: LedgerMark) -> Result<()> {
        let key = FileKey {
            run_id: self.run_id,
            file_name: &file.name,
            file_hash: &file.hash,
        };
        self.ledger.mark(&key, mark).await
    }
}

/// Uploads every batch file to the raw stage, overwriting same-named objects.
pub async fn stage_files(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let stage = ctx.config.warehouse.stage();
    let mut objects = Vec::with_capacity(ctx.batch.len());

    for file in ctx.batch {
        let staged = ctx
            .warehouse
            .put(ctx.credentials, file, &stage)
            .await
            .map_err(|source| PipelineError::Transfer {
                file: file.name.clone(),
                source,
            })?;
        info!(file = %file.name, bytes = staged.bytes, stage = %stage, "staged batch file");
        ctx.mark(file, LedgerMark::Staged).await?;
        objects.push(staged);
    }

    Ok(StepOutput::Staged { objects })
}

/// Rebuilds the raw table from the staged batch.
pub async fn load_raw(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let plan = RawLoadPlan::from_config(ctx.config);

    let report = match ctx.warehouse.load_raw(ctx.credentials, &plan).await {
        Ok(report) => report,
        Err(RawLoadError {
            phase: RawLoadPhase::Load,
            source,
        }) => return Err(PipelineError::LoadAbort { source }),
        Err(RawLoadError { source, .. }) => return Err(PipelineError::Warehouse(source)),
    };

    if report.rows_loaded == 0 {
        warn!(table = %plan.table, "raw load matched no rows");
    }
    info!(
        table = %plan.table,
        rows = report.rows_loaded,
        files = report.files.len(),
        "raw table loaded"
    );
    Ok(StepOutput::Loaded(report))
}

pub async fn upsert(ctx: &StepContext<'_>, spec: &MergeSpec) -> Result<StepOutput> {
    if spec.dedup == DedupPolicy::Distinct {
        warn!(
            table = %spec.target,
            key = spec.key,
            "distinct dedup fails when one batch carries conflicting attributes for a key"
        );
    }

    let report = ctx
        .warehouse
        .merge(ctx.credentials, spec)
        .await
        .map_err(|source| PipelineError::Merge {
            target: spec.target.to_string(),
            source,
        })?;
    info!(
        table = %spec.target,
        inserted = report.inserted,
        updated = report.updated,
        "merge applied"
    );
    Ok(StepOutput::Merged(report))
}

/// Fact-table upsert. Once it lands the batch counts as loaded and only
/// cleanup remains.
pub async fn upsert_fact(ctx: &StepContext<'_>, spec: &MergeSpec) -> Result<StepOutput> {
    let output = upsert(ctx, spec).await?;
    ctx.mark_all(LedgerMark::Loaded).await?;
    Ok(output)
}

/// Deletes the batch from the raw stage.
pub async fn remove_staged(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let stage = ctx.config.warehouse.stage();
    let objects = ctx
        .warehouse
        .remove(ctx.credentials, &stage, &ctx.config.batch)
        .await?;
    info!(stage = %stage, removed = objects.len(), "removed staged objects");
    ctx.mark_all(LedgerMark::StageRemoved).await?;
    Ok(StepOutput::Removed { objects })
}

/// Moves every local batch file into the processed directory.
pub async fn archive_local(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let processed = ctx.config.processed_path();
    tokio::fs::create_dir_all(&processed)
        .await
        .map_err(|source| PipelineError::Archive {
            path: processed.clone(),
            source,
        })?;

    let mut files = Vec::with_capacity(ctx.batch.len());
    for file in ctx.batch {
        let destination = processed.join(&file.name);
        move_file(&file.path, &destination)
            .await
            .map_err(|source| PipelineError::Archive {
                path: file.path.clone(),
                source,
            })?;
        info!(file = %file.name, destination = %destination.display(), "archived batch file");
        ctx.mark(file, LedgerMark::Archived).await?;
        files.push(destination);
    }

    Ok(StepOutput::Archived { files })
}

/// Renames `from` to `to`, replacing `to`. Falls back to copy and delete when
/// the rename fails, e.g. across filesystems.
pub async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Err(rename_err) = tokio::fs::rename(from, to).await {
        tokio::fs::copy(from, to).await.map_err(|_| rename_err)?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}
