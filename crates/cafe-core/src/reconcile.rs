// crates/cafe-core/src/reconcile.rs

//! Completes the cleanup of files whose load succeeded but whose stage
//! removal or local archive did not. Planning is read-only; applying performs
//! only the missing half for each file.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::credentials::WarehouseCredentials;
use crate::error::Result;
use crate::ledger::{BatchLedger, FileKey, LedgerMark};
use crate::steps::move_file;
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileAction {
    pub run_id: Uuid,
    pub file_name: String,
    pub file_hash: String,
    pub remove_from_stage: bool,
    pub archive_local: bool,
}

impl ReconcileAction {
    fn key(&self) -> FileKey<'_> {
        FileKey {
            run_id: self.run_id,
            file_name: &self.file_name,
            file_hash: &self.file_hash,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
}

impl ReconcilePlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn needs_stage_removal(&self) -> bool {
        self.actions.iter().any(|action| action.remove_from_stage)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub removed_objects: Vec<String>,
    pub archived: Vec<String>,
    /// Files that were neither in the source nor in the processed directory.
    pub missing: Vec<String>,
}

pub async fn plan(ledger: &dyn BatchLedger) -> Result<ReconcilePlan> {
    let actions = ledger
        .entries()
        .await?
        .into_iter()
        .filter(|entry| entry.needs_cleanup())
        .map(|entry| ReconcileAction {
            remove_from_stage: !entry.stage_removed,
            archive_local: !entry.archived,
            run_id: entry.run_id,
            file_name: entry.file_name,
            file_hash: entry.file_hash,
        })
        .collect();
    Ok(ReconcilePlan { actions })
}

pub async fn apply(
    plan: &ReconcilePlan,
    config: &PipelineConfig,
    credentials: &WarehouseCredentials,
    warehouse: &dyn Warehouse,
    ledger: &dyn BatchLedger,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    if plan.needs_stage_removal() {
        let stage = config.warehouse.stage();
        outcome.removed_objects = warehouse.remove(credentials, &stage, &config.batch).await?;
        info!(stage = %stage, removed = outcome.removed_objects.len(), "reconciled stage");
        for action in plan.actions.iter().filter(|action| action.remove_from_stage) {
            ledger.mark(&action.key(), LedgerMark::StageRemoved).await?;
        }
    }

    let source_dir = config.source_path();
    let processed_dir = config.processed_path();
    for action in plan.actions.iter().filter(|action| action.archive_local) {
        let source = source_dir.join(&action.file_name);
        let destination = processed_dir.join(&action.file_name);

        if source.is_file() {
            tokio::fs::create_dir_all(&processed_dir).await?;
            move_file(&source, &destination).await?;
            info!(file = %action.file_name, "archived batch file");
        } else if !destination.is_file() {
            warn!(file = %action.file_name, "batch file is in neither the source nor the processed directory");
            outcome.missing.push(action.file_name.clone());
            continue;
        }

        ledger.mark(&action.key(), LedgerMark::Archived).await?;
        outcome.archived.push(action.file_name.clone());
    }

    Ok(outcome)
}
