// crates/cafe-core/src/ledger/mod.rs

//! Per-file progress through stage, load and cleanup. Cleanup steps run
//! concurrently, so each one records its own flag; an entry is complete only
//! when both the stage removal and the local archive are recorded.

mod json;
#[cfg(feature = "runtime")]
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{LedgerKind, PipelineConfig};
use crate::driver::{FailureSummary, RunReport, RunStatus};
use crate::error::{PipelineError, Result};

pub use json::JsonLedger;
#[cfg(feature = "runtime")]
pub use postgres::PgLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Staged,
    /// Merged into the fact table; cleanup pending.
    Loaded,
    Completed,
    /// Never loaded; a later run staged the same file again.
    Abandoned,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Staged => "staged",
            BatchState::Loaded => "loaded",
            BatchState::Completed => "completed",
            BatchState::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "staged" => Ok(BatchState::Staged),
            "loaded" => Ok(BatchState::Loaded),
            "completed" => Ok(BatchState::Completed),
            "abandoned" => Ok(BatchState::Abandoned),
            other => Err(PipelineError::Ledger(format!("unknown batch state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMark {
    Staged,
    Loaded,
    StageRemoved,
    Archived,
}

/// Identifies a batch file within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileKey<'a> {
    pub run_id: Uuid,
    pub file_name: &'a str,
    pub file_hash: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: Uuid,
    pub file_name: String,
    pub file_hash: String,
    pub state: BatchState,
    pub stage_removed: bool,
    pub archived: bool,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(key: &FileKey<'_>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: key.run_id,
            file_name: key.file_name.to_string(),
            file_hash: key.file_hash.to_string(),
            state: BatchState::Staged,
            stage_removed: false,
            archived: false,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, mark: LedgerMark, now: DateTime<Utc>) {
        match mark {
            LedgerMark::Staged => self.state = BatchState::Staged,
            LedgerMark::Loaded => self.state = BatchState::Loaded,
            LedgerMark::StageRemoved => self.stage_removed = true,
            LedgerMark::Archived => self.archived = true,
        }
        if self.stage_removed && self.archived {
            self.state = BatchState::Completed;
        }
        self.updated_at = now;
    }

    /// Abandons this entry when another run's `key` stages the same file
    /// name while this one never got past `staged`.
    pub fn supersede(&mut self, key: &FileKey<'_>, now: DateTime<Utc>) {
        if self.state == BatchState::Staged
            && self.run_id != key.run_id
            && self.file_name == key.file_name
        {
            self.state = BatchState::Abandoned;
            self.updated_at = now;
        }
    }

    /// Loaded into the fact table but cleanup has not finished.
    pub fn needs_cleanup(&self) -> bool {
        self.state == BatchState::Loaded
    }
}

/// What the ledger keeps about each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<String>,
    pub failure: Option<FailureSummary>,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id,
            status: report.status,
            started_at: report.started_at,
            finished_at: report.finished_at,
            files: report.files.clone(),
            failure: report.failure.clone(),
        }
    }
}

#[async_trait]
pub trait BatchLedger: Send + Sync {
    /// Applies `mark` to the entry for `key`, creating it when absent. A
    /// `Staged` mark also abandons earlier entries for the same file name
    /// that never got past `staged`.
    async fn mark(&self, key: &FileKey<'_>, mark: LedgerMark) -> Result<()>;

    async fn entries(&self) -> Result<Vec<LedgerEntry>>;

    async fn record_run(&self, report: &RunReport) -> Result<()>;

    /// Most recent first.
    async fn runs(&self) -> Result<Vec<RunSummary>>;
}

/// Opens the ledger selected by `config.ledger`.
pub async fn open(config: &PipelineConfig) -> Result<Arc<dyn BatchLedger>> {
    match config.ledger.kind {
        LedgerKind::Json => Ok(Arc::new(JsonLedger::new(config.ledger_path()))),
        LedgerKind::Postgres => open_postgres(config).await,
    }
}

#[cfg(feature = "runtime")]
async fn open_postgres(config: &PipelineConfig) -> Result<Arc<dyn BatchLedger>> {
    let url = config.ledger.database_url.as_deref().ok_or_else(|| {
        PipelineError::Config(
            "postgres ledger requires CAFE_LEDGER_DATABASE_URL or DATABASE_URL".to_string(),
        )
    })?;
    let pool = crate::db::connect(url)
        .await
        .map_err(|err| PipelineError::Ledger(format!("{err:#}")))?;
    Ok(Arc::new(PgLedger::new(pool)))
}

#[cfg(not(feature = "runtime"))]
async fn open_postgres(_config: &PipelineConfig) -> Result<Arc<dyn BatchLedger>> {
    Err(PipelineError::Config(
        "postgres ledger is unavailable without the `runtime` feature".to_string(),
    ))
}
