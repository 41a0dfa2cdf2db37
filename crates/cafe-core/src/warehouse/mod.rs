// crates/cafe-core/src/warehouse/mod.rs

//! Warehouse seam. Steps talk to a [`Warehouse`]; the Snowflake backend and
//! the in-process engine both implement it.

pub mod memory;
#[cfg(feature = "runtime")]
pub mod snowflake;

use std::fmt;

use async_trait::async_trait;
use cafe_parser::{ColumnSpec, FileFormat, CAFE_FILE_FORMAT, RAW_COLUMNS};
use serde::Serialize;
use thiserror::Error;

use crate::batch::{BatchFile, BatchPattern};
use crate::config::PipelineConfig;
use crate::credentials::WarehouseCredentials;
use crate::merge::{MergeSpec, TableDef};
use crate::sql::ObjectName;

pub use memory::MemoryWarehouse;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("statement failed{}: {message}", code_suffix(.code))]
    Statement {
        code: Option<String>,
        message: String,
    },

    #[error("load rejected{}: {message}", location_suffix(.file, .line))]
    LoadRejected {
        file: Option<String>,
        line: Option<u64>,
        message: String,
    },

    #[error("merge into {target} is non-deterministic: source rows disagree for {key} = {value}")]
    NondeterministicMerge {
        target: String,
        key: String,
        value: String,
    },

    #[error("object {0} does not exist")]
    MissingObject(String),

    #[error("stage error: {0}")]
    Stage(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|code| format!(" ({code})"))
        .unwrap_or_default()
}

fn location_suffix(file: &Option<String>, line: &Option<u64>) -> String {
    match (file, line) {
        (Some(file), Some(line)) => format!(" in {file} at line {line}"),
        (Some(file), None) => format!(" in {file}"),
        (None, Some(line)) => format!(" at line {line}"),
        (None, None) => String::new(),
    }
}

/// Which statement of the raw load failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawLoadPhase {
    Schema,
    Format,
    Load,
}

impl fmt::Display for RawLoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RawLoadPhase::Schema => "schema",
            RawLoadPhase::Format => "format",
            RawLoadPhase::Load => "load",
        })
    }
}

#[derive(Debug, Error)]
#[error("raw load failed in {phase} phase: {source}")]
pub struct RawLoadError {
    pub phase: RawLoadPhase,
    #[source]
    pub source: WarehouseError,
}

impl RawLoadError {
    pub fn new(phase: RawLoadPhase, source: WarehouseError) -> Self {
        Self { phase, source }
    }
}

/// Inputs of the recreate / format / copy sequence.
#[derive(Debug, Clone)]
pub struct RawLoadPlan {
    pub table: ObjectName,
    pub columns: &'static [ColumnSpec],
    pub format_name: ObjectName,
    pub format: FileFormat,
    pub stage: ObjectName,
    pub pattern: BatchPattern,
}

impl RawLoadPlan {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            table: config.warehouse.raw_table(),
            columns: &RAW_COLUMNS,
            format_name: config.warehouse.file_format(),
            format: CAFE_FILE_FORMAT,
            stage: config.warehouse.stage(),
            pattern: config.batch.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedObject {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub files: Vec<String>,
    pub rows_loaded: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub target: String,
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Uploads one local file into `stage`, overwriting any object of the same name.
    async fn put(
        &self,
        credentials: &WarehouseCredentials,
        file: &BatchFile,
        stage: &ObjectName,
    ) -> Result<StagedObject, WarehouseError>;

    /// Recreates the raw table, declares the session file format and copies
    /// every matching staged object, all within one session. Either every
    /// row lands or the table stays empty.
    async fn load_raw(
        &self,
        credentials: &WarehouseCredentials,
        plan: &RawLoadPlan,
    ) -> Result<LoadReport, RawLoadError>;

    async fn merge(
        &self,
        credentials: &WarehouseCredentials,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError>;

    /// Deletes staged objects whose path matches `pattern`. Returns the removed names.
    async fn remove(
        &self,
        credentials: &WarehouseCredentials,
        stage: &ObjectName,
        pattern: &BatchPattern,
    ) -> Result<Vec<String>, WarehouseError>;

    async fn create_table(
        &self,
        credentials: &WarehouseCredentials,
        table: &TableDef,
    ) -> Result<(), WarehouseError>;
}
