// crates/cafe-core/src/error.rs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::GraphError;
use crate::warehouse::WarehouseError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("connection profile '{conn_id}' was not found")]
    ConnectionNotFound { conn_id: String },

    #[error("connection profile '{conn_id}' is malformed: {reason}")]
    MalformedProfile { conn_id: String, reason: String },

    #[error("failed to stage {file}: {source}")]
    Transfer {
        file: String,
        #[source]
        source: WarehouseError,
    },

    #[error("raw load aborted: {source}")]
    LoadAbort {
        #[source]
        source: WarehouseError,
    },

    #[error("merge into {target} failed: {source}")]
    Merge {
        target: String,
        #[source]
        source: WarehouseError,
    },

    #[error("cleanup partially failed: {succeeded} succeeded but {failed} failed")]
    CleanupPartialFailure { succeeded: String, failed: String },

    #[error("Warehouse operation failed: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("{file} does not match the raw column descriptor: {source}")]
    Schema {
        file: String,
        #[source]
        source: cafe_parser::ParserError,
    },

    #[error("failed to archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch ledger error: {0}")]
    Ledger(String),

    #[error("Task graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid batch pattern: {0}")]
    Pattern(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "runtime")]
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Ledger(err.to_string())
    }
}

/// Stable, serialisable classification of a [`PipelineError`] for run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionNotFound,
    MalformedProfile,
    TransferError,
    LoadAbort,
    MergeError,
    CleanupPartialFailure,
    WarehouseError,
    SchemaMismatch,
    ArchiveError,
    LedgerError,
    Internal,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::ConnectionNotFound { .. } => FailureKind::ConnectionNotFound,
            PipelineError::MalformedProfile { .. } => FailureKind::MalformedProfile,
            PipelineError::Transfer { .. } => FailureKind::TransferError,
            PipelineError::LoadAbort { .. } => FailureKind::LoadAbort,
            PipelineError::Merge { .. } => FailureKind::MergeError,
            PipelineError::CleanupPartialFailure { .. } => FailureKind::CleanupPartialFailure,
            PipelineError::Warehouse(_) => FailureKind::WarehouseError,
            PipelineError::Schema { .. } => FailureKind::SchemaMismatch,
            PipelineError::Archive { .. } => FailureKind::ArchiveError,
            PipelineError::Ledger(_) => FailureKind::LedgerError,
            PipelineError::Graph(_)
            | PipelineError::Config(_)
            | PipelineError::Pattern(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_) => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
