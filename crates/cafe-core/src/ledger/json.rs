// crates/cafe-core/src/ledger/json.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{BatchLedger, FileKey, LedgerEntry, LedgerMark, RunSummary};
use crate::driver::RunReport;
use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    files: Vec<LedgerEntry>,
    #[serde(default)]
    runs: Vec<RunSummary>,
}

/// Ledger kept in one JSON document next to the batch directories. Every
/// update rewrites the document through a temporary file under a lock.
#[derive(Debug)]
pub struct JsonLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<LedgerDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(LedgerDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LedgerDocument::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, document: &LedgerDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(document)?).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchLedger for JsonLedger {
    async fn mark(&self, key: &FileKey<'_>, mark: LedgerMark) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let now = Utc::now();

        let position = document
            .files
            .iter()
            .position(|entry| entry.run_id == key.run_id && entry.file_name == key.file_name);
        let entry = match position {
            Some(position) => &mut document.files[position],
            None => {
                document.files.push(LedgerEntry::new(key, now));
                let last = document.files.len() - 1;
                &mut document.files[last]
            }
        };
        if mark == LedgerMark::Staged {
            entry.file_hash = key.file_hash.to_string();
        }
        entry.apply(mark, now);

        if mark == LedgerMark::Staged {
            for earlier in document.files.iter_mut() {
                earlier.supersede(key, now);
            }
        }

        self.write(&document).await
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.files)
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        document.runs.retain(|run| run.run_id != report.run_id);
        document.runs.push(RunSummary::from(report));
        self.write(&document).await
    }

    async fn runs(&self) -> Result<Vec<RunSummary>> {
        let _guard = self.lock.lock().await;
        let mut runs = self.read().await?.runs;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
