// crates/cafe-core/src/ledger/postgres.rs

use async_trait::async_trait;
use sqlx::Row;

use super::{BatchLedger, BatchState, FileKey, LedgerEntry, LedgerMark, RunSummary};
use crate::db::DbPool;
use crate::driver::RunReport;
use crate::error::Result;

/// Ledger in the `batch_files` and `pipeline_runs` tables. Each mark is a
/// single upsert, so concurrent cleanup steps never overwrite each other.
#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn mark_statement(mark: LedgerMark) -> &'static str {
    match mark {
        LedgerMark::Staged => {
            r#"
                INSERT INTO batch_files (run_id, file_name, file_hash, state)
                VALUES ($1, $2, $3, 'staged')
                ON CONFLICT (run_id, file_name)
                DO UPDATE SET
                    file_hash = EXCLUDED.file_hash,
                    state = 'staged',
                    updated_at = now()
            "#
        }
        LedgerMark::Loaded => {
            r#"
                INSERT INTO batch_files (run_id, file_name, file_hash, state)
                VALUES ($1, $2, $3, 'loaded')
                ON CONFLICT (run_id, file_name)
                DO UPDATE SET
                    state = CASE
                        WHEN batch_files.stage_removed AND batch_files.archived THEN 'completed'
                        ELSE 'loaded'
                    END,
                    updated_at = now()
            "#
        }
        LedgerMark::StageRemoved => {
            r#"
                INSERT INTO batch_files (run_id, file_name, file_hash, state, stage_removed)
                VALUES ($1, $2, $3, 'loaded', TRUE)
                ON CONFLICT (run_id, file_name)
                DO UPDATE SET
                    stage_removed = TRUE,
                    state = CASE WHEN batch_files.archived THEN 'completed' ELSE batch_files.state END,
                    updated_at = now()
            "#
        }
        LedgerMark::Archived => {
            r#"
                INSERT INTO batch_files (run_id, file_name, file_hash, state, archived)
                VALUES ($1, $2, $3, 'loaded', TRUE)
                ON CONFLICT (run_id, file_name)
                DO UPDATE SET
                    archived = TRUE,
                    state = CASE WHEN batch_files.stage_removed THEN 'completed' ELSE batch_files.state END,
                    updated_at = now()
            "#
        }
    }
}

const ABANDON_EARLIER: &str = r#"
    UPDATE batch_files
    SET state = 'abandoned', updated_at = now()
    WHERE file_name = $1 AND run_id <> $2 AND state = 'staged'
"#;

#[async_trait]
impl BatchLedger for PgLedger {
    async fn mark(&self, key: &FileKey<'_>, mark: LedgerMark) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(mark_statement(mark))
            .bind(key.run_id)
            .bind(key.file_name)
            .bind(key.file_hash)
            .execute(&mut *tx)
            .await?;
        if mark == LedgerMark::Staged {
            sqlx::query(ABANDON_EARLIER)
                .bind(key.file_name)
                .bind(key.run_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
                SELECT run_id, file_name, file_hash, state, stage_removed, archived, updated_at
                FROM batch_files
                ORDER BY updated_at, file_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                Ok(LedgerEntry {
                    run_id: row.try_get("run_id")?,
                    file_name: row.try_get("file_name")?,
                    file_hash: row.try_get("file_hash")?,
                    state: BatchState::parse(&state)?,
                    stage_removed: row.try_get("stage_removed")?,
                    archived: row.try_get("archived")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        let status = serde_json::to_value(report.status)?;
        let status = status.as_str().unwrap_or_default().to_string();
        let document = serde_json::to_value(report)?;

        sqlx::query(
            r#"
                INSERT INTO pipeline_runs (run_id, status, started_at, finished_at, report)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (run_id)
                DO UPDATE SET
                    status = EXCLUDED.status,
                    finished_at = EXCLUDED.finished_at,
                    report = EXCLUDED.report
            "#,
        )
        .bind(report.run_id)
        .bind(status)
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn runs(&self) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query("SELECT report FROM pipeline_runs ORDER BY started_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let report: serde_json::Value = row.try_get("report")?;
                Ok(serde_json::from_value(report)?)
            })
            .collect()
    }
}
