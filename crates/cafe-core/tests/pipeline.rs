use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cafe_core::batch::{BatchFile, BatchPattern};
use cafe_core::config::PipelineConfig;
use cafe_core::credentials::{ConnectionProfile, StaticProfileStore, WarehouseCredentials};
use cafe_core::driver::{
    PipelineDriver, RunReport, RunStatus, ARCHIVE_LOCAL, END, LOAD_RAW, REMOVE_STAGED,
    STAGE_FILES, UPSERT_PRODUCT, UPSERT_SALES, UPSERT_STORE,
};
use cafe_core::error::{FailureKind, PipelineError};
use cafe_core::graph::TaskStatus;
use cafe_core::ledger::{BatchLedger, BatchState, JsonLedger};
use cafe_core::merge::{self, DedupPolicy, MergeSpec, TableDef};
use cafe_core::reconcile;
use cafe_core::sql::ObjectName;
use cafe_core::steps::StepOutput;
use cafe_core::warehouse::{
    LoadReport, MergeReport, MemoryWarehouse, RawLoadError, RawLoadPlan, StagedObject, Warehouse,
    WarehouseError,
};
use cafe_parser::{Decimal, Value};
use tempfile::TempDir;

const BATCH_FILE: &str = "coffee_shop_sales_2023_01.csv";
const HEADER: &str = "transaction_id;transaction_date;transaction_time;store_id;store_location;product_id;transaction_qty;unit_price;product_category;product_type;product_detail;Size;Total_bill;Month Name;Day Name;Hour;Day of Week;Month";

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../cafe-parser/tests/data")
        .join(name)
}

fn credentials() -> WarehouseCredentials {
    WarehouseCredentials {
        login: "loader".into(),
        secret: "hunter2".into(),
        account: "xy12345".into(),
        region: None,
    }
}

fn profiles() -> StaticProfileStore {
    StaticProfileStore::new().with_profile(
        "snowflake_conn",
        ConnectionProfile {
            conn_type: Some("snowflake".into()),
            login: Some("loader".into()),
            password: Some("hunter2".into()),
            extra: Some(r#"{"account":"xy12345"}"#.into()),
        },
    )
}

struct Harness {
    _home: TempDir,
    config: PipelineConfig,
    warehouse: Arc<MemoryWarehouse>,
    ledger: Arc<JsonLedger>,
}

impl Harness {
    async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    async fn with_config(adjust: impl FnOnce(&mut PipelineConfig)) -> Result<Self> {
        let home = TempDir::new()?;
        let mut config = PipelineConfig {
            home: home.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        adjust(&mut config);
        std::fs::create_dir_all(config.source_path())?;

        let warehouse = Arc::new(MemoryWarehouse::new());
        for spec in merge::star_schema(&config.warehouse) {
            warehouse.create_table(&credentials(), &spec.table_def()).await?;
        }
        let ledger = Arc::new(JsonLedger::new(config.ledger_path()));

        Ok(Self {
            _home: home,
            config,
            warehouse,
            ledger,
        })
    }

    fn add_fixture(&self, name: &str) -> Result<PathBuf> {
        let destination = self.config.source_path().join(name);
        std::fs::copy(fixture_path(name), &destination)?;
        Ok(destination)
    }

    fn add_batch(&self, name: &str, rows: &[&str]) -> Result<PathBuf> {
        let mut contents = String::from(HEADER);
        for row in rows {
            contents.push('\n');
            contents.push_str(row);
        }
        contents.push('\n');
        let destination = self.config.source_path().join(name);
        std::fs::write(&destination, contents)?;
        Ok(destination)
    }

    fn driver(&self) -> PipelineDriver {
        PipelineDriver::new(self.config.clone(), self.warehouse.clone(), self.ledger.clone())
    }

    async fn run(&self) -> Result<RunReport> {
        Ok(self.driver().run(&profiles()).await?)
    }

    fn table(&self, name: &ObjectName) -> cafe_core::warehouse::memory::Table {
        self.warehouse.table(name).unwrap_or_default()
    }
}

fn merged(report: &RunReport, task: &str) -> MergeReport {
    match report.task(task).and_then(|record| record.output.clone()) {
        Some(StepOutput::Merged(merge)) => merge,
        other => panic!("expected merge output for {task}, got {other:?}"),
    }
}

#[tokio::test]
async fn first_batch_populates_star_schema_and_cleans_up() -> Result<()> {
    let harness = Harness::new().await?;
    let source = harness.add_fixture(BATCH_FILE)?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.failure);
    assert_eq!(report.files, vec![BATCH_FILE.to_string()]);
    for task in [STAGE_FILES, LOAD_RAW, UPSERT_PRODUCT, UPSERT_STORE, UPSERT_SALES, REMOVE_STAGED, ARCHIVE_LOCAL, END] {
        assert_eq!(report.task_status(task), Some(TaskStatus::Succeeded), "{task}");
    }

    let objects = &harness.config.warehouse;
    assert_eq!(harness.table(&objects.raw_table()).len(), 3);
    assert_eq!(harness.table(&objects.sales_table()).len(), 3);
    assert_eq!(harness.table(&objects.product_table()).len(), 2);

    let stores = harness.table(&objects.store_table());
    assert_eq!(stores.len(), 2);
    assert_eq!(
        stores.lookup("STORE_ID", &Value::Integer(8), "STORE_LOCATION"),
        Some(&Value::Text("Hell's Kitchen".into()))
    );

    let sales = harness.table(&objects.sales_table());
    assert_eq!(
        sales.lookup("TRANSACTION_ID", &Value::Integer(2), "UNIT_PRICE"),
        Some(&Value::Decimal(Decimal::new(31, 1)))
    );

    assert!(harness.warehouse.staged_objects(&objects.stage()).is_empty());
    assert!(!source.exists());
    assert!(harness.config.processed_path().join(BATCH_FILE).is_file());

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, BatchState::Completed);
    assert!(entries[0].stage_removed && entries[0].archived);

    let runs = harness.ledger.runs().await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, report.run_id);
    Ok(())
}

#[tokio::test]
async fn rerunning_the_same_batch_updates_instead_of_duplicating() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture(BATCH_FILE)?;
    harness.run().await?;

    harness.add_fixture(BATCH_FILE)?;
    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.failure);
    let sales = merged(&report, UPSERT_SALES);
    assert_eq!((sales.inserted, sales.updated), (0, 3));
    let products = merged(&report, UPSERT_PRODUCT);
    assert_eq!((products.inserted, products.updated), (0, 2));

    let objects = &harness.config.warehouse;
    assert_eq!(harness.table(&objects.sales_table()).len(), 3);
    assert_eq!(harness.table(&objects.product_table()).len(), 2);
    assert_eq!(harness.table(&objects.store_table()).len(), 2);
    Ok(())
}

#[tokio::test]
async fn corrected_rows_overwrite_existing_facts() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture(BATCH_FILE)?;
    harness.run().await?;

    let original = std::fs::read_to_string(fixture_path(BATCH_FILE))?;
    let corrected = original.replace(";57;2;", ";57;5;");
    assert_ne!(original, corrected);
    std::fs::write(harness.config.source_path().join(BATCH_FILE), corrected)?;

    let report = harness.run().await?;
    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.failure);

    let sales = harness.table(&harness.config.warehouse.sales_table());
    assert_eq!(sales.len(), 3);
    assert_eq!(
        sales.lookup("TRANSACTION_ID", &Value::Integer(2), "TRANSACTION_QTY"),
        Some(&Value::Integer(5))
    );
    Ok(())
}

#[tokio::test]
async fn malformed_row_aborts_the_load_and_keeps_the_source_file() -> Result<()> {
    let harness = Harness::new().await?;
    let source = harness.add_fixture("coffee_shop_sales_malformed.csv")?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.clone().expect("failure summary");
    assert_eq!(failure.kind, FailureKind::LoadAbort);
    assert_eq!(failure.task, LOAD_RAW);

    assert_eq!(report.task_status(STAGE_FILES), Some(TaskStatus::Succeeded));
    assert_eq!(report.task_status(LOAD_RAW), Some(TaskStatus::Failed));
    for task in [UPSERT_PRODUCT, UPSERT_STORE, UPSERT_SALES, REMOVE_STAGED, ARCHIVE_LOCAL, END] {
        assert_eq!(report.task_status(task), Some(TaskStatus::Skipped), "{task}");
    }

    let objects = &harness.config.warehouse;
    assert!(harness.table(&objects.raw_table()).is_empty());
    assert!(harness.table(&objects.sales_table()).is_empty());
    assert!(source.is_file());
    assert_eq!(
        harness.warehouse.staged_objects(&objects.stage()),
        vec!["coffee_shop_sales_malformed.csv".to_string()]
    );

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries[0].state, BatchState::Staged);
    assert!(reconcile::plan(harness.ledger.as_ref()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn corrected_retry_abandons_the_failed_entry() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture("coffee_shop_sales_malformed.csv")?;
    let failed = harness.run().await?;
    assert_eq!(failed.status, RunStatus::Failed);

    harness.add_batch(
        "coffee_shop_sales_malformed.csv",
        &["10;01/02/2023;08:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;Old Blend;Regular;2.0;Feb;Wed;8;3;2"],
    )?;
    let retried = harness.run().await?;
    assert_eq!(retried.status, RunStatus::Succeeded, "{:?}", retried.failure);

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        let expected = if entry.run_id == failed.run_id {
            BatchState::Abandoned
        } else {
            BatchState::Completed
        };
        assert_eq!(entry.state, expected, "{}", entry.run_id);
    }
    assert!(reconcile::plan(harness.ledger.as_ref()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_source_directory_skips_the_run() -> Result<()> {
    let harness = Harness::new().await?;
    std::fs::write(harness.config.source_path().join("notes.txt"), "not a batch")?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Skipped);
    assert!(report.tasks.is_empty());
    assert!(report.failure.is_none());
    assert_eq!(harness.ledger.runs().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_connection_fails_before_any_task() -> Result<()> {
    let harness = Harness::with_config(|config| config.connection_id = "missing_conn".into()).await?;
    let source = harness.add_fixture(BATCH_FILE)?;

    let err = harness
        .driver()
        .run(&profiles())
        .await
        .expect_err("connection lookup should fail");

    assert!(matches!(err, PipelineError::ConnectionNotFound { ref conn_id } if conn_id == "missing_conn"));
    assert_eq!(err.kind(), FailureKind::ConnectionNotFound);
    assert!(source.is_file());
    assert!(harness.ledger.runs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn header_with_wrong_field_count_fails_preflight() -> Result<()> {
    let harness = Harness::new().await?;
    let short_header = HEADER.rsplit_once(';').map(|(head, _)| head).unwrap_or(HEADER);
    std::fs::write(
        harness.config.source_path().join("coffee_shop_sales_short.csv"),
        format!("{short_header}\n"),
    )?;

    let err = harness.run().await.expect_err("preflight should fail");
    let err = err.downcast::<PipelineError>()?;
    assert!(matches!(err, PipelineError::Schema { ref file, .. } if file == "coffee_shop_sales_short.csv"));
    assert!(harness
        .warehouse
        .staged_objects(&harness.config.warehouse.stage())
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn latest_transaction_wins_for_dimension_attributes() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_batch(
        "coffee_shop_sales_2023_02.csv",
        &[
            "11;02/02/2023;09:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;New Blend;Regular;2.0;Feb;Thu;9;4;2",
            "10;01/02/2023;08:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;Old Blend;Regular;2.0;Feb;Wed;8;3;2",
        ],
    )?;

    let report = harness.run().await?;
    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.failure);

    let products = harness.table(&harness.config.warehouse.product_table());
    assert_eq!(products.len(), 1);
    assert_eq!(
        products.lookup("PRODUCT_ID", &Value::Integer(22), "PRODUCT_DETAIL"),
        Some(&Value::Text("New Blend".into()))
    );
    assert_eq!(harness.table(&harness.config.warehouse.sales_table()).len(), 2);
    Ok(())
}

#[tokio::test]
async fn distinct_policy_rejects_conflicting_dimension_rows() -> Result<()> {
    let harness =
        Harness::with_config(|config| config.warehouse.dedup = DedupPolicy::Distinct).await?;
    let source = harness.add_batch(
        "coffee_shop_sales_2023_02.csv",
        &[
            "10;01/02/2023;08:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;Old Blend;Regular;2.0;Feb;Wed;8;3;2",
            "11;02/02/2023;09:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;New Blend;Regular;2.0;Feb;Thu;9;4;2",
        ],
    )?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.clone().expect("failure summary");
    assert_eq!(failure.kind, FailureKind::MergeError);
    assert_eq!(failure.task, UPSERT_PRODUCT);

    assert_eq!(report.task_status(UPSERT_PRODUCT), Some(TaskStatus::Failed));
    assert_eq!(report.task_status(UPSERT_STORE), Some(TaskStatus::Succeeded));
    for task in [UPSERT_SALES, REMOVE_STAGED, ARCHIVE_LOCAL, END] {
        assert_eq!(report.task_status(task), Some(TaskStatus::Skipped), "{task}");
    }

    assert!(harness.table(&harness.config.warehouse.product_table()).is_empty());
    assert_eq!(harness.table(&harness.config.warehouse.store_table()).len(), 1);
    assert!(source.is_file());
    Ok(())
}

#[tokio::test]
async fn every_file_in_the_batch_is_loaded_and_cleaned_up() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture(BATCH_FILE)?;
    harness.add_batch(
        "coffee_shop_sales_2023_02.csv",
        &[
            "10;01/02/2023;08:00:00;3;Astoria;22;1;2.0;Coffee;Drip coffee;Our Old Time Diner Blend Sm;Small;2.0;Feb;Wed;8;3;2",
            "11;02/02/2023;09:00:00;5;Lower Manhattan;57;1;3.1;Tea;Brewed Chai tea;Spicy Eye Opener Chai Lg;Large;3.1;Feb;Thu;9;4;2",
        ],
    )?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Succeeded, "{:?}", report.failure);
    assert_eq!(
        report.files,
        vec![BATCH_FILE.to_string(), "coffee_shop_sales_2023_02.csv".to_string()]
    );
    match report.task(LOAD_RAW).and_then(|record| record.output.clone()) {
        Some(StepOutput::Loaded(load)) => {
            assert_eq!(load.rows_loaded, 5);
            assert_eq!(load.files.len(), 2);
        }
        other => panic!("expected load output, got {other:?}"),
    }

    let objects = &harness.config.warehouse;
    assert_eq!(harness.table(&objects.raw_table()).len(), 5);
    assert_eq!(harness.table(&objects.sales_table()).len(), 5);
    assert_eq!(harness.table(&objects.product_table()).len(), 3);
    assert_eq!(harness.table(&objects.store_table()).len(), 3);

    assert!(harness.warehouse.staged_objects(&objects.stage()).is_empty());
    let processed = harness.config.processed_path();
    assert!(processed.join(BATCH_FILE).is_file());
    assert!(processed.join("coffee_shop_sales_2023_02.csv").is_file());
    assert!(!harness.config.source_path().join(BATCH_FILE).exists());

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.run_id == report.run_id && entry.state == BatchState::Completed));
    Ok(())
}

#[tokio::test]
async fn rows_without_a_key_stay_out_of_the_merged_tables() -> Result<()> {
    let harness = Harness::new().await?;
    let rows = [
        "20;03/02/2023;10:00:00;5;Lower Manhattan;32;1;3.0;Coffee;Gourmet brewed coffee;Ethiopia Rg;Regular;3.0;Feb;Fri;10;5;2",
        ";03/02/2023;10:05:00;5;Lower Manhattan;32;1;3.0;Coffee;Gourmet brewed coffee;Ethiopia Rg;Regular;3.0;Feb;Fri;10;5;2",
        "21;03/02/2023;10:10:00;;Astoria;33;1;2.5;Coffee;Gourmet brewed coffee;Columbian Medium Roast Sm;Small;2.5;Feb;Fri;10;5;2",
    ];

    for attempt in 0..3 {
        harness.add_batch("coffee_shop_sales_2023_03.csv", &rows)?;
        let report = harness.run().await?;
        assert_eq!(report.status, RunStatus::Succeeded, "run {attempt}: {:?}", report.failure);

        let objects = &harness.config.warehouse;
        assert_eq!(harness.table(&objects.raw_table()).len(), 3, "run {attempt}");
        assert_eq!(harness.table(&objects.sales_table()).len(), 2, "run {attempt}");
        assert_eq!(harness.table(&objects.store_table()).len(), 1, "run {attempt}");
        assert_eq!(harness.table(&objects.product_table()).len(), 2, "run {attempt}");
    }

    let stores = harness.table(&harness.config.warehouse.store_table());
    assert!(stores.rows.iter().all(|row| !row[0].is_null()));
    let sales = harness.table(&harness.config.warehouse.sales_table());
    assert_eq!(
        sales.lookup("TRANSACTION_ID", &Value::Integer(21), "STORE_ID"),
        Some(&Value::Null)
    );
    Ok(())
}

#[tokio::test]
async fn failed_upload_stops_the_run_before_the_load() -> Result<()> {
    let harness = Harness::new().await?;
    let source = harness.add_fixture(BATCH_FILE)?;
    let broken = Arc::new(FaultyWarehouse::refusing_put(harness.warehouse.clone()));
    let driver = PipelineDriver::new(harness.config.clone(), broken, harness.ledger.clone());

    let report = driver.run(&profiles()).await?;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.clone().expect("failure summary");
    assert_eq!(failure.kind, FailureKind::TransferError);
    assert_eq!(failure.task, STAGE_FILES);
    assert_eq!(report.task_status(STAGE_FILES), Some(TaskStatus::Failed));
    for task in [LOAD_RAW, UPSERT_PRODUCT, UPSERT_STORE, UPSERT_SALES, REMOVE_STAGED, ARCHIVE_LOCAL, END] {
        assert_eq!(report.task_status(task), Some(TaskStatus::Skipped), "{task}");
    }

    let objects = &harness.config.warehouse;
    assert!(source.is_file());
    assert!(harness.warehouse.staged_objects(&objects.stage()).is_empty());
    assert!(harness.table(&objects.raw_table()).is_empty());
    assert!(harness.ledger.entries().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_archive_is_reported_and_reconciled() -> Result<()> {
    let harness = Harness::new().await?;
    let source = harness.add_fixture(BATCH_FILE)?;
    let processed = harness.config.processed_path();
    std::fs::write(&processed, "not a directory")?;

    let report = harness.run().await?;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.clone().expect("failure summary");
    assert_eq!(failure.kind, FailureKind::CleanupPartialFailure);
    assert_eq!(failure.task, ARCHIVE_LOCAL);
    assert_eq!(report.task_status(REMOVE_STAGED), Some(TaskStatus::Succeeded));
    assert_eq!(report.task_status(ARCHIVE_LOCAL), Some(TaskStatus::Failed));
    assert_eq!(report.task_status(END), Some(TaskStatus::Skipped));

    let objects = &harness.config.warehouse;
    assert_eq!(harness.table(&objects.sales_table()).len(), 3);
    assert!(harness.warehouse.staged_objects(&objects.stage()).is_empty());
    assert!(source.is_file());

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries[0].state, BatchState::Loaded);
    assert!(entries[0].stage_removed && !entries[0].archived);

    let plan = reconcile::plan(harness.ledger.as_ref()).await?;
    assert_eq!(plan.len(), 1);
    assert!(!plan.actions[0].remove_from_stage);
    assert!(plan.actions[0].archive_local);

    let blocked = reconcile::apply(
        &plan,
        &harness.config,
        &credentials(),
        harness.warehouse.as_ref(),
        harness.ledger.as_ref(),
    )
    .await;
    assert!(blocked.is_err());
    assert_eq!(harness.ledger.entries().await?[0].state, BatchState::Loaded);

    std::fs::remove_file(&processed)?;
    let outcome = reconcile::apply(
        &plan,
        &harness.config,
        &credentials(),
        harness.warehouse.as_ref(),
        harness.ledger.as_ref(),
    )
    .await?;
    assert_eq!(outcome.archived, vec![BATCH_FILE.to_string()]);
    assert!(outcome.removed_objects.is_empty());
    assert!(!source.exists());
    assert!(processed.join(BATCH_FILE).is_file());

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries[0].state, BatchState::Completed);
    Ok(())
}

/// Delegates to a [`MemoryWarehouse`] but can refuse uploads or stage removal.
struct FaultyWarehouse {
    inner: Arc<MemoryWarehouse>,
    refuse_put: bool,
    refuse_remove: bool,
}

impl FaultyWarehouse {
    fn refusing_put(inner: Arc<MemoryWarehouse>) -> Self {
        Self {
            inner,
            refuse_put: true,
            refuse_remove: false,
        }
    }

    fn refusing_remove(inner: Arc<MemoryWarehouse>) -> Self {
        Self {
            inner,
            refuse_put: false,
            refuse_remove: true,
        }
    }
}

#[async_trait]
impl Warehouse for FaultyWarehouse {
    async fn put(
        &self,
        credentials: &WarehouseCredentials,
        file: &BatchFile,
        stage: &ObjectName,
    ) -> Result<StagedObject, WarehouseError> {
        if self.refuse_put {
            return Err(WarehouseError::Stage("upload connection reset".into()));
        }
        self.inner.put(credentials, file, stage).await
    }

    async fn load_raw(
        &self,
        credentials: &WarehouseCredentials,
        plan: &RawLoadPlan,
    ) -> Result<LoadReport, RawLoadError> {
        self.inner.load_raw(credentials, plan).await
    }

    async fn merge(
        &self,
        credentials: &WarehouseCredentials,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError> {
        self.inner.merge(credentials, spec).await
    }

    async fn remove(
        &self,
        credentials: &WarehouseCredentials,
        stage: &ObjectName,
        pattern: &BatchPattern,
    ) -> Result<Vec<String>, WarehouseError> {
        if self.refuse_remove {
            return Err(WarehouseError::Stage("stage is temporarily read-only".into()));
        }
        self.inner.remove(credentials, stage, pattern).await
    }

    async fn create_table(
        &self,
        credentials: &WarehouseCredentials,
        table: &TableDef,
    ) -> Result<(), WarehouseError> {
        self.inner.create_table(credentials, table).await
    }
}

#[tokio::test]
async fn partial_cleanup_is_reported_and_reconciled() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture(BATCH_FILE)?;
    let stuck = Arc::new(FaultyWarehouse::refusing_remove(harness.warehouse.clone()));
    let driver = PipelineDriver::new(harness.config.clone(), stuck, harness.ledger.clone());

    let report = driver.run(&profiles()).await?;

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.clone().expect("failure summary");
    assert_eq!(failure.kind, FailureKind::CleanupPartialFailure);
    assert_eq!(failure.task, REMOVE_STAGED);
    assert_eq!(report.task_status(ARCHIVE_LOCAL), Some(TaskStatus::Succeeded));
    assert_eq!(report.task_status(END), Some(TaskStatus::Skipped));

    let objects = &harness.config.warehouse;
    assert_eq!(harness.table(&objects.sales_table()).len(), 3);
    assert_eq!(
        harness.warehouse.staged_objects(&objects.stage()),
        vec![BATCH_FILE.to_string()]
    );

    let entries = harness.ledger.entries().await?;
    assert_eq!(entries[0].state, BatchState::Loaded);
    assert!(entries[0].archived);
    assert!(!entries[0].stage_removed);

    let plan = reconcile::plan(harness.ledger.as_ref()).await?;
    assert_eq!(plan.len(), 1);
    assert!(plan.actions[0].remove_from_stage);
    assert!(!plan.actions[0].archive_local);

    let outcome = reconcile::apply(
        &plan,
        &harness.config,
        &credentials(),
        harness.warehouse.as_ref(),
        harness.ledger.as_ref(),
    )
    .await?;
    assert_eq!(outcome.removed_objects, vec![BATCH_FILE.to_string()]);
    assert!(outcome.archived.is_empty());
    assert!(outcome.missing.is_empty());

    assert!(harness.warehouse.staged_objects(&objects.stage()).is_empty());
    let entries = harness.ledger.entries().await?;
    assert_eq!(entries[0].state, BatchState::Completed);
    assert!(reconcile::plan(harness.ledger.as_ref()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn reconcile_archives_files_left_in_the_source_directory() -> Result<()> {
    let harness = Harness::new().await?;
    harness.add_fixture(BATCH_FILE)?;
    harness.run().await?;

    // A later run that merged and cleared the stage but never archived.
    let source = harness.add_fixture(BATCH_FILE)?;
    let run_id = uuid::Uuid::new_v4();
    let key = cafe_core::ledger::FileKey {
        run_id,
        file_name: BATCH_FILE,
        file_hash: "0000",
    };
    harness.ledger.mark(&key, cafe_core::ledger::LedgerMark::Staged).await?;
    harness.ledger.mark(&key, cafe_core::ledger::LedgerMark::Loaded).await?;
    harness.ledger.mark(&key, cafe_core::ledger::LedgerMark::StageRemoved).await?;

    let plan = reconcile::plan(harness.ledger.as_ref()).await?;
    assert_eq!(plan.len(), 1);
    assert!(!plan.needs_stage_removal());

    let outcome = reconcile::apply(
        &plan,
        &harness.config,
        &credentials(),
        harness.warehouse.as_ref(),
        harness.ledger.as_ref(),
    )
    .await?;
    assert_eq!(outcome.archived, vec![BATCH_FILE.to_string()]);
    assert!(outcome.removed_objects.is_empty());
    assert!(!source.exists());
    assert!(harness.config.processed_path().join(BATCH_FILE).is_file());
    Ok(())
}
