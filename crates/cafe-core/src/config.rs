// crates/cafe-core/src/config.rs

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batch::BatchPattern;
use crate::error::{PipelineError, Result};
use crate::merge::DedupPolicy;
use crate::sql::ObjectName;

/// Everything a pipeline run needs besides credentials.
///
/// Values come from an optional TOML file and are then overridden by the
/// environment (`CAFE_HOME`, `AIRFLOW_HOME`, `CAFE_CONNECTION_ID`,
/// `CAFE_LEDGER`, `CAFE_LEDGER_DATABASE_URL`, `DATABASE_URL`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub connection_id: String,
    pub home: PathBuf,
    pub source_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub batch: BatchPattern,
    pub warehouse: WarehouseObjects,
    pub snowflake: SnowflakeSettings,
    pub stage_bucket: StageBucketSettings,
    pub ledger: LedgerSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connection_id: "snowflake_conn".to_string(),
            home: PathBuf::from("."),
            source_dir: PathBuf::from("CAFE"),
            processed_dir: PathBuf::from("CAFE/processed"),
            batch: BatchPattern::default(),
            warehouse: WarehouseObjects::default(),
            snowflake: SnowflakeSettings::default(),
            stage_bucket: StageBucketSettings::default(),
            ledger: LedgerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads `path` when given, otherwise starts from defaults, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    PipelineError::Config(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::parse(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| PipelineError::Config(err.to_string()))
    }

    pub fn apply_env(&mut self) {
        let var = |key: &str| env::var(key).ok().filter(|value| !value.trim().is_empty());

        if let Some(home) = var("CAFE_HOME") {
            self.home = PathBuf::from(home);
        } else if let Some(airflow_home) = var("AIRFLOW_HOME") {
            self.home = PathBuf::from(airflow_home).join("dags");
        }
        if let Some(conn_id) = var("CAFE_CONNECTION_ID") {
            self.connection_id = conn_id;
        }
        if let Some(kind) = var("CAFE_LEDGER") {
            match kind.to_ascii_lowercase().as_str() {
                "postgres" => self.ledger.kind = LedgerKind::Postgres,
                "json" => self.ledger.kind = LedgerKind::Json,
                other => tracing::warn!(value = other, "ignoring unknown CAFE_LEDGER value"),
            }
        }
        if let Some(url) = var("CAFE_LEDGER_DATABASE_URL").or_else(|| var("DATABASE_URL")) {
            self.ledger.database_url = Some(url);
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.home.join(&self.source_dir)
    }

    pub fn processed_path(&self) -> PathBuf {
        self.home.join(&self.processed_dir)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.home.join(&self.ledger.path)
    }
}

/// Names of the warehouse objects the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseObjects {
    pub database: String,
    pub raw_schema: String,
    pub model_schema: String,
    pub stage: String,
    pub raw_table: String,
    pub file_format: String,
    pub product_table: String,
    pub store_table: String,
    pub sales_table: String,
    pub dedup: DedupPolicy,
}

impl Default for WarehouseObjects {
    fn default() -> Self {
        Self {
            database: "IMPACTA".to_string(),
            raw_schema: "RAW".to_string(),
            model_schema: "CAFE".to_string(),
            stage: "STG_RAW".to_string(),
            raw_table: "CAFE".to_string(),
            file_format: "temp_file_format_cafe".to_string(),
            product_table: "DIM_PRODUTO".to_string(),
            store_table: "DIM_LOJA".to_string(),
            sales_table: "FATO_VENDAS".to_string(),
            dedup: DedupPolicy::default(),
        }
    }
}

impl WarehouseObjects {
    fn raw(&self, name: &str) -> ObjectName {
        ObjectName::new(&self.database, &self.raw_schema, name)
    }

    fn model(&self, name: &str) -> ObjectName {
        ObjectName::new(&self.database, &self.model_schema, name)
    }

    pub fn stage(&self) -> ObjectName {
        self.raw(&self.stage)
    }

    pub fn raw_table(&self) -> ObjectName {
        self.raw(&self.raw_table)
    }

    pub fn file_format(&self) -> ObjectName {
        self.raw(&self.file_format)
    }

    pub fn product_table(&self) -> ObjectName {
        self.model(&self.product_table)
    }

    pub fn store_table(&self) -> ObjectName {
        self.model(&self.store_table)
    }

    pub fn sales_table(&self) -> ObjectName {
        self.model(&self.sales_table)
    }
}

/// Session options for the Snowflake SQL API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnowflakeSettings {
    /// Overrides `https://<account>.snowflakecomputing.com`.
    pub host: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
}

/// Bucket behind the external stage. Batch files are uploaded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageBucketSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub force_path_style: bool,
}

impl Default for StageBucketSettings {
    fn default() -> Self {
        Self {
            bucket: "cafe-stage".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            prefix: "stg_raw/".to_string(),
            force_path_style: false,
        }
    }
}

impl StageBucketSettings {
    /// Object key for a staged file.
    pub fn object_key(&self, file_name: &str) -> String {
        format!("{}{}", self.prefix, file_name)
    }

    #[cfg(feature = "runtime")]
    pub fn to_s3_config(&self) -> cafe_bucket::S3Config {
        cafe_bucket::S3Config {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            force_path_style: self.force_path_style,
            ..cafe_bucket::S3Config::default()
        }
        .with_env_overrides()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    #[default]
    Json,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub kind: LedgerKind,
    /// JSON ledger location, relative to `home`.
    pub path: PathBuf,
    pub database_url: Option<String>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            kind: LedgerKind::Json,
            path: PathBuf::from(".cafe-ledger.json"),
            database_url: None,
        }
    }
}
