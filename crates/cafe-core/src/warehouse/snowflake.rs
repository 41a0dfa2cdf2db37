// crates/cafe-core/src/warehouse/snowflake.rs

//! Snowflake backend over the session REST API. Batch files reach the stage
//! through the bucket behind it; every other operation is a SQL statement.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use cafe_bucket::{BucketStore, S3BucketStore};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    LoadReport, MergeReport, RawLoadError, RawLoadPhase, RawLoadPlan, StagedObject, Warehouse,
    WarehouseError,
};
use crate::batch::{BatchFile, BatchPattern};
use crate::config::{PipelineConfig, SnowflakeSettings, StageBucketSettings};
use crate::credentials::WarehouseCredentials;
use crate::merge::{MergeSpec, TableDef};
use crate::sql::{self, ObjectName};

const CLIENT_APP_ID: &str = "cafe";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Response codes meaning the statement is still executing.
const IN_PROGRESS_CODES: [&str; 2] = ["333333", "333334"];

pub struct SnowflakeWarehouse {
    http: reqwest::Client,
    settings: SnowflakeSettings,
    database: String,
    schema: String,
    stage_bucket: StageBucketSettings,
    stage_store: Arc<dyn BucketStore>,
}

impl SnowflakeWarehouse {
    pub fn new(
        settings: SnowflakeSettings,
        database: impl Into<String>,
        schema: impl Into<String>,
        stage_bucket: StageBucketSettings,
        stage_store: Arc<dyn BucketStore>,
    ) -> Result<Self, WarehouseError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cafe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            settings,
            database: database.into(),
            schema: schema.into(),
            stage_bucket,
            stage_store,
        })
    }

    /// Builds the backend and its S3 stage client from configuration.
    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let store = S3BucketStore::new(config.stage_bucket.to_s3_config())
            .await
            .context("failed to initialise the stage bucket client")?;
        Self::new(
            config.snowflake.clone(),
            &config.warehouse.database,
            &config.warehouse.raw_schema,
            config.stage_bucket.clone(),
            Arc::new(store),
        )
        .context("failed to build the Snowflake HTTP client")
    }

    pub fn base_url(&self, credentials: &WarehouseCredentials) -> String {
        account_url(&self.settings, credentials)
    }

    async fn open_session(&self, credentials: &WarehouseCredentials) -> Result<Session<'_>, WarehouseError> {
        let base_url = self.base_url(credentials);
        let account_name = credentials
            .account
            .split('.')
            .next()
            .unwrap_or(&credentials.account);

        let mut query: Vec<(&str, &str)> = vec![
            ("databaseName", self.database.as_str()),
            ("schemaName", self.schema.as_str()),
        ];
        if let Some(warehouse) = &self.settings.warehouse {
            query.push(("warehouse", warehouse.as_str()));
        }
        if let Some(role) = &self.settings.role {
            query.push(("roleName", role.as_str()));
        }

        let request_id = Uuid::new_v4().to_string();
        let body = LoginRequest {
            data: LoginData {
                client_app_id: CLIENT_APP_ID,
                client_app_version: env!("CARGO_PKG_VERSION"),
                account_name,
                login_name: &credentials.login,
                password: &credentials.secret,
                session_parameters: SessionParameters {
                    query_result_format: "JSON",
                },
            },
        };

        let response = self
            .http
            .post(format!("{base_url}/session/v1/login-request"))
            .query(&query)
            .query(&[("requestId", request_id.as_str())])
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let envelope: Envelope<LoginResponseData> = decode(response).await?;
        if !envelope.success {
            return Err(WarehouseError::Auth(
                envelope
                    .message
                    .unwrap_or_else(|| "login was rejected".to_string()),
            ));
        }
        let token = envelope
            .data
            .map(|data| data.token)
            .ok_or_else(|| WarehouseError::Auth("login response carried no session token".into()))?;

        debug!(account = %credentials.account, "opened warehouse session");
        Ok(Session {
            http: &self.http,
            base_url,
            token,
            sequence: 0,
        })
    }

    /// Runs `statements` in order on one session, which is closed afterwards
    /// whatever the outcome.
    async fn run_statements(
        &self,
        credentials: &WarehouseCredentials,
        statements: &[String],
    ) -> Result<Vec<QueryResult>, WarehouseError> {
        let mut session = self.open_session(credentials).await?;
        let mut results = Vec::with_capacity(statements.len());
        let mut outcome = Ok(());
        for statement in statements {
            match session.execute(statement).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        session.close().await;
        outcome.map(|()| results)
    }
}

fn account_url(settings: &SnowflakeSettings, credentials: &WarehouseCredentials) -> String {
    if let Some(host) = &settings.host {
        return host.trim_end_matches('/').to_string();
    }
    match &credentials.region {
        Some(region) => format!(
            "https://{}.{}.snowflakecomputing.com",
            credentials.account, region
        ),
        None => format!("https://{}.snowflakecomputing.com", credentials.account),
    }
}

fn transport(err: reqwest::Error) -> WarehouseError {
    WarehouseError::Transport(err.to_string())
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    data: LoginData<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct LoginData<'a> {
    client_app_id: &'a str,
    client_app_version: &'a str,
    account_name: &'a str,
    login_name: &'a str,
    password: &'a str,
    session_parameters: SessionParameters,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct SessionParameters {
    query_result_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct LoginResponseData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    success: bool,
}

impl<T> Envelope<T> {
    fn in_progress(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| IN_PROGRESS_CODES.contains(&code))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    sql_text: &'a str,
    async_exec: bool,
    sequence_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponseData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    #[serde(default)]
    rowset: Vec<Vec<JsonValue>>,
    #[serde(default)]
    query_id: Option<String>,
    #[serde(default)]
    get_result_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Envelope<T>, WarehouseError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(WarehouseError::Auth(format!("warehouse answered HTTP {status}")));
    }
    if !status.is_success() {
        return Err(WarehouseError::Transport(format!("warehouse answered HTTP {status}")));
    }
    response.json().await.map_err(transport)
}

/// Result set of one statement, values kept in their JSON text form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    fn from_data(data: QueryResponseData) -> Self {
        Self {
            columns: data.rowtype.into_iter().map(|column| column.name).collect(),
            rows: data
                .rowset
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|value| match value {
                            JsonValue::Null => None,
                            JsonValue::String(text) => Some(text),
                            other => Some(other.to_string()),
                        })
                        .collect()
                })
                .collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    pub fn strings(&self, name: &str) -> Vec<String> {
        let Some(index) = self.column(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(index).cloned().flatten())
            .collect()
    }

    /// Sum of a numeric column; missing columns and unparsable cells count as zero.
    pub fn sum(&self, name: &str) -> u64 {
        self.strings(name)
            .iter()
            .filter_map(|value| value.parse::<u64>().ok())
            .sum()
    }
}

struct Session<'a> {
    http: &'a reqwest::Client,
    base_url: String,
    token: String,
    sequence: u64,
}

impl Session<'_> {
    fn authorization(&self) -> String {
        format!("Snowflake Token=\"{}\"", self.token)
    }

    async fn execute(&mut self, statement: &str) -> Result<QueryResult, WarehouseError> {
        self.sequence += 1;
        debug!(sequence = self.sequence, sql = statement, "executing statement");

        let request_id = Uuid::new_v4().to_string();
        let response = self
            .http
            .post(format!("{}/queries/v1/query-request", self.base_url))
            .query(&[("requestId", request_id.as_str())])
            .header(AUTHORIZATION, self.authorization())
            .header(ACCEPT, "application/snowflake")
            .json(&QueryRequest {
                sql_text: statement,
                async_exec: false,
                sequence_id: self.sequence,
            })
            .send()
            .await
            .map_err(transport)?;
        let mut envelope: Envelope<QueryResponseData> = decode(response).await?;

        while envelope.in_progress() {
            let result_url = envelope
                .data
                .as_ref()
                .and_then(|data| data.get_result_url.clone())
                .ok_or_else(|| WarehouseError::Statement {
                    code: envelope.code.clone(),
                    message: "statement is running but no result URL was returned".to_string(),
                })?;
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .http
                .get(format!("{}{}", self.base_url, result_url))
                .header(AUTHORIZATION, self.authorization())
                .header(ACCEPT, "application/snowflake")
                .send()
                .await
                .map_err(transport)?;
            envelope = decode(response).await?;
        }

        if !envelope.success {
            return Err(WarehouseError::Statement {
                code: envelope.code,
                message: envelope
                    .message
                    .unwrap_or_else(|| "statement failed without a message".to_string()),
            });
        }

        let data = envelope.data.unwrap_or_default();
        if let Some(query_id) = &data.query_id {
            debug!(query_id = %query_id, "statement finished");
        }
        Ok(QueryResult::from_data(data))
    }

    async fn close(self) {
        let outcome = self
            .http
            .post(format!("{}/session", self.base_url))
            .query(&[("delete", "true")])
            .header(AUTHORIZATION, self.authorization())
            .header(ACCEPT, "application/snowflake")
            .send()
            .await;
        if let Err(err) = outcome {
            warn!(error = %err, "failed to close warehouse session");
        }
    }
}

/// Maps a COPY failure onto a load rejection, keeping the warehouse message.
fn rejected(err: WarehouseError) -> WarehouseError {
    match err {
        WarehouseError::Statement { message, .. } => WarehouseError::LoadRejected {
            file: None,
            line: None,
            message,
        },
        other => other,
    }
}

#[async_trait]
impl Warehouse for SnowflakeWarehouse {
    /// Uploads into the bucket behind `stage`; the stage name itself is only logged.
    async fn put(
        &self,
        _credentials: &WarehouseCredentials,
        file: &BatchFile,
        stage: &ObjectName,
    ) -> Result<StagedObject, WarehouseError> {
        let contents = tokio::fs::read(&file.path).await?;
        let bytes = contents.len() as u64;
        let key = self.stage_bucket.object_key(&file.name);

        self.stage_store
            .put_object(&key, Bytes::from(contents), "text/csv")
            .await
            .map_err(|err| WarehouseError::Stage(err.to_string()))?;
        info!(stage = %stage, key = %key, bytes, "uploaded file to stage bucket");

        Ok(StagedObject {
            name: file.name.clone(),
            bytes,
        })
    }

    async fn load_raw(
        &self,
        credentials: &WarehouseCredentials,
        plan: &RawLoadPlan,
    ) -> Result<LoadReport, RawLoadError> {
        let mut session = self
            .open_session(credentials)
            .await
            .map_err(|err| RawLoadError::new(RawLoadPhase::Schema, err))?;

        let phases = [
            (RawLoadPhase::Schema, sql::create_raw_table(&plan.table, plan.columns)),
            (RawLoadPhase::Format, sql::create_file_format(&plan.format_name, &plan.format)),
            (RawLoadPhase::Load, sql::copy_into(plan)),
        ];

        let mut outcome = Ok(QueryResult::default());
        for (phase, statement) in &phases {
            outcome = session.execute(statement).await.map_err(|err| {
                let err = if *phase == RawLoadPhase::Load {
                    rejected(err)
                } else {
                    err
                };
                RawLoadError::new(*phase, err)
            });
            if outcome.is_err() {
                break;
            }
        }
        session.close().await;

        let copied = outcome?;
        Ok(LoadReport {
            files: copied.strings("file"),
            rows_loaded: copied.sum("rows_loaded"),
        })
    }

    async fn merge(
        &self,
        credentials: &WarehouseCredentials,
        spec: &MergeSpec,
    ) -> Result<MergeReport, WarehouseError> {
        let mut results = self
            .run_statements(credentials, &[sql::merge(spec)])
            .await?;
        let result = results.pop().unwrap_or_default();
        Ok(MergeReport {
            target: spec.target.to_string(),
            inserted: result.sum("number of rows inserted"),
            updated: result.sum("number of rows updated"),
        })
    }

    async fn remove(
        &self,
        credentials: &WarehouseCredentials,
        stage: &ObjectName,
        pattern: &BatchPattern,
    ) -> Result<Vec<String>, WarehouseError> {
        let mut results = self
            .run_statements(credentials, &[sql::remove(stage, pattern)])
            .await?;
        Ok(results.pop().unwrap_or_default().strings("name"))
    }

    async fn create_table(
        &self,
        credentials: &WarehouseCredentials,
        table: &TableDef,
    ) -> Result<(), WarehouseError> {
        self.run_statements(credentials, &[sql::create_table_if_not_exists(table)])
            .await?;
        Ok(())
    }
}
