// crates/cafe-core/src/sql.rs

//! Snowflake statement rendering. Every statement the pipeline executes is
//! produced here so the CLI can print exactly what a run would send.

use std::fmt;

use cafe_parser::{ColumnSpec, FileFormat};
use serde::Serialize;

use crate::batch::BatchPattern;
use crate::config::PipelineConfig;
use crate::merge::{self, DedupPolicy, MergeSpec, TableDef, RECENCY_ORDER};
use crate::warehouse::RawLoadPlan;

/// Fully qualified `database.schema.name`, rendered with quoted identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectName {
    pub database: String,
    pub schema: String,
    pub name: String,
}

impl ObjectName {
    pub fn new(database: impl Into<String>, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            quote_ident(&self.database),
            quote_ident(&self.schema),
            quote_ident(&self.name)
        )
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

pub fn stage_ref(stage: &ObjectName) -> String {
    format!("@{stage}")
}

pub fn create_raw_table(table: &ObjectName, columns: &[ColumnSpec]) -> String {
    let body = columns
        .iter()
        .map(|column| format!("    {} {}", column.name, column.ty.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE OR REPLACE TABLE {table} (\n{body}\n);")
}

pub fn create_table_if_not_exists(table: &TableDef) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|(name, ty)| format!("    {name} {}", ty.sql_type()))
        .collect();
    if let Some(key) = table.primary_key {
        lines.push(format!("    PRIMARY KEY ({key})"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        table.name,
        lines.join(",\n")
    )
}

pub fn create_file_format(name: &ObjectName, format: &FileFormat) -> String {
    let enclosed_by = match format.field_optionally_enclosed_by {
        Some(quote) => string_literal(&char::from(quote).to_string()),
        None => "NONE".to_string(),
    };
    let flag = |value: bool| if value { "TRUE" } else { "FALSE" };

    format!(
        "CREATE OR REPLACE TEMPORARY FILE FORMAT {name}\n    \
         TYPE = CSV\n    \
         SKIP_HEADER = {}\n    \
         FIELD_DELIMITER = {}\n    \
         TRIM_SPACE = {}\n    \
         FIELD_OPTIONALLY_ENCLOSED_BY = {}\n    \
         REPLACE_INVALID_CHARACTERS = {}\n    \
         DATE_FORMAT = {}\n    \
         TIME_FORMAT = {}\n    \
         TIMESTAMP_FORMAT = AUTO;",
        format.skip_header,
        string_literal(&char::from(format.field_delimiter).to_string()),
        flag(format.trim_space),
        enclosed_by,
        flag(format.replace_invalid_characters),
        format.date_format.sql(),
        format.time_format.sql(),
    )
}

/// Positional load of every staged object matching the batch pattern. Any
/// rejected row aborts the whole statement.
pub fn copy_into(plan: &RawLoadPlan) -> String {
    let targets = plan
        .columns
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ");
    let fields = plan
        .columns
        .iter()
        .map(|column| format!("${}", column.position))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "COPY INTO {} ({targets})\n\
         FROM (\n    SELECT {fields}\n    FROM {}\n)\n\
         PATTERN = {}\n\
         FILE_FORMAT = (FORMAT_NAME = {})\n\
         ON_ERROR = ABORT_STATEMENT;",
        plan.table,
        stage_ref(&plan.stage),
        string_literal(&plan.pattern.stage_regex()),
        string_literal(&plan.format_name.to_string()),
    )
}

pub fn merge(spec: &MergeSpec) -> String {
    let columns: Vec<&str> = spec.columns().collect();
    let projection = columns
        .iter()
        .map(|column| format!("        {column}"))
        .collect::<Vec<_>>()
        .join(",\n");

    // A NULL key never matches, so such rows would insert again on every run.
    let source = match spec.dedup {
        DedupPolicy::Distinct => format!(
            "    SELECT DISTINCT\n{projection}\n    FROM {}\n    WHERE {key} IS NOT NULL",
            spec.source,
            key = spec.key
        ),
        DedupPolicy::LatestTransaction => {
            let order = RECENCY_ORDER
                .iter()
                .map(|column| format!("{column} DESC NULLS LAST"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "    SELECT\n{projection}\n    FROM {}\n    WHERE {key} IS NOT NULL\n    \
                 QUALIFY ROW_NUMBER() OVER (\n        \
                 PARTITION BY {key}\n        ORDER BY {order}\n    ) = 1",
                spec.source,
                key = spec.key
            )
        }
    };

    let mut statement = format!(
        "MERGE INTO {target} AS dst\nUSING (\n{source}\n) AS src\nON dst.{key} = src.{key}\n",
        target = spec.target,
        key = spec.key,
    );

    if !spec.attributes.is_empty() {
        let assignments = spec
            .attributes
            .iter()
            .map(|column| format!("        dst.{column} = src.{column}"))
            .collect::<Vec<_>>()
            .join(",\n");
        statement.push_str(&format!("WHEN MATCHED THEN\n    UPDATE SET\n{assignments}\n"));
    }

    let values = columns
        .iter()
        .map(|column| format!("src.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    statement.push_str(&format!(
        "WHEN NOT MATCHED THEN\n    INSERT ({})\n    VALUES ({values});",
        columns.join(", ")
    ));
    statement
}

pub fn remove(stage: &ObjectName, pattern: &BatchPattern) -> String {
    format!(
        "REMOVE {} PATTERN = {};",
        stage_ref(stage),
        string_literal(&pattern.stage_regex())
    )
}

/// A rendered statement with the pipeline step that issues it.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedStatement {
    pub step: &'static str,
    pub sql: String,
}

/// Every statement of one run, in execution order.
pub fn render_pipeline(config: &PipelineConfig) -> Vec<RenderedStatement> {
    let plan = RawLoadPlan::from_config(config);
    let mut statements = vec![
        RenderedStatement {
            step: "load_raw",
            sql: create_raw_table(&plan.table, plan.columns),
        },
        RenderedStatement {
            step: "load_raw",
            sql: create_file_format(&plan.format_name, &plan.format),
        },
        RenderedStatement {
            step: "load_raw",
            sql: copy_into(&plan),
        },
    ];

    for spec in merge::star_schema(&config.warehouse) {
        statements.push(RenderedStatement {
            step: spec.name,
            sql: merge(&spec),
        });
    }

    statements.push(RenderedStatement {
        step: "remove_staged",
        sql: remove(&config.warehouse.stage(), &config.batch),
    });
    statements
}

/// DDL creating the dimension and fact tables when absent.
pub fn render_bootstrap(config: &PipelineConfig) -> Vec<String> {
    merge::star_schema(&config.warehouse)
        .iter()
        .map(|spec| create_table_if_not_exists(&spec.table_def()))
        .collect()
}
