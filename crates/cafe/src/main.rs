use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cafe_core::config::PipelineConfig;
use cafe_core::credentials::{EnvProfileStore, ProfileStore, TomlProfileStore};
use cafe_core::driver::{self, PipelineDriver, RunStatus};
use cafe_core::ledger;
use cafe_core::sql;
use cafe_core::warehouse::snowflake::SnowflakeWarehouse;
use cafe_parser::{check_header, parse_batch, CAFE_FILE_FORMAT, RAW_COLUMNS};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Coffee-shop sales loader", long_about = None)]
struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage, load, merge and clean up the current batch
    Run(RunArgs),
    /// Show the task order and the files the next run would pick up
    Plan,
    /// Print the SQL a run issues, in order
    RenderSql(RenderSqlArgs),
    /// Parse batch files locally without touching the warehouse
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Read connection profiles from this TOML file instead of AIRFLOW_CONN_* variables
    #[arg(long)]
    connections: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct RenderSqlArgs {
    /// Also print the DDL that creates the dimension and fact tables
    #[arg(long)]
    bootstrap: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    config.batch.validate()?;

    match cli.command {
        Command::Run(args) => handle_run(config, args).await,
        Command::Plan => handle_plan(&config),
        Command::RenderSql(args) => handle_render_sql(&config, args),
        Command::Validate(args) => handle_validate(&args.files),
    }
}

async fn handle_run(config: PipelineConfig, args: RunArgs) -> Result<()> {
    let profiles: Box<dyn ProfileStore> = match &args.connections {
        Some(path) => Box::new(TomlProfileStore::from_path(path)?),
        None => Box::new(EnvProfileStore::new()),
    };

    let warehouse = SnowflakeWarehouse::from_config(&config).await?;
    let ledger = ledger::open(&config)
        .await
        .context("failed to open the batch ledger")?;
    let driver = PipelineDriver::new(config, Arc::new(warehouse), ledger);

    let report = driver.run(profiles.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match (report.status, &report.failure) {
        (RunStatus::Failed, Some(failure)) => {
            bail!("run {} failed in {}: {}", report.run_id, failure.task, failure.message)
        }
        (RunStatus::Failed, None) => bail!("run {} failed", report.run_id),
        _ => Ok(()),
    }
}

fn handle_plan(config: &PipelineConfig) -> Result<()> {
    let order = driver::task_order()?;
    println!("Tasks:");
    for (position, task) in order.iter().enumerate() {
        let upstream = driver::TASK_LAYOUT
            .iter()
            .find(|(id, _)| id == task)
            .map(|(_, depends_on)| depends_on.join(", "))
            .unwrap_or_default();
        if upstream.is_empty() {
            println!("  {:>2}. {task}", position + 1);
        } else {
            println!("  {:>2}. {task} (after {upstream})", position + 1);
        }
    }

    let source = config.source_path();
    let files = cafe_core::batch::discover(&source, &config.batch)?;
    if files.is_empty() {
        println!("No files matching {} in {}; a run would be skipped.", config.batch.glob(), source.display());
        return Ok(());
    }

    println!("Batch ({} files from {}):", files.len(), source.display());
    for file in &files {
        println!("  {} ({} bytes, blake3 {})", file.name, file.size, file.hash);
    }
    Ok(())
}

fn handle_render_sql(config: &PipelineConfig, args: RenderSqlArgs) -> Result<()> {
    if args.bootstrap {
        println!("-- bootstrap");
        for statement in sql::render_bootstrap(config) {
            println!("{statement}\n");
        }
    }
    for statement in sql::render_pipeline(config) {
        println!("-- {}\n{}\n", statement.step, statement.sql);
    }
    Ok(())
}

fn handle_validate(files: &[PathBuf]) -> Result<()> {
    let mut failures = 0usize;
    for path in files {
        match validate_file(path) {
            Ok(rows) => println!("{}: ok, {rows} rows", path.display()),
            Err(err) => {
                failures += 1;
                println!("{}: {err:#}", path.display());
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} files failed validation", files.len());
    }
    info!(files = files.len(), "all files validated");
    Ok(())
}

fn validate_file(path: &Path) -> Result<usize> {
    let contents = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    let header = check_header(&contents, &CAFE_FILE_FORMAT, &RAW_COLUMNS)?;
    for (position, found, expected) in &header.renamed {
        warn!(file = %path.display(), position, found = %found, expected, "header field renamed");
    }

    let batch = parse_batch(&contents, &CAFE_FILE_FORMAT, &RAW_COLUMNS)?;
    Ok(batch.len())
}
