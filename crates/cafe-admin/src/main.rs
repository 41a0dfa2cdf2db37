use std::path::PathBuf;

use anyhow::{Context, Result};
use cafe_bucket::{BucketStore, S3BucketStore};
use cafe_core::config::PipelineConfig;
use cafe_core::credentials::{
    resolve_credentials, EnvProfileStore, ProfileStore, TomlProfileStore, WarehouseCredentials,
};
use cafe_core::ledger::{self, LedgerEntry, RunSummary};
use cafe_core::warehouse::snowflake::SnowflakeWarehouse;
use cafe_core::warehouse::Warehouse;
use cafe_core::{db, merge, reconcile};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cafe pipeline administrative tooling", long_about = None)]
struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the Postgres ledger migrations
    Migrate,
    /// Create the dimension and fact tables when they do not exist
    Bootstrap(ConnectionArgs),
    /// Show ledger entries and recent runs
    Status(StatusArgs),
    /// Plan (and optionally apply) cleanup left unfinished by earlier runs
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Read connection profiles from this TOML file instead of AIRFLOW_CONN_* variables
    #[arg(long)]
    connections: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct StatusArgs {
    /// Also list the objects currently in the stage bucket
    #[arg(long)]
    stage: bool,
    /// Number of runs to show
    #[arg(long, default_value_t = 10)]
    runs: usize,
}

#[derive(Args, Debug, Default)]
struct ReconcileArgs {
    /// Perform the cleanup instead of only printing the plan
    #[arg(long)]
    apply: bool,
    #[command(flatten)]
    connection: ConnectionArgs,
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

    match cli.command {
        Command::Migrate => handle_migrate(&config).await,
        Command::Bootstrap(args) => handle_bootstrap(&config, args).await,
        Command::Status(args) => handle_status(&config, args).await,
        Command::Reconcile(args) => handle_reconcile(&config, args).await,
    }
}

fn credentials(config: &PipelineConfig, args: &ConnectionArgs) -> Result<WarehouseCredentials> {
    let profiles: Box<dyn ProfileStore> = match &args.connections {
        Some(path) => Box::new(TomlProfileStore::from_path(path)?),
        None => Box::new(EnvProfileStore::new()),
    };
    Ok(resolve_credentials(profiles.as_ref(), &config.connection_id)?)
}

async fn handle_migrate(config: &PipelineConfig) -> Result<()> {
    let database_url = config
        .ledger
        .database_url
        .as_deref()
        .context("CAFE_LEDGER_DATABASE_URL (or DATABASE_URL) must be set")?;

    let pool = db::connect(database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Ledger migrations applied");
    Ok(())
}

async fn handle_bootstrap(config: &PipelineConfig, args: ConnectionArgs) -> Result<()> {
    let credentials = credentials(config, &args)?;
    let warehouse = SnowflakeWarehouse::from_config(config).await?;

    for spec in merge::star_schema(&config.warehouse) {
        let table = spec.table_def();
        warehouse
            .create_table(&credentials, &table)
            .await
            .with_context(|| format!("failed to create {}", table.name))?;
        println!("Ensured {}", table.name);
    }
    Ok(())
}

async fn handle_status(config: &PipelineConfig, args: StatusArgs) -> Result<()> {
    let ledger = ledger::open(config)
        .await
        .context("failed to open the batch ledger")?;

    let entries = ledger.entries().await?;
    if entries.is_empty() {
        println!("The ledger has no batch files yet.");
    } else {
        println!("{}", entries_table(&entries));
    }

    let runs = ledger.runs().await?;
    if !runs.is_empty() {
        println!("{}", runs_table(runs.iter().take(args.runs)));
    }

    let pending = entries.iter().filter(|entry| entry.needs_cleanup()).count();
    if pending > 0 {
        println!("{pending} files need cleanup. Run `cafe-admin reconcile` to review the plan.");
    }

    if args.stage {
        let store = S3BucketStore::new(config.stage_bucket.to_s3_config())
            .await
            .context("failed to configure the stage bucket")?;
        let objects = store.list_objects(&config.stage_bucket.prefix).await?;
        println!("Stage bucket '{}' holds {} objects:", store.bucket(), objects.len());
        for key in objects {
            println!("  {key}");
        }
    }
    Ok(())
}

fn entries_table(entries: &[LedgerEntry]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["run", "file", "state", "stage removed", "archived", "updated"]);
    for entry in entries {
        table.add_row(vec![
            entry.run_id.to_string(),
            entry.file_name.clone(),
            entry.state.as_str().to_string(),
            yes_no(entry.stage_removed).to_string(),
            yes_no(entry.archived).to_string(),
            entry.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table
}

fn runs_table<'a>(runs: impl Iterator<Item = &'a RunSummary>) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["run", "status", "started", "files", "failure"]);
    for run in runs {
        let failure = run
            .failure
            .as_ref()
            .map(|failure| format!("{:?} in {}", failure.kind, failure.task))
            .unwrap_or_default();
        table.add_row(vec![
            run.run_id.to_string(),
            format!("{:?}", run.status).to_lowercase(),
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.files.len().to_string(),
            failure,
        ]);
    }
    table
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

async fn handle_reconcile(config: &PipelineConfig, args: ReconcileArgs) -> Result<()> {
    let ledger = ledger::open(config)
        .await
        .context("failed to open the batch ledger")?;
    let plan = reconcile::plan(ledger.as_ref()).await?;

    if plan.is_empty() {
        println!("Nothing to reconcile. Every loaded file has been cleaned up.");
        return Ok(());
    }

    println!("Found {} files with unfinished cleanup:", plan.len());
    for action in &plan.actions {
        let mut steps = Vec::new();
        if action.remove_from_stage {
            steps.push("remove from stage");
        }
        if action.archive_local {
            steps.push("archive locally");
        }
        println!("  {} (run {}): {}", action.file_name, action.run_id, steps.join(", "));
    }

    if !args.apply {
        println!("Run again with --apply to perform the cleanup.");
        return Ok(());
    }

    let credentials = credentials(config, &args.connection)?;
    let warehouse = SnowflakeWarehouse::from_config(config).await?;
    let outcome = reconcile::apply(&plan, config, &credentials, &warehouse, ledger.as_ref()).await?;

    println!(
        "Removed {} staged objects and archived {} files.",
        outcome.removed_objects.len(),
        outcome.archived.len()
    );
    if !outcome.missing.is_empty() {
        println!("Could not find these files locally; they stay pending:");
        for file in &outcome.missing {
            println!("  {file}");
        }
    }
    Ok(())
}
