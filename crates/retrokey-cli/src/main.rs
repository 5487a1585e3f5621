use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use retrokey_core::{preview, run, RunPlan, RunReport, TableStore};
use retrokey_store_sqlite::SqliteTableStore;
use serde_json::Value;
use time::{Date, OffsetDateTime};
use tracing_subscriber::EnvFilter;

mod config;
mod report;

use config::RunConfig;
use report::{render_text, with_contract_version};

/// Exit status when the operator declines the confirmation prompt.
const EXIT_CANCELLED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Retroactive identifier assignment for SQLite tables")]
struct Cli {
    #[arg(long, default_value = "./retrokey.sqlite3")]
    db: PathBuf,

    /// Only log warnings and errors unless RUST_LOG says otherwise.
    #[arg(long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the structure of a table as JSON.
    Inspect(InspectArgs),
    /// Assign identifiers and promote the identifier column to primary key.
    Assign(Box<AssignArgs>),
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long)]
    table: String,
}

#[derive(Debug, Args)]
struct AssignArgs {
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    id_column: Option<String>,
    /// Declared SQL type of the identifier column. Defaults to CHAR(n) sized to the prefix.
    #[arg(long)]
    id_type: Option<String>,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long)]
    date_column: Option<String>,
    #[arg(long)]
    name_column: Option<String>,
    #[arg(long)]
    country_column: Option<String>,
    /// Date stamped on undated rows (YYYY-MM-DD). Defaults to the local date.
    #[arg(long)]
    today: Option<String>,
    /// YAML file with run settings; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Compute and verify identifiers without changing the table.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Skip the confirmation prompt.
    #[arg(long, default_value_t = false)]
    yes: bool,
    /// Write a full database backup here before the first change.
    #[arg(long)]
    backup: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

impl AssignArgs {
    fn overrides(&self) -> RunConfig {
        RunConfig {
            table: self.table.clone(),
            id_column: self.id_column.clone(),
            id_type: self.id_type.clone(),
            prefix: self.prefix.clone(),
            date_column: self.date_column.clone(),
            name_column: self.name_column.clone(),
            country_column: self.country_column.clone(),
            today: self.today.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Command::Inspect(args) => {
            let store = SqliteTableStore::open(&cli.db)?;
            run_inspect(&args, &store)
        }
        Command::Assign(args) => {
            let mut store = SqliteTableStore::open(&cli.db)?;
            run_assign(&args, &mut store)
        }
    }
}

fn run_inspect(args: &InspectArgs, store: &SqliteTableStore) -> Result<ExitCode> {
    let snapshot = store.inspect(&args.table)?;
    emit_json(serde_json::to_value(&snapshot).context("failed to serialize schema snapshot")?)?;
    Ok(ExitCode::SUCCESS)
}

fn run_assign(args: &AssignArgs, store: &mut SqliteTableStore) -> Result<ExitCode> {
    let file_config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let (plan, today) = file_config.overlay(args.overrides()).resolve(local_today())?;
    tracing::debug!(
        table = %plan.table,
        id_column = plan.id_column.name(),
        prefix = %plan.prefix,
        %today,
        dry_run = args.dry_run,
        "resolved run plan"
    );

    if args.dry_run {
        let report = preview(&*store, &plan, today);
        return finish(&report, args.format);
    }

    if !args.yes {
        let stdin = io::stdin();
        let confirmed = confirm(&mut stdin.lock(), &mut io::stderr(), &plan, today)?;
        if !confirmed {
            eprintln!("cancelled; no changes were made");
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
    }

    if let Some(backup) = &args.backup {
        store.backup_to(backup)?;
    }

    let report = run(store, &plan, today);
    finish(&report, args.format)
}

fn finish(report: &RunReport, format: OutputFormat) -> Result<ExitCode> {
    match format {
        OutputFormat::Text => print!("{}", render_text(report)?),
        OutputFormat::Json => {
            emit_json(serde_json::to_value(report).context("failed to serialize run report")?)?;
        }
    }
    Ok(if report.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Describe the irreversible change and wait for `y`/`yes`.
fn confirm(
    input: &mut impl BufRead,
    prompt: &mut impl Write,
    plan: &RunPlan,
    today: Date,
) -> Result<bool> {
    write!(
        prompt,
        "About to rebuild table {} with a new {} {} column as its first column and primary key \
         (prefix {}, run date {today}). Existing {} values are replaced. Continue? [y/N] ",
        plan.table,
        plan.id_column.name(),
        plan.id_column.declared_type(),
        plan.prefix,
        plan.id_column.name()
    )?;
    prompt.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer).context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn local_today() -> Date {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()).date()
}
