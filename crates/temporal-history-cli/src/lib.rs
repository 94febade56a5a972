//! `th`: derive, install and inspect temporal history for SQLite tables.
//!
//! Hosts embed the same surface through [`run_cli`]. Every command prints
//! JSON on stdout; logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use temporal_history_core::{
    derive_history_schema, Filter, HistoryConfig, HistorySchema, LifecycleEvent, LogFailureSink,
    RecordValues, Relation,
};
use temporal_history_store_sqlite::{history_table_ddl, SqliteHost};
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const INSTALL_CONTRACT_VERSION: &str = "history_install.v1";
pub const LIST_CONTRACT_VERSION: &str = "history_list.v1";

#[derive(Debug, Parser)]
#[command(name = "th")]
#[command(about = "Temporal history CLI")]
pub struct Cli {
    #[arg(long, default_value = "./temporal_history.sqlite3")]
    db: PathBuf,

    /// Verbosity of the stderr log.
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    /// Print the history schema derived from a live table.
    Derive(DeriveArgs),
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Create the history table of a live table.
    Install(InstallArgs),
    /// Print the history rows of a live table.
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// JSON file with `blocking`, `full` and `underscored` keys.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    non_blocking: bool,
    #[arg(long)]
    full: bool,
    #[arg(long)]
    underscored: bool,
}

#[derive(Debug, Args)]
pub struct DeriveArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    underscored: bool,
    /// Print the SQLite DDL instead of the schema.
    #[arg(long)]
    ddl: bool,
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(long)]
    table: String,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    table: String,
    /// Live primary key; JSON literals such as `7` are parsed, anything else is a string.
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstallReport {
    pub contract_version: String,
    pub live_entity: String,
    pub history_entity: String,
    pub history_table: String,
    pub config: HistoryConfig,
    pub captured_events: Vec<LifecycleEvent>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListReport {
    pub contract_version: String,
    pub live_entity: String,
    pub history_table: String,
    pub rows: Vec<RecordValues>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the log filter, config, database, or the requested
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.log_level)?;
    let mut host = SqliteHost::open(&cli.db)?;

    let output = match cli.command {
        Command::Schema {
            command: SchemaCommand::Derive(args),
        } => {
            if args.ddl {
                let ddl = derive_ddl(&host, &args)?;
                println!("{ddl}");
                return Ok(());
            }
            serde_json::to_value(derive(&host, &args)?)?
        }
        Command::History {
            command: HistoryCommand::Install(args),
        } => serde_json::to_value(install(&mut host, &args)?)?,
        Command::History {
            command: HistoryCommand::List(args),
        } => serde_json::to_value(list(&mut host, &args)?)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_new(level.directive())
        .with_context(|| format!("invalid log level {}", level.directive()))?;
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn derive(host: &SqliteHost, args: &DeriveArgs) -> Result<HistorySchema> {
    let live = host
        .introspect(&args.table)
        .with_context(|| format!("failed to introspect table {}", args.table))?;
    let config = HistoryConfig {
        underscored: args.underscored,
        ..HistoryConfig::default()
    };
    Ok(derive_history_schema(&live, &config)?)
}

fn derive_ddl(host: &SqliteHost, args: &DeriveArgs) -> Result<String> {
    Ok(history_table_ddl(&derive(host, args)?))
}

fn install(host: &mut SqliteHost, args: &InstallArgs) -> Result<InstallReport> {
    let config = load_config(&args.config)?;
    let live = host
        .introspect(&args.table)
        .with_context(|| format!("failed to introspect table {}", args.table))?;
    let binding = host
        .bind_history(&live, config, Arc::new(LogFailureSink))
        .with_context(|| format!("failed to install history for {}", args.table))?;

    Ok(InstallReport {
        contract_version: INSTALL_CONTRACT_VERSION.to_string(),
        live_entity: binding.live_entity,
        history_entity: binding.history_entity,
        history_table: binding.history_table,
        config: binding.config,
        captured_events: binding.captured_events,
        relations: binding.relations,
    })
}

fn list(host: &mut SqliteHost, args: &ListArgs) -> Result<ListReport> {
    let config = load_config(&args.config)?;
    let live = host
        .introspect(&args.table)
        .with_context(|| format!("failed to introspect table {}", args.table))?;
    let derived = derive_history_schema(&live, &config)?;
    if !host.table_exists(derived.table_name())? {
        return Err(anyhow!(
            "history table {} is not installed; run `th history install --table {}` first",
            derived.table_name(),
            args.table
        ));
    }

    let binding = host.bind_history(&live, config, Arc::new(LogFailureSink))?;
    let rows = match args.id.as_deref() {
        Some(raw) => host.history_of(&binding.live_entity, &parse_id(raw))?,
        None => host.find_all(&binding.history_entity, &Filter::new())?,
    };

    Ok(ListReport {
        contract_version: LIST_CONTRACT_VERSION.to_string(),
        live_entity: binding.live_entity,
        history_table: binding.history_table,
        rows,
    })
}

fn load_config(args: &ConfigArgs) -> Result<HistoryConfig> {
    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => HistoryConfig::default(),
    };
    if args.non_blocking {
        config.blocking = false;
    }
    if args.full {
        config.full = true;
    }
    if args.underscored {
        config.underscored = true;
    }
    Ok(config)
}

fn read_config(path: &Path) -> Result<HistoryConfig> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config {} is not valid JSON", path.display()))?;
    HistoryConfig::from_json(&value).with_context(|| format!("invalid config {}", path.display()))
}

fn parse_id(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_number() || value.is_string() => value,
        _ => Value::String(raw.to_string()),
    }
}
