//! Fieldshift command-line interface.
//!
//! Inspects and maintains a Fieldshift data directory: classify type changes,
//! print dependency graphs, preview migrations, purge expired fields and
//! close interrupted migration jobs.

mod formatter;

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use fieldshift_core::coordinator::Actor;
use fieldshift_core::{
    Database, EngineConfig, FieldChanges, FieldType, StorageConfig, StorageConstraints,
    TypeCompatibilityMatrix,
};
use formatter::{create_formatter, OutputFormat};
use tracing_subscriber::EnvFilter;

/// Fieldshift command-line interface.
#[derive(Parser, Debug)]
#[command(name = "fieldshift")]
#[command(version, about = "Schema evolution tooling for Fieldshift pipelines")]
pub struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./fieldshift_data", global = true)]
    pub data: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify a field type change
    Classify {
        /// Current field type
        old: FieldType,
        /// Requested field type
        new: FieldType,
        /// Current maximum length
        #[arg(long)]
        old_max_length: Option<usize>,
        /// Requested maximum length
        #[arg(long)]
        new_max_length: Option<usize>,
        /// Requested change turns on uniqueness
        #[arg(long)]
        unique: bool,
    },
    /// Print the dependency graph of a pipeline
    Graph {
        /// Pipeline id
        pipeline_id: u64,
    },
    /// Preview a type change on stored records
    Preview {
        /// Field id
        field_id: u64,
        /// Requested field type
        #[arg(long = "type")]
        field_type: FieldType,
        /// Number of records to sample
        #[arg(long, default_value_t = 10)]
        sample: usize,
    },
    /// Hard-delete fields past their scheduled delete time
    Purge,
    /// Roll back migration jobs left running by an interrupted process
    Recover,
    /// List migration jobs
    Jobs,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] fieldshift_core::Error),

    #[error(transparent)]
    Schema(#[from] fieldshift_core::SchemaChangeError),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(u64),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fieldshift=info,fieldshift_core=info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let formatter = create_formatter(args.format);

    match args.command {
        Command::Classify {
            old,
            new,
            old_max_length,
            new_max_length,
            unique,
        } => {
            let old_constraints = StorageConstraints {
                max_length: old_max_length,
                enforce_uniqueness: false,
            };
            let new_constraints = StorageConstraints {
                max_length: new_max_length,
                enforce_uniqueness: unique,
            };
            let decision = TypeCompatibilityMatrix::standard().classify(
                old,
                new,
                &old_constraints,
                &new_constraints,
            );
            println!("{}", formatter.format_decision(&decision));
        }
        Command::Graph { pipeline_id } => {
            let database = open(args.data)?;
            let graph = database
                .dependency_graph(pipeline_id)?
                .ok_or(CliError::PipelineNotFound(pipeline_id))?;
            println!("{}", formatter.format_graph(&graph));
        }
        Command::Preview {
            field_id,
            field_type,
            sample,
        } => {
            let database = open(args.data)?;
            let changes = FieldChanges::default().change_type(field_type);
            let preview = database.preview_migration(field_id, &changes, sample)?;
            println!("{}", formatter.format_preview(&preview));
        }
        Command::Purge => {
            let database = open(args.data)?;
            let purged = database.purge_expired_fields(&Actor::system())?;
            database.flush()?;
            println!("{}", formatter.format_purged(&purged));
        }
        Command::Recover => {
            // Opening the database closes interrupted jobs.
            let database = open(args.data)?;
            database.flush()?;
            println!("{}", formatter.format_jobs(database.recovered_jobs()));
        }
        Command::Jobs => {
            let database = open(args.data)?;
            println!("{}", formatter.format_jobs(&database.migration_jobs()?));
        }
    }

    Ok(())
}

fn open(path: PathBuf) -> Result<Database, CliError> {
    tracing::debug!(path = %path.display(), "opening data directory");
    Ok(Database::open(EngineConfig::new(StorageConfig::new(path)))?)
}
