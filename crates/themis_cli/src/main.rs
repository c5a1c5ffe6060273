//! ThemisDB CLI
//!
//! Command-line tools for ThemisDB administration.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and index definitions
//! - `verify` - Verify the audit chain and registered file signatures
//! - `backup` - Create or restore checkpoints
//! - `rotate-dek` - Rotate the data-encryption key
//! - `changefeed` - Dump CDC events from a cursor
//!
//! # Exit codes
//!
//! `0` success; `2` invalid configuration; `3` integrity violation;
//! `4` key unavailable; `5` storage corruption; `1` other errors.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use themis_core::CoreError;
use tracing_subscriber::EnvFilter;

/// ThemisDB command-line administration tools.
#[derive(Parser)]
#[command(name = "themisdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Path to a JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and index definitions
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify the audit chain and registered file signatures
    Verify {
        /// Check the audit hash chain
        #[arg(short, long)]
        audit: bool,

        /// Check registered resource signatures against files on disk
        #[arg(short, long)]
        signatures: bool,
    },

    /// Create or restore checkpoints
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Rotate the data-encryption key (existing data upgrades lazily)
    RotateDek {
        /// Rotate a group DEK instead of the database DEK
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Dump CDC events from a cursor
    Changefeed {
        /// Resume cursor (exclusive)
        #[arg(short, long, default_value = "0")]
        from: u64,

        /// Maximum events to dump
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Only events whose key starts with this prefix
        #[arg(short, long)]
        key_prefix: Option<String>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Create a checkpoint of the database
    Create {
        /// Checkpoint output directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Restore a checkpoint into a new database directory
    Restore {
        /// Checkpoint to restore from
        #[arg(short, long)]
        input: PathBuf,

        /// Destination database directory
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code_of(&err))
        }
    }
}

fn exit_code_of(err: &themis_core::CoreError) -> u8 {
    match err.kind() {
        "ConfigInvalid" => 2,
        "AuthFailure" | "ChainViolation" => 3,
        "KeyUnavailable" => 4,
        "BadEncoding" | "IndexCorrupt" => 5,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<(), CoreError> {
    match cli.command {
        Commands::Inspect { format } => {
            let db = commands::open_database(cli.path, cli.config)?;
            commands::inspect::run(&db, &format)
        }
        Commands::Verify { audit, signatures } => {
            let db = commands::open_database(cli.path, cli.config)?;
            let check_all = !audit && !signatures;
            commands::verify::run(&db, audit || check_all, signatures || check_all)
        }
        Commands::Backup { action } => {
            match action {
                BackupAction::Create { output } => {
                    let db = commands::open_database(cli.path, cli.config)?;
                    db.backup(&output)?;
                    println!("checkpoint written to {}", output.display());
                }
                BackupAction::Restore { input, output } => {
                    commands::backup::restore(&input, &output)?;
                    println!("restored into {}", output.display());
                }
            }
            Ok(())
        }
        Commands::RotateDek { group } => {
            let db = commands::open_database(cli.path, cli.config)?;
            let version = match group {
                Some(group) => db.rotate_group_dek(&group)?,
                None => db.rotate_dek()?,
            };
            println!("rotated to key version {version}");
            Ok(())
        }
        Commands::Changefeed {
            from,
            limit,
            key_prefix,
        } => {
            let db = commands::open_database(cli.path, cli.config)?;
            commands::changefeed::run(&db, from, limit, key_prefix.as_deref())
        }
        Commands::Version => {
            println!("ThemisDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("ThemisDB Core v{}", themis_core::VERSION);
            Ok(())
        }
    }
}
