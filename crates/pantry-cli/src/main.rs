//! Pantry CLI
//!
//! Command-line interface for Pantry - offline-first recipes and collections.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pantry_core::{
    spawn_sync_service, Config, EntityType, NetworkMonitor, Resolution, SyncEngine, SyncHandle,
};

mod commands;
mod output;

use commands::entity::FieldArgs;
use commands::sync::Direction;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "pantry")]
#[command(about = "Pantry - offline-first recipe library")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file to use instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Treat the network as unavailable; changes are only queued
    #[arg(long, global = true)]
    offline: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status
    Status,
    /// Pull remote changes, then push local ones
    Sync,
    /// Pull remote changes only
    Pull,
    /// Push local changes only
    Push,
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: EntityCommands,
    },
    /// Manage collections
    Collection {
        #[command(subcommand)]
        command: EntityCommands,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Manage pending changes
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Manage failed changes
    Errors {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args)]
struct FieldFlags {
    /// Fields as a JSON object
    #[arg(short, long)]
    data: Option<String>,
    /// Name
    #[arg(short, long)]
    name: Option<String>,
    /// Description
    #[arg(long)]
    description: Option<String>,
}

impl From<FieldFlags> for FieldArgs {
    fn from(flags: FieldFlags) -> Self {
        FieldArgs {
            data: flags.data,
            name: flags.name,
            description: flags.description,
        }
    }
}

#[derive(Subcommand)]
enum EntityCommands {
    /// Create a new entry
    #[command(alias = "create")]
    Add {
        /// Entry ID
        id: String,
        #[command(flatten)]
        fields: FieldFlags,
    },
    /// Change fields of an entry
    #[command(alias = "edit")]
    Update {
        /// Entry ID
        id: String,
        #[command(flatten)]
        fields: FieldFlags,
    },
    /// Delete an entry
    #[command(alias = "rm")]
    Delete {
        /// Entry ID
        id: String,
    },
    /// List all entries
    #[command(alias = "ls")]
    List,
    /// Show one entry
    Show {
        /// Entry ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts waiting for a decision
    #[command(alias = "ls")]
    List,
    /// Resolve one conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// local, remote or merge
        resolution: Resolution,
        /// Explicit outcome; overrides the resolution
        #[command(flatten)]
        fields: FieldFlags,
    },
    /// Resolve every conflict the same way
    ResolveAll {
        /// local, remote or merge
        resolution: Resolution,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Drop all pending changes (local data is kept)
    Clear,
}

#[derive(Subcommand)]
enum ErrorCommands {
    /// Forget failed changes
    Clear,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, max_retries, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

impl Commands {
    /// Commands that change local data
    fn is_write(&self) -> bool {
        matches!(
            self,
            Commands::Recipe {
                command: EntityCommands::Add { .. }
                    | EntityCommands::Update { .. }
                    | EntityCommands::Delete { .. }
            } | Commands::Collection {
                command: EntityCommands::Add { .. }
                    | EntityCommands::Update { .. }
                    | EntityCommands::Delete { .. }
            } | Commands::Conflicts {
                command: ConflictCommands::Resolve { .. } | ConflictCommands::ResolveAll { .. }
            }
        )
    }

    /// Commands that read local data and benefit from fresh remote state
    fn is_read(&self) -> bool {
        matches!(
            self,
            Commands::Recipe {
                command: EntityCommands::List | EntityCommands::Show { .. }
            } | Commands::Collection {
                command: EntityCommands::List | EntityCommands::Show { .. }
            } | Commands::Conflicts {
                command: ConflictCommands::List
            }
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config =
        Config::load_with_cli_override(cli.config.as_ref()).context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    let network = Arc::new(NetworkMonitor::new(!cli.offline));
    let engine = SyncEngine::open(&config, network).context("Failed to open local store")?;
    let handle = spawn_sync_service(engine);

    let is_write = cli.command.is_write();

    // Sync before read commands (to get latest data)
    if cli.command.is_read() {
        auto_sync(&handle, &config, &output).await;
    }

    let result = run_command(cli.command, &handle, &config, &output).await;

    // Sync after write commands (to push changes)
    if is_write && result.is_ok() {
        auto_sync(&handle, &config, &output).await;
    }

    handle.shutdown().await;
    result
}

async fn run_command(
    command: Commands,
    handle: &SyncHandle,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        Commands::Status => commands::status::show(handle, config, output),
        Commands::Sync => commands::sync::sync(handle, config, Direction::Both, output).await,
        Commands::Pull => commands::sync::sync(handle, config, Direction::Pull, output).await,
        Commands::Push => commands::sync::sync(handle, config, Direction::Push, output).await,
        Commands::Recipe { command } => {
            handle_entity_command(EntityType::Recipe, command, handle, output).await
        }
        Commands::Collection { command } => {
            handle_entity_command(EntityType::Collection, command, handle, output).await
        }
        Commands::Conflicts { command } => handle_conflict_command(command, handle, output).await,
        Commands::Queue {
            command: QueueCommands::Clear,
        } => commands::queue::clear(handle, output).await,
        Commands::Errors {
            command: ErrorCommands::Clear,
        } => commands::queue::clear_errors(handle, output).await,
        Commands::Config { .. } => unreachable!(), // Handled in main
    }
}

async fn handle_entity_command(
    entity_type: EntityType,
    command: EntityCommands,
    handle: &SyncHandle,
    output: &Output,
) -> Result<()> {
    use commands::entity;

    match command {
        EntityCommands::Add { id, fields } => {
            entity::add(handle, entity_type, id, fields.into(), output).await
        }
        EntityCommands::Update { id, fields } => {
            entity::update(handle, entity_type, id, fields.into(), output).await
        }
        EntityCommands::Delete { id } => entity::delete(handle, entity_type, id, output).await,
        EntityCommands::List => entity::list(handle, entity_type, output).await,
        EntityCommands::Show { id } => entity::show(handle, entity_type, id, output).await,
    }
}

async fn handle_conflict_command(
    command: ConflictCommands,
    handle: &SyncHandle,
    output: &Output,
) -> Result<()> {
    match command {
        ConflictCommands::List => commands::conflicts::list(handle, output).await,
        ConflictCommands::Resolve {
            id,
            resolution,
            fields,
        } => commands::conflicts::resolve(handle, id, resolution, fields.into(), output).await,
        ConflictCommands::ResolveAll { resolution } => {
            commands::conflicts::resolve_all(handle, resolution, output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Level comes from `-v` (warn, info, debug, trace); `RUST_LOG` overrides it.
/// Logs go to `config.log_file` when set, stderr otherwise.
fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pantry_core={},pantry_cli={}", level, level)));

    let Some(log_path) = &config.log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    // Initialize file-based logging (ignore error if already initialized)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();
}

/// Auto-sync if a remote is configured, silently handles errors
async fn auto_sync(handle: &SyncHandle, config: &Config, output: &Output) {
    if let Err(e) = commands::sync::sync_quiet(handle, config).await {
        output.warn(&format!("Auto-sync failed: {}", e));
    }
}
