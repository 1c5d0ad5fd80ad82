//! Crankshaft CLI - inspect manifests and audit trails, and run the demo host.

mod commands;
mod demo;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use crankshaft_host::{init_logging, load_config, HostConfig};

#[derive(Debug, Parser)]
#[command(name = "crankshaft")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extension host with capability-mediated core services", long_about = None)]
struct Cli {
    /// Sets the level of verbosity
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Host configuration file (TOML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a manifest file
    Validate {
        /// Path to the manifest file
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
    },

    /// List the manifests found in an extensions directory
    Discover {
        /// Directory to scan; defaults to the configured extensions_dir
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Load every extension in a directory into the demo host
    Load {
        /// Directory to scan; defaults to the configured extensions_dir
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Print load reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query a persisted audit log
    Audit {
        /// Audit log file; defaults to the configured audit_log_path
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,

        /// Only records for this extension identity
        #[arg(long, value_name = "IDENTITY")]
        extension: Option<String>,

        /// Only records with this outcome, e.g. denied-revoked
        #[arg(long)]
        outcome: Option<String>,

        /// Only records for this capability kind
        #[arg(long)]
        kind: Option<String>,

        /// Maximum number of records, newest first
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Write the effective configuration to a file
    InitConfig {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Run the built-in demo extensions
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HostConfig::default(),
    };
    match cli.verbose {
        0 => {}
        1 => config.log_level = "debug".to_string(),
        _ => config.log_level = "trace".to_string(),
    }
    init_logging(&config);

    match cli.command {
        Commands::Validate { manifest } => commands::validate::execute(&manifest),
        Commands::Discover { dir } => {
            commands::discover::execute(&dir.unwrap_or_else(|| config.extensions_dir.clone()))
        }
        Commands::Load { dir, json } => {
            let dir = dir.unwrap_or_else(|| config.extensions_dir.clone());
            commands::load::execute(&config, &dir, json).await
        }
        Commands::Audit {
            log,
            extension,
            outcome,
            kind,
            limit,
        } => {
            let filter = commands::audit::AuditFilter {
                extension,
                outcome,
                kind,
                limit,
            };
            commands::audit::execute(&config, log, &filter)
        }
        Commands::InitConfig { path } => commands::init_config::execute(&config, &path),
        Commands::Demo => demo::run(&config).await,
    }
}
