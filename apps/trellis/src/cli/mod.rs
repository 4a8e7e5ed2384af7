//! # Trellis CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Write a configuration file and create the stores
//! - `ingest` - Ingest an extraction batch from a file
//! - `snapshot` - Capture the graph and print its size
//! - `table-view` - Print or save the table projection of the graph
//! - `vector-view` - Print or save the vector encoding of the graph
//! - `recover` - Run crash recovery and finish pending commits
//! - `status` - Show store, pool and transaction status
//! - `server` - Start the HTTP server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trellis_core::TrellisError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Trellis - cross-modal knowledge engine
///
/// Stores extracted entities and relationships as one canonical graph with
/// propagated uncertainty, persisted atomically across a graph and a
/// relational store.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine configuration file (TOML)
    #[arg(
        short,
        long,
        global = true,
        env = "TRELLIS_CONFIG",
        default_value = "trellis.toml"
    )]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration and create empty stores
    Init {
        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Ingest an extraction batch (JSON)
    Ingest {
        /// Path to the batch file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Capture a snapshot of the current graph
    Snapshot,

    /// Project the current graph into a table
    TableView {
        /// Write the view to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Encode the current graph as vectors
    VectorView {
        /// Write the view to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Recover unfinished transactions and retry pending commits
    Recover {
        /// Compact the transaction log afterwards
        #[arg(long)]
        checkpoint: bool,
    },

    /// Show engine status
    Status,

    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// How often pending commits are retried
        #[arg(long, env = "TRELLIS_RETRY_INTERVAL_MS", default_value = "5000")]
        retry_interval_ms: u64,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

pub async fn execute(cli: Cli) -> Result<(), TrellisError> {
    let config = cli.config.as_path();
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(config, force, json_mode),
        Some(Commands::Ingest { file }) => cmd_ingest(config, &file, json_mode),
        Some(Commands::Snapshot) => cmd_snapshot(config, json_mode),
        Some(Commands::TableView { output }) => cmd_table_view(config, output.as_deref()),
        Some(Commands::VectorView { output }) => cmd_vector_view(config, output.as_deref()),
        Some(Commands::Recover { checkpoint }) => cmd_recover(config, checkpoint, json_mode),
        Some(Commands::Server {
            host,
            port,
            retry_interval_ms,
        }) => cmd_server(config, &host, port, retry_interval_ms).await,
        Some(Commands::Status) | None => cmd_status(config, json_mode),
    }
}
