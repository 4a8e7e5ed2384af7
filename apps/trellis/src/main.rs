//! # Trellis - Knowledge Engine Server
//!
//! The main binary of the Trellis cross-modal knowledge engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                 apps/trellis (THE BINARY)              │
//! │                                                        │
//! │      ┌─────────────┐            ┌─────────────┐        │
//! │      │    CLI      │            │  HTTP API   │        │
//! │      │   (clap)    │            │   (axum)    │        │
//! │      └──────┬──────┘            └──────┬──────┘        │
//! │             └────────────┬─────────────┘               │
//! │                          ▼                             │
//! │                 ┌─────────────────┐                    │
//! │                 │  trellis-core   │                    │
//! │                 │   (THE LOGIC)   │                    │
//! │                 └─────────────────┘                    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! trellis init
//! trellis ingest -f batch.json
//! trellis table-view -o table.json
//! trellis server --host 0.0.0.0 --port 8080
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis::cli;

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // TRELLIS_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TRELLIS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trellis=info,trellis_core=info,tower_http=debug".into());

    // logs go to stderr so --json-mode output on stdout stays parseable
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!(code = e.code().as_str(), "{e}");
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r"
  ▀█▀ █▀█ █▀▀ █   █   █ █▀
   █  █▀▄ ██▄ █▄▄ █▄▄ █ ▄█

  Knowledge Engine v{}
",
        env!("CARGO_PKG_VERSION")
    );
}
