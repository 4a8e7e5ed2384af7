//! # CLI Command Implementations

use crate::api::{self, TableViewResponse, VectorViewResponse};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use trellis_core::{CommitOutcome, Engine, EngineConfig, FidelityReport, TrellisError};

/// Shipped example configuration, written by `trellis init`.
const EXAMPLE_CONFIG: &str = include_str!("../../../../config/trellis.example.toml");

// =============================================================================
// FILE LIMITS
// =============================================================================

/// Maximum size of a batch file (100 MB).
const MAX_INGEST_FILE_SIZE: u64 = 100 * 1024 * 1024;

fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TrellisError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TrellisError::Io(format!("cannot read file metadata: {e}")))?;

    if metadata.len() > max_size {
        return Err(TrellisError::InvalidInput(format!(
            "file size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, TrellisError> {
    let canonical = path.canonicalize().map_err(|e| {
        TrellisError::Io(format!("invalid file path '{}': {e}", path.display()))
    })?;

    if !canonical.is_file() {
        return Err(TrellisError::Io(format!(
            "path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Canonicalize the parent of an output path and require a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, TrellisError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        TrellisError::Io(format!(
            "invalid output directory '{}': {e}",
            parent.display()
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(TrellisError::Io(format!(
            "output directory '{}' is not a directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| TrellisError::Io("output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// HELPERS
// =============================================================================

fn open_engine(config_path: &Path) -> Result<Engine, TrellisError> {
    if !config_path.exists() {
        return Err(TrellisError::Config(format!(
            "{} not found; run `trellis init` first",
            config_path.display()
        )));
    }
    let config = EngineConfig::load(config_path)?;
    Engine::open(config)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, TrellisError> {
    serde_json::to_string_pretty(value).map_err(|e| TrellisError::Serialization(e.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), TrellisError> {
    println!("{}", to_json(value)?);
    Ok(())
}

/// Write a view to `output`, or to stdout when none is given.
fn emit_view<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), TrellisError> {
    let text = to_json(value)?;
    match output {
        Some(path) => {
            let path = validate_output_path(path)?;
            std::fs::write(&path, text)?;
            tracing::info!(path = %path.display(), "view written");
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn describe_fidelity(report: &FidelityReport) -> String {
    match &report.warning {
        Some(warning) => format!("{:.4} (warning: {warning})", report.fidelity_score),
        None => format!("{:.4}", report.fidelity_score),
    }
}

// =============================================================================
// INIT COMMAND
// =============================================================================

pub fn cmd_init(config_path: &Path, force: bool, json_mode: bool) -> Result<(), TrellisError> {
    if config_path.exists() && !force {
        return Err(TrellisError::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }
    std::fs::write(config_path, EXAMPLE_CONFIG)?;

    let config = EngineConfig::load(config_path)?;
    let storage = config.storage.clone();
    let engine = Engine::open(config)?;
    engine.shutdown();

    if json_mode {
        return print_json(&serde_json::json!({
            "config": config_path.to_string_lossy(),
            "storage": storage,
        }));
    }

    println!("Initialized Trellis");
    println!("  Config:     {}", config_path.display());
    println!("  Graph:      {}", storage.graph_path.display());
    println!("  Relational: {}", storage.relational_path.display());
    println!("  WAL:        {}", storage.wal_path.display());
    Ok(())
}

// =============================================================================
// INGEST COMMAND
// =============================================================================

pub fn cmd_ingest(config_path: &Path, file: &Path, json_mode: bool) -> Result<(), TrellisError> {
    let validated_path = validate_file_path(file)?;
    validate_file_size(&validated_path, MAX_INGEST_FILE_SIZE)?;
    let text = std::fs::read_to_string(&validated_path)?;

    tracing::info!(file = %validated_path.display(), "ingesting extraction batch");
    let engine = open_engine(config_path)?;
    let receipt = engine.ingest_json(&text)?;
    engine.shutdown();

    if json_mode {
        return print_json(&receipt);
    }

    println!("Transaction {}", receipt.tx_id);
    match &receipt.outcome {
        CommitOutcome::Committed => println!("  Outcome:       committed"),
        CommitOutcome::CommittedWithRetryPending { pending } => {
            let stores: Vec<&str> = pending.iter().map(|s| s.as_str()).collect();
            println!(
                "  Outcome:       committed, retry pending on {}",
                stores.join(", ")
            );
        }
    }
    println!("  Entities:      {}", receipt.entity_ids.len());
    println!("  Relationships: {}", receipt.relationship_ids.len());
    println!("  Fidelity:      {}", describe_fidelity(&receipt.fidelity));
    Ok(())
}

// =============================================================================
// SNAPSHOT & VIEW COMMANDS
// =============================================================================

pub fn cmd_snapshot(config_path: &Path, json_mode: bool) -> Result<(), TrellisError> {
    let engine = open_engine(config_path)?;
    let info = engine.snapshot()?;
    engine.shutdown();

    if json_mode {
        return print_json(&info);
    }

    println!("Snapshot {}", info.snapshot_id);
    println!("  Captured:      {}", info.captured_at.to_rfc3339());
    println!("  Entities:      {}", info.entities);
    println!("  Relationships: {}", info.relationships);
    Ok(())
}

/// Snapshots live in the engine's memory, so each view command captures
/// its own.
pub fn cmd_table_view(config_path: &Path, output: Option<&Path>) -> Result<(), TrellisError> {
    let engine = open_engine(config_path)?;
    let info = engine.snapshot()?;
    let view = engine.table_view(info.snapshot_id)?;
    engine.shutdown();

    emit_view(
        &TableViewResponse {
            graph_snapshot_id: info.snapshot_id,
            table: view.output,
            fidelity_report: view.report,
        },
        output,
    )
}

pub fn cmd_vector_view(config_path: &Path, output: Option<&Path>) -> Result<(), TrellisError> {
    let engine = open_engine(config_path)?;
    let info = engine.snapshot()?;
    let view = engine.vector_view(info.snapshot_id)?;
    engine.shutdown();

    emit_view(
        &VectorViewResponse {
            graph_snapshot_id: info.snapshot_id,
            vector: view.output,
            fidelity_report: view.report,
        },
        output,
    )
}

// =============================================================================
// RECOVER COMMAND
// =============================================================================

pub fn cmd_recover(config_path: &Path, checkpoint: bool, json_mode: bool) -> Result<(), TrellisError> {
    // opening the engine runs recovery
    let engine = open_engine(config_path)?;
    let recovery = engine.last_recovery().clone();
    let retry = engine.retry_pending();
    let kept = if checkpoint {
        Some(engine.checkpoint()?)
    } else {
        None
    };
    engine.shutdown();

    if json_mode {
        return print_json(&serde_json::json!({
            "recovery": recovery,
            "retry": retry,
            "checkpoint_kept": kept,
        }));
    }

    println!("Trellis Recovery");
    println!("================");
    println!("Aborted:        {}", recovery.aborted.len());
    println!("Replayed:       {}", recovery.replayed.len());
    println!("Retried:        {}", retry.committed.len());
    println!("Still pending:  {}", retry.still_pending.len());
    for tx_id in &retry.still_pending {
        println!("  {tx_id}");
    }
    if let Some(kept) = kept {
        println!("Log compacted, {kept} unfinished transactions kept");
    }
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

pub fn cmd_status(config_path: &Path, json_mode: bool) -> Result<(), TrellisError> {
    let engine = open_engine(config_path)?;
    let status = engine.status()?;
    let health = engine.health();
    engine.shutdown();

    if json_mode {
        return print_json(&serde_json::json!({
            "config": config_path.to_string_lossy(),
            "health": health,
            "status": status,
        }));
    }

    println!("Trellis Status");
    println!("==============");
    println!("Config:  {}", config_path.display());
    println!(
        "Health:  graph {}, relational {}",
        if health.graph { "ok" } else { "DOWN" },
        if health.relational { "ok" } else { "DOWN" }
    );
    println!();
    println!("Entities:          {}", status.entities);
    println!("Relationships:     {}", status.relationships);
    println!("Id mappings:       {}", status.relational.id_mappings);
    println!("Uncertainty log:   {}", status.relational.uncertainty_records);
    println!("Transactions:      {}", status.relational.transactions);
    println!();
    println!("Pending commits:   {}", status.transactions.pending_commit.len());
    println!("Log size:          {} bytes", status.transactions.wal_bytes);
    for pool in &status.pools {
        println!(
            "Pool {:<11} open {}, idle {}, leased {}, timeouts {}",
            pool.store.as_str(),
            pool.open,
            pool.idle,
            pool.leased,
            pool.acquire_timeouts
        );
    }
    Ok(())
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

pub async fn cmd_server(
    config_path: &Path,
    host: &str,
    port: u16,
    retry_interval_ms: u64,
) -> Result<(), TrellisError> {
    if retry_interval_ms == 0 {
        return Err(TrellisError::Config(
            "retry interval must be positive".to_string(),
        ));
    }
    let engine = Arc::new(open_engine(config_path)?);

    println!("Trellis Knowledge Engine Starting...");
    println!();
    println!("  Host:   {host}");
    println!("  Port:   {port}");
    println!("  Config: {}", config_path.display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{host}:{port}");
    api::run_server(&addr, engine, Duration::from_millis(retry_interval_ms)).await
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let config = dir.path().join("trellis.toml");
        std::fs::write(&config, "# mine\n").expect("write");
        let err = cmd_init(&config, false, true).expect_err("exists");
        assert!(err.to_string().contains("--force"));
        assert_eq!(std::fs::read_to_string(&config).expect("read"), "# mine\n");
    }

    #[test]
    fn output_path_needs_an_existing_directory() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let ok = validate_output_path(&dir.path().join("view.json")).expect("valid");
        assert!(ok.ends_with("view.json"));
        assert!(validate_output_path(&dir.path().join("missing/view.json")).is_err());
    }

    #[test]
    fn missing_config_points_at_init() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let err = open_engine(&dir.path().join("trellis.toml")).expect_err("no config");
        assert!(err.to_string().contains("trellis init"));
    }
}
