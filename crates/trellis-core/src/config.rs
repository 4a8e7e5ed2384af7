//! # Engine Configuration
//!
//! Loaded from TOML. Every field is required: there are no serde defaults
//! and no `Default` impl, so no tunable is baked into engine logic. See
//! `config/trellis.example.toml` for a commented example.

use crate::TrellisError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub transactions: TransactionConfig,
    pub transform: TransformConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// redb file backing the property graph.
    pub graph_path: PathBuf,
    /// SQLite file holding id mappings, provenance and the uncertainty log.
    pub relational_path: PathBuf,
    /// Transaction write-ahead log.
    pub wal_path: PathBuf,
}

/// Bounds of one store's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolBounds {
    pub min_size: usize,
    pub max_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub graph: PoolBounds,
    pub relational: PoolBounds,
    /// How long `acquire()` blocks before failing with `PoolExhausted`.
    pub acquire_timeout_ms: u64,
    /// Idle connections above `min_size` older than this are closed.
    pub idle_timeout_ms: u64,
    /// A lease held longer than this is revoked and its slot reclaimed.
    pub lease_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

impl PoolConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionConfig {
    /// Upper bound on the whole prepare phase; exceeded means abort.
    pub prepare_timeout_ms: u64,
    /// One commit retry per entry, each after sleeping that long.
    pub commit_retry_backoff_ms: Vec<u64>,
}

impl TransactionConfig {
    #[must_use]
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    #[must_use]
    pub fn backoff(&self) -> Vec<Duration> {
        self.commit_retry_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub fidelity_threshold: f64,
}

/// Uncertainty contributed by the pipeline stages after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub normalization_uncertainty: f64,
    pub persistence_uncertainty: f64,
}

impl EngineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, TrellisError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrellisError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, TrellisError> {
        let config: Self =
            toml::from_str(text).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot run.
    pub fn validate(&self) -> Result<(), TrellisError> {
        for (name, path) in [
            ("storage.graph_path", &self.storage.graph_path),
            ("storage.relational_path", &self.storage.relational_path),
            ("storage.wal_path", &self.storage.wal_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(TrellisError::Config(format!("{name} must not be empty")));
            }
        }

        for (name, bounds) in [
            ("pool.graph", self.pool.graph),
            ("pool.relational", self.pool.relational),
        ] {
            if bounds.max_size == 0 {
                return Err(TrellisError::Config(format!("{name}.max_size must be positive")));
            }
            if bounds.min_size > bounds.max_size {
                return Err(TrellisError::Config(format!(
                    "{name}.min_size {} exceeds max_size {}",
                    bounds.min_size, bounds.max_size
                )));
            }
        }

        for (name, ms) in [
            ("pool.acquire_timeout_ms", self.pool.acquire_timeout_ms),
            ("pool.lease_timeout_ms", self.pool.lease_timeout_ms),
            (
                "pool.health_check_interval_ms",
                self.pool.health_check_interval_ms,
            ),
            (
                "transactions.prepare_timeout_ms",
                self.transactions.prepare_timeout_ms,
            ),
        ] {
            if ms == 0 {
                return Err(TrellisError::Config(format!("{name} must be positive")));
            }
        }

        if self.transactions.commit_retry_backoff_ms.is_empty() {
            return Err(TrellisError::Config(
                "transactions.commit_retry_backoff_ms needs at least one entry".to_string(),
            ));
        }

        for (name, value) in [
            ("transform.fidelity_threshold", self.transform.fidelity_threshold),
            (
                "pipeline.normalization_uncertainty",
                self.pipeline.normalization_uncertainty,
            ),
            (
                "pipeline.persistence_uncertainty",
                self.pipeline.persistence_uncertainty,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrellisError::Config(format!(
                    "{name} = {value} must lie in [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// A complete configuration rooted at `dir`, for tests and `trellis init`.
    #[must_use]
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                graph_path: dir.join("graph.redb"),
                relational_path: dir.join("meta.sqlite"),
                wal_path: dir.join("transactions.wal"),
            },
            pool: PoolConfig {
                graph: PoolBounds {
                    min_size: 1,
                    max_size: 4,
                },
                relational: PoolBounds {
                    min_size: 1,
                    max_size: 4,
                },
                acquire_timeout_ms: 2_000,
                idle_timeout_ms: 60_000,
                lease_timeout_ms: 30_000,
                health_check_interval_ms: 10_000,
            },
            transactions: TransactionConfig {
                prepare_timeout_ms: 5_000,
                commit_retry_backoff_ms: vec![10, 50, 250],
            },
            transform: TransformConfig {
                fidelity_threshold: 0.95,
            },
            pipeline: PipelineConfig {
                normalization_uncertainty: 0.0,
                persistence_uncertainty: 0.0,
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
