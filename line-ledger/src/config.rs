//! Configuration for the line ledger

use crate::types::{Equivalent, Precision};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// How often the sweeper looks for expired reservations (milliseconds)
    pub sweep_interval_ms: u64,

    /// Fractional digits used for equivalents not listed below
    pub default_precision: u32,

    /// Per-equivalent precision overrides
    #[serde(default)]
    pub equivalents: Vec<EquivalentConfig>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/node"),
            rocksdb: RocksDBConfig::default(),
            sweep_interval_ms: 500,
            default_precision: 2,
            equivalents: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// Precision table derived from the configuration
    pub fn precision(&self) -> Precision {
        self.equivalents
            .iter()
            .fold(Precision::new(self.default_precision), |precision, eq| {
                precision.with_scale(Equivalent::new(eq.id), eq.precision)
            })
    }
}

/// Precision override for one equivalent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalentConfig {
    /// Equivalent ID
    pub id: u32,

    /// Fractional digits
    pub precision: u32,
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 16,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}
