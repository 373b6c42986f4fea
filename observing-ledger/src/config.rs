//! Configuration for the observing ledger

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Observing ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservingConfig {
    /// Blocks a claim window stays open
    pub cnt_blocks_for_claiming: u64,

    /// Block interval (milliseconds)
    pub block_interval_ms: u64,
}

impl Default for ObservingConfig {
    fn default() -> Self {
        Self {
            cnt_blocks_for_claiming: 3,
            block_interval_ms: 1000,
        }
    }
}

impl ObservingConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Block interval
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms.max(1))
    }

    /// Wall-clock length of a claim window
    pub fn claim_window(&self) -> Duration {
        self.block_interval() * self.cnt_blocks_for_claiming as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_window() {
        let config = ObservingConfig {
            cnt_blocks_for_claiming: 4,
            block_interval_ms: 250,
        };
        assert_eq!(config.claim_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse() {
        let config: ObservingConfig = toml::from_str(
            r#"
            cnt_blocks_for_claiming = 2
            block_interval_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.cnt_blocks_for_claiming, 2);
        assert_eq!(config.block_interval(), Duration::from_millis(50));
    }
}
