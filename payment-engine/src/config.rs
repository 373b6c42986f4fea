//! Configuration for a payment node

use line_ledger::{LedgerConfig, NodeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identifier, unique within the network
    pub node_id: String,

    /// Settlement line ledger and storage
    pub ledger: LedgerConfig,

    /// Maximum intermediate nodes a reservation request may traverse
    pub max_hops: u32,

    /// Maximum paths considered per transaction
    pub max_paths: usize,

    /// Reservation rounds before giving up with insufficient funds
    pub max_path_search_rounds: u32,

    /// TTL of reservations made before voting (milliseconds)
    pub reservation_ttl_ms: u64,

    /// Per-hop timeout of protocol requests (milliseconds)
    pub hop_timeout_ms: u64,

    /// Wait for the final broadcast before entering recovery (milliseconds)
    pub waiting_participants_votes_ms: u64,

    /// Recovery polls before deferring to the observing ledger
    pub node_payment_recovery_attempts: u32,

    /// Interval between recovery polls (milliseconds)
    pub node_payment_recovery_time_period_ms: u64,

    /// Hex encoded Ed25519 seed; generated and persisted when unset
    #[serde(default)]
    pub key_seed: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            ledger: LedgerConfig::default(),
            max_hops: 5,
            max_paths: 16,
            max_path_search_rounds: 3,
            reservation_ttl_ms: 30_000,
            hop_timeout_ms: 2_000,
            waiting_participants_votes_ms: 5_000,
            node_payment_recovery_attempts: 3,
            node_payment_recovery_time_period_ms: 1_000,
            key_seed: None,
        }
    }
}

impl Config {
    /// Configuration for a named node storing its data under `data_dir`
    pub fn for_node(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config {
            node_id: node_id.into(),
            ..Config::default()
        };
        config.ledger.data_dir = data_dir.into();
        config
    }

    /// Node identifier
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    /// Reservation TTL
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }

    /// Timeout of a request travelling `hops` hops
    pub fn hop_timeout(&self, hops: usize) -> Duration {
        Duration::from_millis(self.hop_timeout_ms.saturating_mul(hops.max(1) as u64))
    }

    /// Wait for the final broadcast
    pub fn waiting_participants_votes(&self) -> Duration {
        Duration::from_millis(self.waiting_participants_votes_ms)
    }

    /// Interval between recovery polls
    pub fn recovery_period(&self) -> Duration {
        Duration::from_millis(self.node_payment_recovery_time_period_ms)
    }

    /// Sweeper period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ledger.sweep_interval_ms.max(1))
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::Config("node_id must not be empty".to_string()));
        }
        if self.max_paths == 0 {
            return Err(crate::Error::Config("max_paths must be positive".to_string()));
        }
        if self.max_path_search_rounds == 0 {
            return Err(crate::Error::Config(
                "max_path_search_rounds must be positive".to_string(),
            ));
        }
        if self.hop_timeout_ms == 0 || self.reservation_ttl_ms == 0 {
            return Err(crate::Error::Config(
                "timeouts and TTLs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(id) = std::env::var("CREDITNET_NODE_ID") {
            config.node_id = id;
        }

        if let Ok(dir) = std::env::var("CREDITNET_DATA_DIR") {
            config.ledger.data_dir = PathBuf::from(dir);
        }

        if let Ok(seed) = std::env::var("CREDITNET_KEY_SEED") {
            config.key_seed = Some(seed);
        }

        config.max_hops = env_number("CREDITNET_MAX_HOPS", config.max_hops)?;
        config.reservation_ttl_ms =
            env_number("CREDITNET_RESERVATION_TTL_MS", config.reservation_ttl_ms)?;
        config.waiting_participants_votes_ms = env_number(
            "CREDITNET_WAITING_PARTICIPANTS_VOTES_MS",
            config.waiting_participants_votes_ms,
        )?;
        config.node_payment_recovery_attempts = env_number(
            "CREDITNET_RECOVERY_ATTEMPTS",
            config.node_payment_recovery_attempts,
        )?;
        config.node_payment_recovery_time_period_ms = env_number(
            "CREDITNET_RECOVERY_PERIOD_MS",
            config.node_payment_recovery_time_period_ms,
        )?;

        config.validate()?;
        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> crate::Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| crate::Error::Config(format!("{} is not a valid number: {}", name, value))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_hops, 5);
        assert_eq!(config.max_paths, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hop_timeout_scales_with_hops() {
        let config = Config::default();
        assert_eq!(config.hop_timeout(3), Duration::from_millis(6_000));
        assert_eq!(config.hop_timeout(0), Duration::from_millis(2_000));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        let mut config = Config::for_node("alice", dir.path().join("db"));
        config.max_hops = 3;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, "alice");
        assert_eq!(loaded.max_hops, 3);
        assert_eq!(loaded.ledger.data_dir, dir.path().join("db"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.max_paths = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
