//! Configuration management for a fleet server node.
//!
//! This module handles loading and validation of node configuration from TOML
//! files. Command-line overrides are applied by the binary after loading.

use crate::allocation::AllocationPolicy;
use anyhow::Context;
use fleet_core::ServerRole;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Node configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and role of this instance
    pub server: ServerSettings,
    /// Capacity thresholds used when choosing an instance
    #[serde(default)]
    pub allocation: AllocationPolicy,
    /// Waiting-room polling and retry settings
    #[serde(default)]
    pub placement: PlacementSettings,
    /// Resource deletion handling
    #[serde(default)]
    pub invalidation: InvalidationSettings,
    /// Heartbeat settings
    #[serde(default)]
    pub status: StatusSettings,
    /// Shared state store every node of the fleet connects to
    #[serde(default)]
    pub store: StoreSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Unique instance id, written as the key of this node's server record
    pub id: String,
    /// Workload category this instance serves
    pub role: ServerRole,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            id: "spawn-1".to_string(),
            role: ServerRole::Spawn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSettings {
    /// Interval between waiting-room decision passes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How long a session is left alone after a decision
    #[serde(default = "default_retry_window")]
    pub retry_window_ms: u64,
    /// Most sessions tracked by the retry window at once
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
    /// Where sessions without a better destination go
    #[serde(default = "default_role")]
    pub default_role: ServerRole,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_window() -> u64 {
    2000
}

fn default_retry_capacity() -> usize {
    4096
}

fn default_role() -> ServerRole {
    ServerRole::Spawn
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            retry_window_ms: default_retry_window(),
            retry_capacity: default_retry_capacity(),
            default_role: default_role(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationSettings {
    /// Grace period between evacuating a deleted resource and tearing it down
    #[serde(default = "default_teardown_delay")]
    pub teardown_delay_ms: u64,
    /// Lifetime of a locally cached resource record
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
}

fn default_teardown_delay() -> u64 {
    3000
}

fn default_cache_ttl() -> u64 {
    1000
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            teardown_delay_ms: default_teardown_delay(),
            cache_ttl_ms: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    1000
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

/// Which store implementation backs the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// A Redis server shared by the whole fleet
    Redis,
    /// Process-local maps, only useful for a single node on its own
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_kind")]
    pub backend: StoreKind,
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Namespace for every key and channel, so several fleets can share a server
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_store_kind() -> StoreKind {
    StoreKind::Redis
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "fleet".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_kind(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.placement.poll_interval_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.placement.retry_window_ms)
    }

    pub fn teardown_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation.teardown_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.invalidation.cache_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.status.heartbeat_interval_ms)
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.id.trim().is_empty() {
            return Err("Server id cannot be empty".to_string());
        }

        if self.allocation.capacity_ceiling == 0 {
            return Err("Capacity ceiling must be greater than zero".to_string());
        }
        if self.allocation.safety_margin >= self.allocation.capacity_ceiling {
            return Err("Safety margin must be less than the capacity ceiling".to_string());
        }

        if self.placement.poll_interval_ms == 0 {
            return Err("Placement poll interval must be greater than zero".to_string());
        }
        if self.placement.retry_capacity == 0 {
            return Err("Retry capacity must be greater than zero".to_string());
        }
        if self.status.heartbeat_interval_ms == 0 {
            return Err("Heartbeat interval must be greater than zero".to_string());
        }

        if self.store.backend == StoreKind::Redis {
            if self.store.url.trim().is_empty() {
                return Err("Store url cannot be empty".to_string());
            }
            if self.store.key_prefix.trim().is_empty() {
                return Err("Store key prefix cannot be empty".to_string());
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
