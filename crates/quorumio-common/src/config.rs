//! Configuration types for QuorumIO
//!
//! This module defines configuration structures used across components.
//! Every section has defaults so a partial file (or none at all) is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "QUORUMIO";

/// Default number of writes retained for catch-up replay
pub const DEFAULT_WRITE_LOG_CAPACITY: usize = 1024;

/// Root configuration for QuorumIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Volume group replication configuration
    pub volume_group: VolumeGroupConfig,
    /// Client admission path configuration
    pub client: ClientConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional TOML file layered with
    /// `QUORUMIO__<SECTION>__<KEY>` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.volume_group.validate()
    }
}

/// Volume group replication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeGroupConfig {
    /// Replicas that must acknowledge a write before it is durable
    pub quorum_count: u32,
    /// Timeout for a single replica request
    pub io_timeout_ms: u64,
    /// Timeout for the open protocol round trips
    pub open_timeout_ms: u64,
    /// Number of recent writes kept for catch-up replay
    pub write_log_capacity: usize,
    /// Interval between group-info pushes while replicas are down
    pub group_check_interval_secs: u64,
}

impl Default for VolumeGroupConfig {
    fn default() -> Self {
        Self {
            quorum_count: 2,
            io_timeout_ms: 8_000,
            open_timeout_ms: 10_000,
            write_log_capacity: DEFAULT_WRITE_LOG_CAPACITY,
            group_check_interval_secs: 30,
        }
    }
}

impl VolumeGroupConfig {
    /// Per-request timeout
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Open protocol timeout
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Interval of the non-functional replica check
    #[must_use]
    pub const fn group_check_interval(&self) -> Duration {
        Duration::from_secs(self.group_check_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.quorum_count == 0 {
            return Err(Error::Configuration(
                "volume_group.quorum_count must be at least 1".to_string(),
            ));
        }
        if self.write_log_capacity == 0 {
            return Err(Error::Configuration(
                "volume_group.write_log_capacity must be at least 1".to_string(),
            ));
        }
        if self.io_timeout_ms == 0 || self.open_timeout_ms == 0 {
            return Err(Error::Configuration(
                "volume_group timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client admission path configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Route volume traffic through volume group coordinators
    pub volume_grouping: bool,
    /// Request serialization applied on dispatch
    pub serialization: SerializationMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            volume_grouping: true,
            serialization: SerializationMode::None,
        }
    }
}

/// Request serialization selected for the dispatch path
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    /// No additional serialization
    #[default]
    None,
    /// Serialize all mutations of a volume
    Volume,
    /// Serialize mutations per (volume, blob) pair
    Blob,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON formatted lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
