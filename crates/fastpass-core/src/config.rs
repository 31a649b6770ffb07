//! # Top-Level Configuration
//!
//! Merges the proto/pacer/scheduler knobs (§6) into a single struct a host
//! loads from TOML, following `strata-bonding`'s config-loading pattern:
//! flat, `Default`-derived sections, parsed with `toml` + `serde`.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use fastpass_proto::connection::{ConnectionConfig, Role};
use fastpass_proto::pacer::PacerConfig;
use fastpass_scheduler::SchedulerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration for one endpoint's Fastpass runtime (§6
/// "Configuration parameters").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastpassConfig {
    pub role: Role,
    /// Local address the transport binds to.
    pub local_addr: SocketAddr,
    /// `ctrl_addr`: the arbiter's address (for an endpoint) or the address
    /// to listen for endpoints on (for an arbiter).
    pub ctrl_addr: SocketAddr,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pacer: PacerConfig,
}

impl FastpassConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}
