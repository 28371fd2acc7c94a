//! Configuration for the generator process.
//!
//! The supervisor spawns the generator with a TOML configuration file naming
//! the mode, the local sockets, and the upstream endpoints. Server mode talks
//! to one or more bitcoind instances (`[[node]]` tables); proxy mode talks to
//! one or more upstream stratum pools (`[[pool]]` tables).

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration record.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Run as a stratum proxy instead of fetching work from bitcoind
    #[serde(default)]
    pub proxy: bool,

    /// Pool payout address, validated against the node at startup
    #[serde(default)]
    pub btcaddress: String,

    /// Local socket paths
    pub sockets: SocketsConfig,

    /// Bitcoind endpoints (server mode)
    #[serde(default)]
    pub node: Vec<NodeConfig>,

    /// Upstream pool endpoints (proxy mode)
    #[serde(default)]
    pub pool: Vec<PoolConfig>,
}

/// Unix-domain socket paths shared with the supervisor and stratifier.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketsConfig {
    /// The generator's own control socket
    pub control: PathBuf,

    /// The stratifier's socket, for outbound notifications
    pub stratifier: PathBuf,

    /// The supervisor's socket, messaged on fatal exit
    pub supervisor: PathBuf,
}

/// One bitcoind endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// RPC endpoint, `host:port` with an optional `http://` prefix
    pub url: String,

    /// RPC username
    pub auth: String,

    /// RPC password
    pub pass: String,
}

/// One upstream stratum pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Pool address, `host:port`
    pub url: String,

    /// Worker username
    pub auth: String,

    /// Worker password
    pub pass: String,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.proxy {
            if self.pool.is_empty() {
                return Err(Error::Config(
                    "proxy mode requires at least one [[pool]] entry".to_string(),
                ));
            }
        } else if self.node.is_empty() {
            return Err(Error::Config(
                "server mode requires at least one [[node]] entry".to_string(),
            ));
        }
        Ok(())
    }
}
