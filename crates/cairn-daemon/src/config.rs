//! Configuration file management.

use std::net::SocketAddrV4;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use cairn_dht::config::RouterConfig;
use cairn_proto::node::{NodeAddress, NodeId};

/// Complete daemon configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Routing core settings.
    #[serde(default)]
    pub router: RouterConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP port to listen on. 0 = OS-assigned ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Seed peers as `"ip:port/hex-node-id"` strings.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Milliseconds between router ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            seed_nodes: Vec::new(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from `$CAIRN_CONFIG` (default
    /// `cairn.toml`). A missing file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("CAIRN_CONFIG").unwrap_or_else(|_| "cairn.toml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config =
                    toml::from_str(&text).with_context(|| format!("parsing {path}"))?;
                tracing::info!(path = %path, "loaded configuration");
                Ok(config)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(error) => Err(error).with_context(|| format!("reading {path}")),
        }
    }
}

/// Parse one `"ip:port/hex-node-id"` seed entry.
pub fn parse_seed(entry: &str) -> anyhow::Result<(NodeId, NodeAddress)> {
    let (addr_part, id_part) = entry
        .split_once('/')
        .context("expected ip:port/hex-node-id")?;
    let sock: SocketAddrV4 = addr_part.parse().context("bad socket address")?;
    let raw = hex::decode(id_part).context("node id is not hex")?;
    let id = NodeId::from_bytes(&raw).context("node id is not 20 bytes")?;
    Ok((id, NodeAddress::from(sock)))
}

fn default_listen_port() -> u16 {
    6881
}

fn default_tick_interval_ms() -> u64 {
    250
}
