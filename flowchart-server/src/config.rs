//! Configuration for the server

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flowchart_collab::RelayConfig;
use flowchart_core::GraphSnapshot;
use serde::{Deserialize, Serialize};

/// Side of the placeholder grid served when nothing was saved yet.
pub const GRID_SIZE: usize = 10;
pub const GRID_SPACING: f64 = 200.0;

/// What `GET /data` creates when no snapshot file exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DefaultGraph {
    /// No nodes, no edges
    #[default]
    Empty,
    /// A 10×10 grid of nodes spaced 200 apart
    Grid,
}

impl DefaultGraph {
    pub fn build(self) -> GraphSnapshot {
        match self {
            DefaultGraph::Empty => GraphSnapshot::default(),
            DefaultGraph::Grid => GraphSnapshot::grid(GRID_SIZE, GRID_SIZE, GRID_SPACING),
        }
    }
}

/// Server configuration
///
/// Usually loaded from a TOML file with [`Self::load`]. Every field has a
/// default suitable for local development.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    pub bind_addr: IpAddr,
    pub http: HttpConfig,
    pub relay: RelaySettings,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

/// The session relay's listener and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub port: u16,
    pub max_peers_per_room: usize,
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The single snapshot file.
    pub path: PathBuf,
    pub default_graph: DefaultGraph,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http: HttpConfig::default(),
            relay: RelaySettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            port: 9090,
            max_peers_per_room: relay.max_peers_per_room,
            broadcast_capacity: relay.broadcast_capacity,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data.json"),
            default_graph: DefaultGraph::Empty,
        }
    }
}

impl ServerConfig {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<ServerConfig> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: ServerConfig = toml::from_str(&s)?;
        Ok(config)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.http.port)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.relay.port)
    }

    pub(crate) fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.relay_addr().to_string(),
            max_peers_per_room: self.relay.max_peers_per_room,
            broadcast_capacity: self.relay.broadcast_capacity,
        }
    }
}
