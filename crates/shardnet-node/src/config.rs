//! Server configuration, parsed from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::discovery::Node;
use crate::error::NetError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// host:port for the TCP listener; discovery derives its UDP base from
    /// the same address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Opaque network discriminator (main net, test net, ...).
    #[serde(default)]
    pub network_id: u64,

    /// Node records dialed at start.
    #[serde(default)]
    pub static_nodes: Vec<Node>,

    /// Hex-encoded secp256k1 private key. Mandatory for `Server::new`;
    /// the binary fills it in from the identity key file.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Maximum number of connected peers.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Maximum number of connections pending in the handshake phase.
    /// Zero falls back to the built-in accept-slot count.
    #[serde(default)]
    pub max_pending_peers: usize,
}

fn default_listen_addr() -> String {
    "0.0.0.0:30616".into()
}

fn default_max_peers() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            network_id: 0,
            static_nodes: Vec::new(),
            private_key: None,
            max_peers: default_max_peers(),
            max_pending_peers: 0,
        }
    }
}

impl Config {
    /// Load the config at `path`, or fall back to defaults if it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, NetError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| NetError::Config(format!("{}: {e}", path.display())))
    }
}
