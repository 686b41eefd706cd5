//! Node configuration
//!
//! Tunables live in plain structs with defaults. The proxy/client role is
//! the only persisted setting; it is kept in a small sled tree in the data
//! directory and read once at start.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::network::NodeConfig;

/// Announce endpoints handed to the distribution network
pub const DEFAULT_ANNOUNCE_ENDPOINTS: &[&str] = &[
    "wss://tracker.openwebtorrent.com",
    "wss://tracker.btorrent.xyz:443/announce",
];

/// Which side of the trust protocol this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Role {
    /// Fetches origin content and seeds bundles
    Proxy,
    /// Resolves articles through proxy consensus
    Client,
}

impl Default for Role {
    fn default() -> Self {
        Role::Client
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Proxy => write!(f, "proxy"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Client-side trust settings
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Agreeing proxy responses needed before a content identifier is trusted
    pub consensus_threshold: usize,
    /// How long a fan-out waits for consensus before giving up
    pub fanout_timeout: Duration,
    /// Announce endpoints used when downloading bundles
    pub announce_endpoints: Vec<String>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 1,
            fanout_timeout: Duration::from_secs(30),
            announce_endpoints: default_announce_endpoints(),
        }
    }
}

/// Proxy-side bundle lifecycle settings
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Ready bundles idle for longer than this are evicted
    pub idle_threshold: Duration,
    /// Interval of the idle sweep
    pub sweep_interval: Duration,
    /// Limit for each individual origin fetch
    pub origin_timeout: Duration,
    /// Announce endpoints attached to seeded bundles
    pub announce_endpoints: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(2 * 60),
            sweep_interval: Duration::from_secs(10),
            origin_timeout: Duration::from_secs(30),
            announce_endpoints: default_announce_endpoints(),
        }
    }
}

fn default_announce_endpoints() -> Vec<String> {
    DEFAULT_ANNOUNCE_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}

/// Everything a node needs to start
#[derive(Clone, Default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub node: NodeConfig,
    pub trust: TrustConfig,
    pub lifecycle: LifecycleConfig,
}

/// Default data directory for node settings
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("p2p-wiki")
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Corrupt setting '{key}': {source}")]
    Corrupt {
        key: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

const ROLE_KEY: &str = "role";

/// Persisted node settings
pub struct NodeSettings {
    #[allow(dead_code)]
    db: sled::Db,
    settings: sled::Tree,
}

impl NodeSettings {
    /// Open or create the settings store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let db = sled::open(path)?;
        let settings = db.open_tree("settings")?;
        Ok(Self { db, settings })
    }

    /// Stored role, or the default (client) when never set
    pub fn role(&self) -> Result<Role, SettingsError> {
        match self.settings.get(ROLE_KEY)? {
            Some(raw) => bincode::deserialize(&raw).map_err(|source| SettingsError::Corrupt {
                key: ROLE_KEY,
                source,
            }),
            None => Ok(Role::default()),
        }
    }

    pub fn set_role(&self, role: Role) -> Result<(), SettingsError> {
        let raw = bincode::serialize(&role)?;
        self.settings.insert(ROLE_KEY, raw)?;
        self.settings.flush()?;
        info!("Stored role: {}", role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let trust = TrustConfig::default();
        assert_eq!(trust.consensus_threshold, 1);

        let lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.idle_threshold, Duration::from_secs(120));
        assert_eq!(lifecycle.sweep_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_role_defaults_to_client() {
        let dir = tempdir().unwrap();
        let settings = NodeSettings::open(dir.path()).unwrap();
        assert_eq!(settings.role().unwrap(), Role::Client);
    }

    #[test]
    fn test_role_persists() {
        let dir = tempdir().unwrap();
        {
            let settings = NodeSettings::open(dir.path()).unwrap();
            settings.set_role(Role::Proxy).unwrap();
        }
        let settings = NodeSettings::open(dir.path()).unwrap();
        assert_eq!(settings.role().unwrap(), Role::Proxy);
    }
}
