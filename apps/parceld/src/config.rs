//! Optional server configuration file.
//!
//! Holds the settings that have no positional argument:
//!
//! ```toml
//! root = "/srv/parcel"
//! bind_address = "0.0.0.0"
//! quota_poll_ms = 100
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use parcel_server::ServerConfig;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileConfig {
    /// Directory that remote paths resolve under.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Milliseconds between budget checks while the budget is spent.
    #[serde(default = "default_quota_poll_ms")]
    pub quota_poll_ms: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_quota_poll_ms() -> u64 {
    100
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            bind_address: default_bind_address(),
            quota_poll_ms: default_quota_poll_ms(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Combines the file settings with the command line. `root` from the
    /// command line wins over the file.
    pub fn into_server_config(
        self,
        port: u16,
        max_clients: usize,
        rate_limit: u64,
        root: Option<PathBuf>,
    ) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            port,
            max_clients,
            rate_limit,
            root: root.unwrap_or(self.root),
            quota_poll: Duration::from_millis(self.quota_poll_ms),
        }
    }
}
