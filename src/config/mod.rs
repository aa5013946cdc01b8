//! Configuration module for Phantom Portal
//!
//! Tunnels are described in a TOML file with an optional shared `[ssh]`
//! block and one `[[tunnels]]` entry per tunnel, or built from
//! environment variables.

mod env;
mod tunnel;

pub use env::DEFAULT_ENV_PREFIX;
pub use tunnel::{
    DynamicSocks5Config, Socks5Config, SshConfig, SshCredential, TunnelConfig,
    DYNAMIC_SOCKS5_PORT_OFFSET, LOCAL_FORWARD_HOST, SOCKS5_PORT_OFFSET,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_FILE_ENV: &str = "PHANTOM_CONFIG_FILE";

/// Config file used when nothing else is specified
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// SSH endpoint shared by tunnels that do not declare their own
    #[serde(default)]
    pub ssh: Option<SshConfig>,

    /// Tunnel entries
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    /// Tunnel list with the shared SSH endpoint filled in
    ///
    /// A tunnel-level `ssh` block replaces the shared one wholesale.
    pub fn into_tunnels(self) -> Vec<TunnelConfig> {
        let shared = self.ssh;
        self.tunnels
            .into_iter()
            .map(|mut tunnel| {
                if tunnel.ssh.is_none() {
                    tunnel.ssh = shared.clone();
                }
                tunnel
            })
            .collect()
    }
}

/// Pick the config file: explicit path, then `PHANTOM_CONFIG_FILE`, then
/// `config.toml`
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
